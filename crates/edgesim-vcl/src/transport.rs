//! Outbound leg: turns the elected backend and the client request into a
//! backend request, and exchanges it with the origin over TCP or TLS.

use std::fs::File;
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hmac::{Hmac, Mac};
use regex::Regex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use sha2::Sha256;

use crate::ast::{ExprKind, PropValue};
use crate::cache::served_by;
use crate::config::{Options, OverrideBackend};
use crate::director::Backend;
use crate::exception::Exception;
use crate::http::{Request, Response, read_response, write_request};
use crate::value::Value;

pub const DEFAULT_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Key of the `Fastly-FF` signature.
const SERVICE_ID: &str = "edgesim";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a backend request goes.
#[derive(Clone, Debug)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Target {
    pub fn new(scheme: Scheme, host: &str, port: u16) -> Self {
        Self {
            scheme,
            host: host.to_string(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: DEFAULT_FIRST_BYTE_TIMEOUT,
        }
    }

    /// `Host` header form: the port only when it is not the scheme default.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Splits an absolute `http(s)://` URL into a target and path.
    pub fn from_url(url: &str) -> Option<(Target, String)> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return None;
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (host, port) = split_host_port(authority, scheme.default_port());
        if host.is_empty() {
            return None;
        }
        Some((Target::new(scheme, &host, port), path))
    }
}

fn split_host_port(raw: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = raw.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    (raw.to_string(), default_port)
}

/// `*` and `?` globs over backend names.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

fn rtime_prop(backend: &Backend, key: &str) -> Option<Duration> {
    backend.props.iter().find_map(|prop| match &prop.value {
        PropValue::Expr(expr) if prop.key.name == key => match expr.kind {
            ExprKind::RTime(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        },
        _ => None,
    })
}

#[derive(Debug)]
pub struct Transport {
    overrides: Vec<(Regex, OverrideBackend)>,
    ca_file: Option<PathBuf>,
    datacenter: String,
    tls: OnceLock<Result<Arc<ClientConfig>, String>>,
}

impl Transport {
    pub fn new(options: &Options, datacenter: &str) -> Result<Self, Exception> {
        let mut overrides = Vec::with_capacity(options.override_backends.len());
        for (pattern, record) in &options.override_backends {
            let re = glob_to_regex(pattern).map_err(|err| {
                Exception::system(format!("Invalid glob pattern is provided: {pattern}, {err}"))
            })?;
            overrides.push((re, record.clone()));
        }
        Ok(Self {
            overrides,
            ca_file: options.ca_file.clone(),
            datacenter: datacenter.to_string(),
            tls: OnceLock::new(),
        })
    }

    fn override_for(&self, name: &str) -> Option<&OverrideBackend> {
        self.overrides
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, record)| record)
    }

    /// Resolves scheme, host and port for a backend, applying overrides.
    pub fn target(&self, backend: &Backend) -> Result<Target, Exception> {
        let record = self.override_for(&backend.name);
        let ssl = record
            .and_then(|r| r.ssl)
            .unwrap_or_else(|| backend.bool_prop("ssl"));
        let scheme = if ssl { Scheme::Https } else { Scheme::Http };
        let host = record
            .and_then(|r| r.host.clone())
            .or_else(|| backend.string_prop("host"))
            .ok_or_else(|| {
                Exception::runtime_bare(format!("Failed to find host for backend {}", backend.name))
            })?;
        let declared_port = backend
            .string_prop("port")
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or_else(|| scheme.default_port());
        let (host, port) = split_host_port(&host, declared_port);
        let mut target = Target::new(scheme, &host, port);
        if let Some(timeout) = rtime_prop(backend, "first_byte_timeout") {
            target.timeout = timeout;
        }
        if let Some(timeout) = rtime_prop(backend, "connect_timeout") {
            target.connect_timeout = timeout;
        }
        Ok(target)
    }

    /// Clone of the client request addressed to `backend`.
    pub fn backend_request(&self, backend: &Backend, target: &Target, inbound: &Request) -> Request {
        let mut bereq = inbound.clone();
        if backend.bool_prop("always_use_host_header") || !bereq.header.contains("Host") {
            bereq.header.set("Host", Value::string(target.authority()));
        }
        let signature = self.fastly_ff();
        let forwarded = match bereq.header.get_raw("Fastly-FF") {
            Some(existing) => format!("{existing}, {signature}"),
            None => signature,
        };
        bereq.header.set("Fastly-FF", Value::string(forwarded));
        bereq
    }

    fn fastly_ff(&self) -> String {
        let digest = match Hmac::<Sha256>::new_from_slice(SERVICE_ID.as_bytes()) {
            Ok(mut mac) => {
                mac.update(self.datacenter.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        };
        format!(
            "{}!{}!{}",
            edgesim_rt::bytes::encode_base64(&digest),
            self.datacenter,
            served_by(&self.datacenter)
        )
    }

    /// One request/response exchange; the connection is not reused.
    pub fn send(&self, target: &Target, req: &Request) -> Result<Response, String> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|err| format!("failed to resolve {}: {err}", target.authority()))?
            .next()
            .ok_or_else(|| format!("no address for {}", target.authority()))?;
        let stream = TcpStream::connect_timeout(&addr, target.connect_timeout)
            .map_err(|err| format!("failed to connect {}: {err}", target.authority()))?;
        stream
            .set_read_timeout(Some(target.timeout))
            .and_then(|_| stream.set_write_timeout(Some(target.timeout)))
            .map_err(|err| format!("failed to configure socket: {err}"))?;

        let mut outbound = req.clone();
        if !outbound.header.contains("Host") {
            outbound.header.set("Host", Value::string(target.authority()));
        }
        match target.scheme {
            Scheme::Http => {
                let mut stream = stream;
                write_request(&mut stream, &outbound)?;
                read_response(&mut stream, &outbound.method)
            }
            Scheme::Https => {
                let config = self.tls_config()?;
                let name = ServerName::try_from(target.host.clone())
                    .map_err(|err| format!("invalid TLS server name {}: {err}", target.host))?;
                let conn = ClientConnection::new(config, name)
                    .map_err(|err| format!("TLS setup failed: {err}"))?;
                let mut tls = StreamOwned::new(conn, stream);
                write_request(&mut tls, &outbound)?;
                tls.flush()
                    .map_err(|err| format!("failed to write request: {err}"))?;
                read_response(&mut tls, &outbound.method)
            }
        }
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>, String> {
        self.tls
            .get_or_init(|| build_tls_config(self.ca_file.as_ref()))
            .clone()
    }
}

fn build_tls_config(ca_file: Option<&PathBuf>) -> Result<Arc<ClientConfig>, String> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        edgesim_rt::log::debug(&format!(
            "skipped {} unreadable native certificates",
            native.errors.len()
        ));
    }
    roots.add_parsable_certificates(native.certs);
    if let Some(path) = ca_file {
        let file = File::open(path)
            .map_err(|err| format!("failed to open CA file {}: {err}", path.display()))?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert =
                cert.map_err(|err| format!("invalid CA file {}: {err}", path.display()))?;
            roots
                .add(cert)
                .map_err(|err| format!("invalid CA certificate in {}: {err}", path.display()))?;
        }
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| format!("TLS setup failed: {err}"))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
