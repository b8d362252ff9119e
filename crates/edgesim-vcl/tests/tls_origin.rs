mod support;

use std::fs;
use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use edgesim_vcl::config::Options;
use edgesim_vcl::http::Request;
use edgesim_vcl::interp::Interpreter;
use edgesim_vcl::{MemoryResolver, load_program};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use support::net::{ok_response, read_request_text, skip_if_loopback_unavailable};

struct TestPki {
    ca_pem: String,
    server: Arc<ServerConfig>,
}

fn test_pki() -> TestPki {
    let ca_key = KeyPair::generate().expect("ca key");
    let mut ca_params = CertificateParams::new(vec!["edgesim test ca".to_string()]).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let leaf_key = KeyPair::generate().expect("leaf key");
    let leaf_params = CertificateParams::new(vec!["127.0.0.1".to_string()]).expect("leaf params");
    let leaf = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("leaf cert");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(
            vec![leaf.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        )
        .expect("server config");
    TestPki {
        ca_pem: ca_cert.pem(),
        server: Arc::new(server),
    }
}

/// Accepts connections until the listener errors, answering each over TLS.
fn spawn_tls_origin(config: Arc<ServerConfig>, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind tls origin");
    let port = listener.local_addr().expect("origin addr").port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let Ok(conn) = ServerConnection::new(Arc::clone(&config)) else {
                continue;
            };
            let mut tls = StreamOwned::new(conn, stream);
            let request = read_request_text(&mut tls);
            if request.is_empty() {
                continue;
            }
            let _ = tls.write_all(ok_response(&["Content-Type: text/plain"], body).as_bytes());
            tls.conn.send_close_notify();
            let _ = tls.flush();
        }
    });
    port
}

fn temp_ca_file(pem: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "edgesim_tls_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ));
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("ca.pem");
    fs::write(&path, pem).expect("write ca");
    path
}

fn interpreter(port: u16, options: Options) -> Interpreter {
    let src = format!(
        "backend F_secure {{ .host = \"127.0.0.1\"; .port = \"{port}\"; .ssl = true; }}\nsub vcl_recv {{\n  return(pass);\n}}\n"
    );
    let (program, diags) = load_program("main.vcl", &src, &MemoryResolver::default());
    assert!(diags.is_empty(), "{diags:?}");
    Interpreter::new(program, options).expect("program initializes")
}

#[test]
fn https_origin_is_trusted_through_the_configured_ca() {
    if skip_if_loopback_unavailable("https_origin_is_trusted_through_the_configured_ca") {
        return;
    }
    let pki = test_pki();
    let port = spawn_tls_origin(Arc::clone(&pki.server), "secure hello");
    let ca_file = temp_ca_file(&pki.ca_pem);
    let interp = interpreter(
        port,
        Options {
            ca_file: Some(ca_file.clone()),
            ..Options::default()
        },
    );

    let outcome = interp.process(Request::new("GET", "/"));
    assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
    let response = outcome.response.expect("response");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"secure hello".to_vec());
    assert_eq!(outcome.trace.backend.as_deref(), Some("F_secure"));

    let _ = fs::remove_file(ca_file);
}

#[test]
fn https_origin_with_unknown_issuer_is_rejected() {
    if skip_if_loopback_unavailable("https_origin_with_unknown_issuer_is_rejected") {
        return;
    }
    let pki = test_pki();
    let port = spawn_tls_origin(Arc::clone(&pki.server), "unreachable");
    let interp = interpreter(port, Options::default());

    let outcome = interp.process(Request::new("GET", "/"));
    assert_eq!(outcome.status(), 500);
    let message = outcome.error.map(|err| err.message).unwrap_or_default();
    assert!(
        message.starts_with("Failed to retrieve backend response from F_secure"),
        "{message}"
    );
}
