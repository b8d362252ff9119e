//! `edgesim.toml` manifest and the simulator options derived from it.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use edgesim_rt::config as rt_config;
use serde::Deserialize;

pub const MANIFEST_NAME: &str = "edgesim.toml";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3124;

#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub override_backends: BTreeMap<String, OverrideBackend>,
    #[serde(default)]
    pub edge_dictionary: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PackageConfig {
    pub name: Option<String>,
    #[serde(alias = "main")]
    pub entry: Option<String>,
    #[serde(default)]
    pub include_paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_requests: Option<usize>,
    pub mode: Option<String>,
    pub datacenter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub coverage: bool,
    pub max_backends: Option<usize>,
    pub max_acls: Option<usize>,
    pub ca_file: Option<String>,
}

/// Per-backend replacement selected by glob on the backend name.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OverrideBackend {
    pub host: Option<String>,
    pub ssl: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerMode {
    /// Respond with the JSON process trace.
    #[default]
    Trace,
    /// Respond with the simulated edge response itself.
    Response,
}

impl ServerMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "trace" => Some(ServerMode::Trace),
            "response" => Some(ServerMode::Response),
            _ => None,
        }
    }
}

/// `[server]` after environment overrides and defaults.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_requests: Option<usize>,
    pub mode: ServerMode,
}

impl ServerConfig {
    pub fn resolve(&self) -> Result<ServerSettings, String> {
        let host = rt_config::env_override("server", "host")
            .or_else(|| self.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match rt_config::env_override("server", "port") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                format!(
                    "invalid {} value: {raw}",
                    rt_config::env_key("server", "port")
                )
            })?,
            None => self.port.unwrap_or(DEFAULT_PORT),
        };
        let max_requests = match rt_config::env_override("server", "max_requests") {
            Some(raw) => Some(raw.trim().parse::<usize>().map_err(|_| {
                format!(
                    "invalid {} value: {raw}",
                    rt_config::env_key("server", "max_requests")
                )
            })?),
            None => self.max_requests,
        };
        let raw_mode = rt_config::env_override("server", "mode").or_else(|| self.mode.clone());
        let mode = match raw_mode {
            Some(raw) => ServerMode::parse(&raw)
                .ok_or_else(|| format!("invalid server mode: {raw} (expected trace|response)"))?,
            None => ServerMode::Trace,
        };
        Ok(ServerSettings {
            host,
            port,
            max_requests,
            mode,
        })
    }

    pub fn datacenter(&self) -> Option<String> {
        rt_config::env_override("server", "datacenter").or_else(|| self.datacenter.clone())
    }
}

/// Everything the interpreter reads from configuration.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub coverage: bool,
    pub max_backends: usize,
    pub max_acls: usize,
    pub ca_file: Option<PathBuf>,
    pub datacenter: Option<String>,
    pub override_backends: Vec<(String, OverrideBackend)>,
    pub edge_dictionary: BTreeMap<String, BTreeMap<String, String>>,
}

impl Manifest {
    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|err| format!("invalid manifest: {err}"))
    }

    /// Simulator options; relative paths resolve against `base`.
    pub fn options(&self, base: Option<&Path>) -> Options {
        let ca_file = self.simulator.ca_file.as_ref().map(|path| match base {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        });
        Options {
            coverage: self.simulator.coverage,
            max_backends: self.simulator.max_backends.unwrap_or(0),
            max_acls: self.simulator.max_acls.unwrap_or(0),
            ca_file,
            datacenter: self.server.datacenter(),
            override_backends: self
                .override_backends
                .iter()
                .map(|(pattern, record)| (pattern.clone(), record.clone()))
                .collect(),
            edge_dictionary: self.edge_dictionary.clone(),
        }
    }

    pub fn include_paths(&self, base: Option<&Path>) -> Vec<PathBuf> {
        self.package
            .include_paths
            .iter()
            .map(|path| match base {
                Some(base) => base.join(path),
                None => PathBuf::from(path),
            })
            .collect()
    }
}

/// Loads the manifest at `manifest_override` (a file or a directory holding
/// one), or the nearest one above the working directory.
pub fn load_manifest(
    manifest_override: Option<&Path>,
) -> Result<(Option<Manifest>, Option<PathBuf>), String> {
    let (manifest_path, manifest_dir) = if let Some(path) = manifest_override {
        if path.is_dir() {
            (Some(path.join(MANIFEST_NAME)), Some(path.to_path_buf()))
        } else {
            (
                Some(path.to_path_buf()),
                path.parent().map(|p| p.to_path_buf()),
            )
        }
    } else {
        let cwd = env::current_dir().map_err(|err| format!("cwd error: {err}"))?;
        let path = find_manifest(&cwd);
        let dir = path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));
        (path, dir)
    };

    let Some(path) = manifest_path else {
        return Ok((None, None));
    };
    let content = fs::read_to_string(&path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let manifest = Manifest::parse(&content)?;
    Ok((Some(manifest), manifest_dir))
}

pub fn find_manifest(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        let candidate = dir.join(MANIFEST_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
}
