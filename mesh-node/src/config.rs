//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use mesh_core::chunk::DEFAULT_CHUNK_SIZE;
use mesh_core::Role;
use serde::Deserialize;

use crate::discovery::DiscoveryConfig;
use crate::session::SessionConfig;

/// Node configuration. File: ~/.config/meshmind/config.toml or /etc/meshmind/config.toml.
/// Env overrides: MESHMIND_PEER_ID, MESHMIND_DISPLAY_NAME, MESHMIND_ROLE, MESHMIND_DATA_DIR,
/// MESHMIND_DISCOVERY_PORT, MESHMIND_TRANSPORT_PORT, MESHMIND_GENERATION_URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer id; generated and persisted under `data_dir` when unset.
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transfer TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,
    #[serde(default = "default_peer_expiry_secs")]
    pub peer_expiry_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Accept artifacts pushed by hubs without a local request.
    #[serde(default = "default_accept_pushes")]
    pub accept_pushes: bool,
    #[serde(default = "default_generation_url")]
    pub generation_url: String,
}

fn default_display_name() -> String {
    "MeshMind device".into()
}
fn default_role() -> Role {
    Role::Receiver
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/meshmind"),
        None => PathBuf::from("meshmind-data"),
    }
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_beacon_interval_secs() -> u64 {
    4
}
fn default_peer_expiry_secs() -> u64 {
    16
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    15
}
fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_accept_pushes() -> bool {
    true
}
fn default_generation_url() -> String {
    "http://127.0.0.1:8000".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: None,
            display_name: default_display_name(),
            role: default_role(),
            data_dir: default_data_dir(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            beacon_interval_secs: default_beacon_interval_secs(),
            peer_expiry_secs: default_peer_expiry_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            chunk_size: default_chunk_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            accept_pushes: default_accept_pushes(),
            generation_url: default_generation_url(),
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.chunk_size.max(1),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            accept_pushes: self.accept_pushes,
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            display_name: self.display_name.clone(),
            role: self.role,
            listen_port: self.transport_port,
            beacon_interval: Duration::from_secs(self.beacon_interval_secs.max(1)),
            peer_expiry: Duration::from_secs(self.peer_expiry_secs.max(1)),
            ..DiscoveryConfig::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Apply `MESHMIND_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("MESHMIND_PEER_ID") {
            if !s.trim().is_empty() {
                self.peer_id = Some(s.trim().to_owned());
            }
        }
        if let Some(s) = lookup("MESHMIND_DISPLAY_NAME") {
            self.display_name = s;
        }
        if let Some(s) = lookup("MESHMIND_ROLE") {
            match s.parse::<Role>() {
                Ok(r) => self.role = r,
                Err(e) => tracing::warn!(error = %e, "ignoring MESHMIND_ROLE"),
            }
        }
        if let Some(s) = lookup("MESHMIND_DATA_DIR") {
            self.data_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("MESHMIND_DISCOVERY_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.discovery_port = p,
                Err(_) => tracing::warn!(value = %s, "ignoring MESHMIND_DISCOVERY_PORT"),
            }
        }
        if let Some(s) = lookup("MESHMIND_TRANSPORT_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.transport_port = p,
                Err(_) => tracing::warn!(value = %s, "ignoring MESHMIND_TRANSPORT_PORT"),
            }
        }
        if let Some(s) = lookup("MESHMIND_GENERATION_URL") {
            self.generation_url = s;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshmind/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshmind/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => {
                        tracing::info!(path = %p.display(), "loaded config");
                        return Some(c);
                    }
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "invalid config file")
                    }
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}
