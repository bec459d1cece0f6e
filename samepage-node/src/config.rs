//! Load node config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Node configuration. File: ~/.config/samepage/config.toml or /etc/samepage/config.toml.
/// Env overrides: SAMEPAGE_NOTEBOOK_UUID, SAMEPAGE_TOKEN, SAMEPAGE_RELAY_URL,
/// SAMEPAGE_API_URL, SAMEPAGE_P2P_PORT, SAMEPAGE_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Notebook identity. Generated on first run when absent.
    #[serde(default)]
    pub notebook_uuid: Option<Uuid>,
    /// Host application id (1 Roam, 2 LogSeq, 3 Obsidian).
    #[serde(default = "default_app")]
    pub app: u8,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Empty means "ask the backend for one".
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Direct peer link listen port (default 45690).
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    /// Peers to dial for direct links, as host:port.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Where page content is kept, one JSON file per page.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Milliseconds per core tick.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Connect to the relay at startup.
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    #[serde(default)]
    pub core: samepage_core::Config,
}

fn default_app() -> u8 {
    1
}
fn default_workspace() -> String {
    "default".to_string()
}
fn default_relay_url() -> String {
    "wss://ws.samepage.network".to_string()
}
fn default_api_url() -> String {
    "https://api.samepage.network".to_string()
}
fn default_p2p_port() -> u16 {
    45690
}
fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|h| h.join(".local/share/samepage"))
        .unwrap_or_else(|| PathBuf::from("samepage-data"))
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_auto_connect() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            notebook_uuid: None,
            app: default_app(),
            workspace: default_workspace(),
            token: String::new(),
            relay_url: default_relay_url(),
            api_url: default_api_url(),
            p2p_port: default_p2p_port(),
            peers: Vec::new(),
            data_dir: default_data_dir(),
            tick_ms: default_tick_ms(),
            auto_connect: default_auto_connect(),
            core: samepage_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> NodeConfig {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SAMEPAGE_NOTEBOOK_UUID") {
        match s.parse::<Uuid>() {
            Ok(u) => c.notebook_uuid = Some(u),
            Err(e) => tracing::warn!(value = %s, error = %e, "ignoring SAMEPAGE_NOTEBOOK_UUID"),
        }
    }
    if let Some(s) = var("SAMEPAGE_TOKEN") {
        c.token = s;
    }
    if let Some(s) = var("SAMEPAGE_RELAY_URL") {
        c.relay_url = s;
    }
    if let Some(s) = var("SAMEPAGE_API_URL") {
        c.api_url = s;
    }
    if let Some(s) = var("SAMEPAGE_P2P_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.p2p_port = p;
        }
    }
    if let Some(s) = var("SAMEPAGE_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/samepage/config.toml"));
    }
    out.push(PathBuf::from("/etc/samepage/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<NodeConfig>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config"),
            }
            break;
        }
    }
    None
}
