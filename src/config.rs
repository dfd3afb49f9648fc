use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DebuggerError, Result};
use crate::util::{app_dir, expand_tilde};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub ack_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub keepalive_idle_secs: u64,
    pub keepalive_check_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub auto_reconnect: bool,
    pub estop_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "bbctrl.local".into(),
            port: 80,
            ack_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            keepalive_idle_secs: 30,
            keepalive_check_secs: 5,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 10_000,
            max_reconnect_attempts: 10,
            auto_reconnect: true,
            estop_retries: 3,
        }
    }
}

impl ConnectionConfig {
    fn secure(&self) -> bool {
        self.port == 443
    }

    fn authority(&self) -> String {
        if self.port == 80 || self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL of the REST API (`http[s]://host[:port]`).
    pub fn base_url(&self) -> String {
        let scheme = if self.secure() { "https" } else { "http" };
        format!("{scheme}://{}", self.authority())
    }

    /// URL of the controller's event stream.
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure() { "wss" } else { "ws" };
        format!("{scheme}://{}/websocket", self.authority())
    }

    /// The controller rejects handshakes whose Origin it does not recognise.
    pub fn origin(&self) -> String {
        let scheme = if self.secure() { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_secs)
    }

    pub fn keepalive_check(&self) -> Duration {
        Duration::from_secs(self.keepalive_check_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MacroConfig {
    pub directory: String,
    pub extensions: Vec<String>,
    pub sync_on_connect: bool,
    pub backup_limit: usize,
}

impl Default for MacroConfig {
    fn default() -> Self {
        let directory = app_dir()
            .map(|d| d.join("macros").to_string_lossy().to_string())
            .unwrap_or_else(|| "macros".into());
        Self {
            directory,
            extensions: ["gcode", "nc", "ngc", "tap"].iter().map(|e| e.to_string()).collect(),
            sync_on_connect: true,
            backup_limit: 20,
        }
    }
}

impl MacroConfig {
    pub fn directory_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.directory))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Z height used to clear the work before restoring X/Y on go-back.
    pub safe_z: f64,
    pub fatal_controller_errors: bool,
    pub line_delay_ms: u64,
    pub max_history: Option<usize>,
    /// Feed rates above this are flagged before sending.
    pub max_feed: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safe_z: 5.0,
            fatal_controller_errors: false,
            line_delay_ms: 0,
            max_history: None,
            max_feed: 10_000.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebuggerConfig {
    pub version: u32,
    pub connection: ConnectionConfig,
    pub macros: MacroConfig,
    pub debugger: EngineConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            version: 1,
            connection: ConnectionConfig::default(),
            macros: MacroConfig::default(),
            debugger: EngineConfig::default(),
            log_dir: None,
        }
    }
}

impl DebuggerConfig {
    pub fn log_dir_path(&self) -> Option<PathBuf> {
        match &self.log_dir {
            Some(dir) => Some(PathBuf::from(expand_tilde(dir))),
            None => app_dir().map(|d| d.join("logs")),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    app_dir().map(|d| d.join("config.json"))
}

/// Read a config file. Missing or unparseable files yield `None`.
pub fn load_config(path: &Path) -> Option<DebuggerConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("ignoring unreadable config {}: {e}", path.display());
            None
        }
    }
}

pub fn load_or_default(path: Option<&Path>) -> DebuggerConfig {
    let path = path.map(Path::to_path_buf).or_else(config_path);
    path.and_then(|p| load_config(&p)).unwrap_or_default()
}

pub fn save_config(path: &Path, config: &DebuggerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| DebuggerError::Custom(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}
