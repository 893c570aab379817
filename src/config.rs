//! Static bootstrap configuration.
//!
//! The configuration file holds the controller endpoint, the credential, and the
//! persisted agent identifier, plus defaults the controller may override at runtime
//! (see [`crate::overlay`]). JSON is the default format; files ending in `.yaml` or
//! `.yml` are read and written as YAML.
//!
//! Path resolution order for [`Config::load`]:
//!
//! 1. an explicit path (the `--config` flag)
//! 2. the `KOKORO_CONFIG` environment variable
//! 3. the first existing file among [`DEFAULT_PATHS`], else the first candidate

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{AgentError, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "KOKORO_CONFIG";

/// Candidate locations, in order.
pub const DEFAULT_PATHS: [&str; 3] =
    ["/etc/kokoro-agent/config.json", "/opt/kokoro-agent/config.json", "./config.json"];

/// Metrics interval used when the file does not set one.
pub const DEFAULT_METRICS_INTERVAL_MS: u64 = 1000;

/// Static configuration as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub master_ws_url: String,

    #[serde(default)]
    pub token: String,

    /// Generated once on first run and persisted.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub metrics_interval_ms: u64,

    /// `"auto"` or an interface name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub net_iface: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure_skip_verify: bool,

    #[serde(default, skip_serializing_if = "TcpPingDefaults::is_unset")]
    pub tcpping: TcpPingDefaults,
}

/// TCP-ping defaults. The controller usually pushes targets and may override both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPingDefaults {
    /// Superseded by the controller's flag once any controller config arrives.
    #[serde(default, skip_serializing_if = "is_false")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub interval_sec: u64,
}

impl TcpPingDefaults {
    fn is_unset(&self) -> bool {
        !self.enabled && self.interval_sec == 0
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Format::Yaml
            }
            _ => Format::Json,
        }
    }
}

impl Config {
    /// Resolve the configuration path, load, validate, and persist a freshly
    /// generated agent id if none was set.
    pub fn load(explicit: Option<&Path>) -> Result<(Config, PathBuf)> {
        let path = resolve_path(explicit);
        let mut config = Self::read(&path)?;
        config.validate(&path)?;

        if config.agent_id.is_empty() {
            config.agent_id = generate_agent_id();
            info!(agent_id = %config.agent_id, path = %path.display(), "generated agent id");
            config.save(&path)?;
        }
        Ok((config, path))
    }

    /// Parse a file without validation.
    pub fn read(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AgentError::ConfigFile { path: path.to_path_buf(), source: e })?;
        let parsed = match Format::of(path) {
            Format::Json => serde_json::from_str(&raw).map_err(|e| e.to_string()),
            Format::Yaml => serde_yaml_ng::from_str(&raw).map_err(|e| e.to_string()),
        };
        parsed.map_err(|reason| AgentError::config_invalid(path, format!("parse error: {reason}")))
    }

    /// Check required fields and fill defaults.
    pub fn validate(&mut self, path: &Path) -> Result<()> {
        if self.master_ws_url.trim().is_empty() {
            return Err(AgentError::config_invalid(path, "master_ws_url is required"));
        }
        if self.token.trim().is_empty() {
            return Err(AgentError::config_invalid(path, "token is required"));
        }
        if self.metrics_interval_ms == 0 {
            self.metrics_interval_ms = DEFAULT_METRICS_INTERVAL_MS;
        }
        if self.net_iface.is_empty() {
            self.net_iface = "auto".to_owned();
        }
        Ok(())
    }

    /// Write atomically: serialize to a sibling temp file, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file_error = |source| AgentError::ConfigFile { path: path.to_path_buf(), source };

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(file_error)?;
        }

        let encoded = match Format::of(path) {
            Format::Json => serde_json::to_string_pretty(self).map_err(|e| e.to_string()),
            Format::Yaml => serde_yaml_ng::to_string(self).map_err(|e| e.to_string()),
        }
        .map_err(|reason| AgentError::config_invalid(path, format!("encode error: {reason}")))?;

        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".tmp.{nanos}"));
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, encoded).map_err(file_error)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(file_error(e));
        }
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Pick the configuration path.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(env) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(env);
    }
    DEFAULT_PATHS
        .iter()
        .map(Path::new)
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| Path::new(DEFAULT_PATHS[0]))
        .to_path_buf()
}

/// New random (version 4) agent identifier.
pub fn generate_agent_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Static configuration shared by the agent and the reload trigger.
///
/// Sessions take one [`snapshot`](SharedConfig::snapshot) when dialing; a reload
/// only affects the next session attempt.
#[derive(Debug)]
pub struct SharedConfig {
    path: PathBuf,
    current: RwLock<Config>,
}

impl SharedConfig {
    pub fn new(config: Config, path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), current: RwLock::new(config) }
    }

    pub fn snapshot(&self) -> Config {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Re-read the file. The previous configuration stays in place on error.
    pub fn reload(&self) -> Result<Config> {
        let (config, _) = Config::load(Some(&self.path))?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        info!(path = %self.path.display(), "configuration reloaded");
        Ok(config)
    }
}
