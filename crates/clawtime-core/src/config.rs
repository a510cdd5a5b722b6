//! Configuration resolution for `ClawTime`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/clawtime/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`CLAWTIME_*`)
//! 5. CLI arguments (applied by the binaries, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete `ClawTime` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Client-facing WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    /// Extra origins accepted besides the request's own host.
    pub allowed_origins: Vec<String>,
    /// Take the client IP from `X-Forwarded-For` (behind a reverse proxy).
    pub trust_proxy: bool,
    pub ping_interval_secs: u64,
    pub pong_grace_secs: u64,
    pub max_frame_bytes: usize,
    pub max_resource_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
            allowed_origins: Vec::new(),
            trust_proxy: false,
            ping_interval_secs: 30,
            pong_grace_secs: 10,
            max_frame_bytes: 16 * 1024 * 1024,   // 16 MB
            max_resource_bytes: 5 * 1024 * 1024, // 5 MB
        }
    }
}

/// Upstream agent gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url: String,
    pub token: Option<String>,
    pub session_key: String,
    pub client_id: String,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            session_key: "main".to_string(),
            client_id: "clawtime".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// On-disk locations. Relative file names resolve against `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub history_file: PathBuf,
    pub run_ids_file: PathBuf,
    pub sessions_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            history_file: PathBuf::from("messages.json"),
            run_ids_file: PathBuf::from("run-ids.json"),
            sessions_file: PathBuf::from("sessions.json"),
        }
    }
}

impl StorageConfig {
    /// Resolved data directory (`~/.clawtime` when unset).
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".clawtime")
        })
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir().join(file)
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.resolve(&self.history_file)
    }

    pub fn run_ids_path(&self) -> PathBuf {
        self.resolve(&self.run_ids_file)
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.resolve(&self.sessions_file)
    }
}

/// External speech commands. Unset commands disable the feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Template with `{{TEXT}}` and `{{OUTPUT}}` placeholders.
    pub tts_command: Option<String>,
    /// Template with `{{INPUT}}` placeholder; transcript read from stdout.
    pub stt_command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            tts_command: None,
            stt_command: None,
            timeout_secs: 60,
        }
    }
}

/// Session validation and auth rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub session_ttl_secs: u64,
    pub failure_window_secs: u64,
    pub max_failures: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 7 * 24 * 60 * 60, // 7 days
            failure_window_secs: 60,
            max_failures: 5,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("clawtime").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.server = overlay.server;

    if overlay.agent.token.is_some() {
        base.agent.token = overlay.agent.token;
    }
    base.agent.url = overlay.agent.url;
    base.agent.session_key = overlay.agent.session_key;
    base.agent.client_id = overlay.agent.client_id;
    base.agent.request_timeout_secs = overlay.agent.request_timeout_secs;

    if overlay.storage.data_dir.is_some() {
        base.storage.data_dir = overlay.storage.data_dir;
    }
    base.storage.history_file = overlay.storage.history_file;
    base.storage.run_ids_file = overlay.storage.run_ids_file;
    base.storage.sessions_file = overlay.storage.sessions_file;

    if overlay.speech.tts_command.is_some() {
        base.speech.tts_command = overlay.speech.tts_command;
    }
    if overlay.speech.stt_command.is_some() {
        base.speech.stt_command = overlay.speech.stt_command;
    }
    base.speech.timeout_secs = overlay.speech.timeout_secs;

    base.auth = overlay.auth;
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("CLAWTIME_ADDR") {
        config.server.addr = val;
    }
    if let Some(val) = var("CLAWTIME_ALLOWED_ORIGINS") {
        config.server.allowed_origins = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(val) = var("CLAWTIME_TRUST_PROXY") {
        config.server.trust_proxy = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Some(val) = var("CLAWTIME_AGENT_URL") {
        config.agent.url = val;
    }
    if let Some(val) = var("CLAWTIME_AGENT_TOKEN") {
        config.agent.token = Some(val);
    }
    if let Some(val) = var("CLAWTIME_SESSION_KEY") {
        config.agent.session_key = val;
    }
    if let Some(val) = var("CLAWTIME_DATA_DIR") {
        config.storage.data_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = var("CLAWTIME_TTS_COMMAND") {
        config.speech.tts_command = Some(val);
    }
    if let Some(val) = var("CLAWTIME_STT_COMMAND") {
        config.speech.stt_command = Some(val);
    }
    if let Some(val) = var("CLAWTIME_SESSION_TTL_SECS")
        && let Ok(n) = val.parse()
    {
        config.auth.session_ttl_secs = n;
    }
}
