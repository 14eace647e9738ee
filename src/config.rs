use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Runtime configuration for the watcher.
///
/// Loaded from `chatwatch.toml` next to the executable, with environment
/// variable overrides for headless deployments. Every field has a serde
/// default so a partial config file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Phone number or email of the monitored contact. Empty means
    /// unconfigured; the scanner refuses to run until this is set.
    #[serde(default)]
    pub contact: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How many prior messages to include as conversational context.
    #[serde(default = "default_context_count")]
    pub context_count: usize,

    // LLM endpoint (Ollama-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Local inference can be slow; this bounds the classify call.
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,

    // Stores
    #[serde(default = "default_message_db_path")]
    pub message_db_path: String,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: String,

    // Calendar sink
    #[serde(default = "default_true")]
    pub enable_calendar: bool,
    /// Calendar to create events in. None falls back to the default
    /// calendar, then to any writable one.
    #[serde(default)]
    pub calendar_name: Option<String>,

    // Reminder sinks
    #[serde(default)]
    pub enable_url_reminders: bool,
    #[serde(default = "default_reminder_scheme")]
    pub reminder_url_scheme: String,
    #[serde(default)]
    pub enable_native_reminders: bool,
    #[serde(default)]
    pub reminders_list: Option<String>,

    // Push sink
    #[serde(default)]
    pub enable_push: bool,
    #[serde(default = "default_ntfy_server")]
    pub ntfy_server: String,
    #[serde(default)]
    pub ntfy_topic: String,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_context_count() -> usize {
    5
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_llm_timeout() -> u64 {
    300
}

fn default_message_db_path() -> String {
    dirs::home_dir()
        .map(|h| h.join("Library/Messages/chat.db"))
        .unwrap_or_else(|| PathBuf::from("chat.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_cursor_path() -> String {
    dirs::data_dir()
        .map(|d| d.join("chatwatch/cursor"))
        .unwrap_or_else(|| PathBuf::from("chatwatch_cursor"))
        .to_string_lossy()
        .into_owned()
}

fn default_true() -> bool {
    true
}

fn default_reminder_scheme() -> String {
    "due".to_string()
}

fn default_ntfy_server() -> String {
    "https://ntfy.sh".to_string()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            contact: String::new(),
            poll_interval_secs: default_poll_interval(),
            context_count: default_context_count(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_timeout_secs: default_llm_timeout(),
            message_db_path: default_message_db_path(),
            cursor_path: default_cursor_path(),
            enable_calendar: true,
            calendar_name: None,
            enable_url_reminders: false,
            reminder_url_scheme: default_reminder_scheme(),
            enable_native_reminders: false,
            reminders_list: None,
            enable_push: false,
            ntfy_server: default_ntfy_server(),
            ntfy_topic: String::new(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
}

impl WatcherConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("chatwatch.toml")
    }

    /// Load config from chatwatch.toml next to the executable, falling back
    /// to defaults plus environment overrides.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<WatcherConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    /// Save config to file (next to executable) so a preferences surface
    /// can persist changes.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply `CHATWATCH_*` environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(contact) = env::var("CHATWATCH_CONTACT") {
            if !contact.trim().is_empty() {
                self.contact = contact;
            }
        }

        if let Ok(url) = env::var("CHATWATCH_LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("CHATWATCH_LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(interval) = env::var("CHATWATCH_POLL_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.poll_interval_secs = seconds;
            }
        }

        if let Ok(timeout) = env::var("CHATWATCH_LLM_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                self.llm_timeout_secs = seconds;
            }
        }

        if let Ok(path) = env::var("CHATWATCH_MESSAGE_DB_PATH") {
            if !path.trim().is_empty() {
                self.message_db_path = path;
            }
        }

        if let Ok(path) = env::var("CHATWATCH_CURSOR_PATH") {
            if !path.trim().is_empty() {
                self.cursor_path = path;
            }
        }

        if let Some(enabled) = env_flag("CHATWATCH_ENABLE_CALENDAR") {
            self.enable_calendar = enabled;
        }

        if let Ok(name) = env::var("CHATWATCH_CALENDAR_NAME") {
            if !name.trim().is_empty() {
                self.calendar_name = Some(name);
            }
        }

        if let Some(enabled) = env_flag("CHATWATCH_ENABLE_URL_REMINDERS") {
            self.enable_url_reminders = enabled;
        }

        if let Some(enabled) = env_flag("CHATWATCH_ENABLE_NATIVE_REMINDERS") {
            self.enable_native_reminders = enabled;
        }

        if let Some(enabled) = env_flag("CHATWATCH_ENABLE_PUSH") {
            self.enable_push = enabled;
        }

        if let Ok(topic) = env::var("CHATWATCH_NTFY_TOPIC") {
            if !topic.trim().is_empty() {
                self.ntfy_topic = topic;
            }
        }

        self
    }
}
