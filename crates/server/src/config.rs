use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use server_api::EngineConfig;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub max_bound: i64,
    pub max_children: i64,
    pub max_initial_children: i64,
    pub persistence_timeout_ms: u64,
    pub notify_rejections: bool,
    pub max_message_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            server_bind: "127.0.0.1:3000".into(),
            database_url: "sqlite://./data/tree.db".into(),
            max_bound: engine.max_bound,
            max_children: engine.max_children,
            max_initial_children: engine.max_initial_children,
            persistence_timeout_ms: u64::try_from(engine.persistence_timeout.as_millis())
                .unwrap_or(u64::MAX),
            notify_rejections: engine.notify_rejections,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    /// Engine limits from these settings. Non-positive limits are replaced by
    /// their defaults.
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            max_bound: positive_or("max_bound", self.max_bound, defaults.max_bound),
            max_children: positive_or("max_children", self.max_children, defaults.max_children),
            max_initial_children: positive_or(
                "max_initial_children",
                self.max_initial_children,
                defaults.max_initial_children,
            ),
            persistence_timeout: Duration::from_millis(self.persistence_timeout_ms),
            notify_rejections: self.notify_rejections,
        }
    }
}

fn positive_or(key: &str, value: i64, default: i64) -> i64 {
    if value > 0 {
        value
    } else {
        warn!(key, value, default, "ignoring non-positive limit");
        default
    }
}

/// Keys accepted in `server.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    max_bound: Option<i64>,
    max_children: Option<i64>,
    max_initial_children: Option<i64>,
    persistence_timeout_ms: Option<u64>,
    notify_rejections: Option<bool>,
    max_message_bytes: Option<usize>,
}

/// Defaults, then the config file (if present), then environment variables.
pub fn load_settings(config_path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(error) => warn!(
                path = %config_path.display(),
                %error,
                "ignoring unreadable config file"
            ),
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.max_bound {
        settings.max_bound = v;
    }
    if let Some(v) = file_cfg.max_children {
        settings.max_children = v;
    }
    if let Some(v) = file_cfg.max_initial_children {
        settings.max_initial_children = v;
    }
    if let Some(v) = file_cfg.persistence_timeout_ms {
        settings.persistence_timeout_ms = v;
    }
    if let Some(v) = file_cfg.notify_rejections {
        settings.notify_rejections = v;
    }
    if let Some(v) = file_cfg.max_message_bytes {
        settings.max_message_bytes = v;
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(port) = parsed::<u16>(&var, "PORT") {
        settings.server_bind = format!("0.0.0.0:{port}");
    }
    if let Some(v) = var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = parsed(&var, "APP__MAX_BOUND") {
        settings.max_bound = v;
    }
    if let Some(v) = parsed(&var, "APP__MAX_CHILDREN") {
        settings.max_children = v;
    }
    if let Some(v) = parsed(&var, "APP__MAX_INITIAL_CHILDREN") {
        settings.max_initial_children = v;
    }
    if let Some(v) = parsed(&var, "APP__PERSISTENCE_TIMEOUT_MS") {
        settings.persistence_timeout_ms = v;
    }
    if let Some(v) = parsed(&var, "APP__NOTIFY_REJECTIONS") {
        settings.notify_rejections = v;
    }
    if let Some(v) = parsed(&var, "APP__MAX_MESSAGE_BYTES") {
        settings.max_message_bytes = v;
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Turns bare file paths into `sqlite://` URLs and leaves real URLs alone.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
