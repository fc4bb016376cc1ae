use crate::error::AppError;
use crate::extract::reset::DEFAULT_RESET_WINDOW;
use crate::extract::DEFAULT_MIN_TEXT_LEN;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVICE_NAME: &str = "usage-overlay";
pub const DEFAULT_TARGET_URL: &str = "https://claude.ai/settings/usage";
const SESSION_ENTRY: &str = "session:claude.ai";
const SESSION_ENV: &str = "USAGE_OVERLAY_SESSION_KEY";

/// Upper bound for the refresh and freshness intervals (one week).
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
/// Upper bound for each wait inside a fetch attempt (one hour).
pub const MAX_FETCH_WAIT_MS: u64 = 60 * 60 * 1000;

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("USAGE_OVERLAY_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "usage-overlay", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".usage-overlay"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub target_url: String,
    pub min_text_len: usize,
    pub reset_window_chars: usize,
    pub freshness_minutes: u64,
    pub widget_refresh_minutes: u64,
    pub background_refresh_minutes: u64,
    pub auto_fetch_on_first_run: bool,
    pub fetch: FetchTimings,
}

/// Waits used while bringing a background page to a state worth scraping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchTimings {
    pub settle_ms: u64,
    pub load_timeout_ms: u64,
    pub reuse_settle_ms: u64,
    pub close_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.into(),
            min_text_len: DEFAULT_MIN_TEXT_LEN,
            reset_window_chars: DEFAULT_RESET_WINDOW,
            freshness_minutes: 5,
            widget_refresh_minutes: 5,
            background_refresh_minutes: 15,
            auto_fetch_on_first_run: true,
            fetch: FetchTimings::default(),
        }
    }
}

impl Default for FetchTimings {
    fn default() -> Self {
        Self {
            settle_ms: 3_000,
            load_timeout_ms: 15_000,
            reuse_settle_ms: 500,
            close_delay_ms: 500,
            request_timeout_ms: 10_000,
        }
    }
}

impl FetchTimings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn reuse_settle(&self) -> Duration {
        Duration::from_millis(self.reuse_settle_ms)
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl AppConfig {
    pub fn freshness(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.freshness_minutes.min(MAX_INTERVAL_MINUTES) as i64)
    }

    pub fn widget_refresh(&self) -> Duration {
        Duration::from_secs(self.widget_refresh_minutes.min(MAX_INTERVAL_MINUTES) * 60)
    }

    pub fn background_refresh(&self) -> Duration {
        Duration::from_secs(self.background_refresh_minutes.min(MAX_INTERVAL_MINUTES) * 60)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("cache.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let trimmed = config.target_url.trim();
    if trimmed.is_empty() {
        config.target_url = DEFAULT_TARGET_URL.into();
        changed = true;
    } else if trimmed != config.target_url {
        config.target_url = trimmed.to_string();
        changed = true;
    }

    for minutes in [
        &mut config.freshness_minutes,
        &mut config.widget_refresh_minutes,
        &mut config.background_refresh_minutes,
    ] {
        let clamped = (*minutes).clamp(1, MAX_INTERVAL_MINUTES);
        if clamped != *minutes {
            *minutes = clamped;
            changed = true;
        }
    }

    for ms in [
        &mut config.fetch.settle_ms,
        &mut config.fetch.load_timeout_ms,
        &mut config.fetch.reuse_settle_ms,
        &mut config.fetch.close_delay_ms,
        &mut config.fetch.request_timeout_ms,
    ] {
        if *ms > MAX_FETCH_WAIT_MS {
            *ms = MAX_FETCH_WAIT_MS;
            changed = true;
        }
    }

    if config.reset_window_chars == 0 {
        config.reset_window_chars = DEFAULT_RESET_WINDOW;
        changed = true;
    }

    changed
}

/// Reads `config.toml` and layers `USAGE_OVERLAY__*` environment overrides on top.
pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    load_config_from(&path)
}

fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    let layered = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
        .add_source(
            config::Environment::with_prefix("USAGE_OVERLAY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut parsed: AppConfig = layered.try_deserialize()?;
    if normalize_config(&mut parsed) {
        tracing::warn!(path = %path.display(), "config contained invalid values, using normalized ones");
    }
    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn session_entry() -> Result<keyring::Entry, AppError> {
    Ok(keyring::Entry::new(SERVICE_NAME, SESSION_ENTRY)?)
}

pub fn set_session_key(key: &str) -> Result<(), AppError> {
    session_entry()?.set_password(key.trim())?;
    Ok(())
}

pub fn delete_session_key() -> Result<(), AppError> {
    match session_entry()?.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(AppError::Keyring(e)),
    }
}

pub fn get_session_key() -> Result<String, AppError> {
    if let Ok(value) = std::env::var(SESSION_ENV) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    match session_entry()?.get_password() {
        Ok(value) if !value.is_empty() => Ok(value),
        Ok(_) | Err(keyring::Error::NoEntry) => Err(AppError::Config(format!(
            "No session key configured. Run `usage-overlay set-session --key ...` or set {SESSION_ENV}."
        ))),
        Err(e) => Err(AppError::Keyring(e)),
    }
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}
