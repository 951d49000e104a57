use crate::errors::{AppError, AppResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_URL_ENV: &str = "KEEPNOTES_API_URL";
pub const CACHE_DIR_ENV: &str = "KEEPNOTES_CACHE_DIR";
pub const LOG_DIR_ENV: &str = "KEEPNOTES_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub api_base_url: String,
    /// Directory for per-user cache files. Without one the engine runs
    /// without a durable cache.
    pub cache_dir: Option<PathBuf>,
    /// Rolling log directory. Defaults to `<cacheDir>/logs`.
    pub log_dir: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: String,
    pub order_debounce_ms: u64,
    pub first_batch_size: usize,
    pub batch_size: usize,
    pub render_safety_margin_px: f64,
    pub scroll_threshold_px: f64,
    pub request_timeout_secs: u64,
    pub column_width_px: f64,
    pub column_gap_px: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            cache_dir: None,
            log_dir: None,
            log_level: "info".to_string(),
            order_debounce_ms: 350,
            first_batch_size: 10,
            batch_size: 5,
            render_safety_margin_px: 400.0,
            scroll_threshold_px: 600.0,
            request_timeout_secs: 30,
            column_width_px: 240.0,
            column_gap_px: 16.0,
        }
    }
}

impl EngineConfig {
    /// Reads a YAML config file, applies environment overrides and validates
    /// the result.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let mut config = read_yaml(path).map_err(|error| AppError::Config(format!("{error:#}")))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> AppResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(API_URL_ENV).filter(|value| !value.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(dir) = lookup(LOG_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            self.log_dir = Some(PathBuf::from(dir.trim()));
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let url = self.api_base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "apiBaseUrl must be an http(s) url, got \"{}\"",
                self.api_base_url
            )));
        }
        if self.first_batch_size == 0 || self.batch_size == 0 {
            return Err(AppError::Config("batch sizes must be greater than zero".to_string()));
        }
        if self.column_width_px <= 0.0 || self.column_gap_px < 0.0 {
            return Err(AppError::Config("column width must be positive and gap non-negative".to_string()));
        }
        Ok(())
    }

    pub fn api_base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    pub fn resolved_log_dir(&self) -> Option<PathBuf> {
        self.log_dir
            .clone()
            .or_else(|| self.cache_dir.as_ref().map(|dir| dir.join("logs")))
    }

    pub fn order_debounce(&self) -> Duration {
        Duration::from_millis(self.order_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn read_yaml(path: &Path) -> anyhow::Result<EngineConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}
