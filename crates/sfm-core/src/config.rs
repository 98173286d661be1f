use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Backoff parameters for ordinary fetches (optional section in config.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt; a fetch makes at most `max_retries + 1` attempts.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub base_delay_secs: f64,
    /// Growth factor applied per further failure.
    pub multiplier: f64,
    /// Upper bound on any single delay, in seconds.
    pub max_delay_secs: u64,
    /// Random extra scaling in `[0, jitter]` applied to each delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 1.0,
            multiplier: 2.0,
            max_delay_secs: 60,
            jitter: 1.0,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: secs_f64(self.base_delay_secs),
            multiplier: self.multiplier,
            max_delay: Duration::from_secs(self.max_delay_secs),
            jitter: self.jitter,
        }
    }
}

/// Resumable upload parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Bytes per chunk request.
    pub chunk_size: u64,
    /// Longest backoff between chunk retries, in seconds.
    pub max_delay_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            max_delay_secs: 600,
        }
    }
}

/// Which plain-text requests are allowed through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Schemes other than https that may be fetched, e.g. `["http"]`.
    #[serde(default)]
    pub allowed_insecure_schemes: Vec<String>,
    /// Allow any scheme when the host is localhost or a loopback address.
    #[serde(default)]
    pub allow_localhost: bool,
}

/// Global configuration loaded from `~/.config/sfm/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfmConfig {
    /// Maximum fetches exchanging data at once, across all hosts.
    pub max_concurrent_global: usize,
    /// Maximum fetches exchanging data at once with a single host.
    pub max_concurrent_per_host: usize,
    /// Per-attempt timeout in seconds.
    pub request_timeout_secs: u64,
    /// Redirect hops followed before giving up.
    pub max_redirects: usize,
    /// How long an unused per-host session is kept for reuse (0 = tear down at once).
    pub session_idle_timeout_secs: u64,
    /// Optional retry policy; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub upload: Option<UploadConfig>,
    #[serde(default)]
    pub security: Option<SecurityConfig>,
}

impl Default for SfmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: 64,
            max_concurrent_per_host: 10,
            request_timeout_secs: 60,
            max_redirects: 10,
            session_idle_timeout_secs: 60,
            retry: None,
            upload: None,
            security: None,
        }
    }
}

fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sfm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SfmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SfmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SfmConfig = toml::from_str(&data)?;
    Ok(cfg)
}
