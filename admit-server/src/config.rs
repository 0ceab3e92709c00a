//! Process configuration, assembled once at start-up.
//!
//! Values come from an optional TOML file; anything not set keeps its
//! default. Durations are written the humantime way, e.g. `"30s"` or `"3m"`.
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:4000"
//! env = "production"
//!
//! [rate_limit]
//! enabled = true
//! idle_timeout = "3m"
//! sweep_interval = "1m"
//! global = { capacity = 100, refill_per_second = 25.0 }
//! client = { capacity = 4, refill_per_second = 2.0 }
//!
//! [shutdown]
//! drain_timeout = "30s"
//! ```

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use admit_limit::BucketConfig;
use admit_limit::GateConfig;
use serde::Deserialize;
use serde::Deserializer;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Operating environment reported by the healthcheck.
    pub env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            env: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    pub capacity: NonZeroUsize,
    pub refill_per_second: f64,
}

impl From<BucketConfig> for LimitConfig {
    fn from(bucket: BucketConfig) -> Self {
        Self {
            capacity: bucket.capacity,
            refill_per_second: bucket.refill_per_second,
        }
    }
}

impl From<LimitConfig> for BucketConfig {
    fn from(limit: LimitConfig) -> Self {
        BucketConfig::new(limit.capacity, limit.refill_per_second)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub global: LimitConfig,
    pub client: LimitConfig,
    #[serde(deserialize_with = "humantime_duration")]
    pub idle_timeout: Duration,
    #[serde(deserialize_with = "humantime_duration")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let gate = GateConfig::default();
        Self {
            enabled: gate.enabled,
            global: gate.global.into(),
            client: gate.client.into(),
            idle_timeout: gate.idle_timeout,
            sweep_interval: gate.sweep_interval,
        }
    }
}

impl From<RateLimitConfig> for GateConfig {
    fn from(config: RateLimitConfig) -> Self {
        GateConfig {
            enabled: config.enabled,
            global: config.global.into(),
            client: config.client.into(),
            idle_timeout: config.idle_timeout,
            sweep_interval: config.sweep_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    #[serde(deserialize_with = "humantime_duration")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Read `path`, or use the defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::parse(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("global", self.rate_limit.global),
            ("client", self.rate_limit.client),
        ];
        for (name, limit) in limits {
            if !limit.refill_per_second.is_finite() || limit.refill_per_second < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.{name}.refill_per_second must be a non-negative number"
                )));
            }
        }
        if self.rate_limit.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "rate_limit.sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}
