//! Limiter configuration and rule files.
//!
//! A [`LimiterConfig`] describes one limiter, addressed by `(group, tag)`.
//! Rule files group limiters the way an application groups its call sites:
//!
//! ```yaml
//! group: orders
//! limiters:
//!   - tag: create
//!     max_permit_concurrent: 2
//!     max_permit_rate: 50
//!   - tag: cancel
//!     max_permit_request: 100
//!     request_interval_ms: 60000
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};

/// Which limiter implementation backs a config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Shared-store limiter coordinated across processes
    #[default]
    Cluster,
    /// Single-process limiter
    Local,
}

impl Mode {
    /// Name the implementation is registered under.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Cluster => "cluster",
            Mode::Local => "local",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds and identity of one limiter.
///
/// Ceilings of zero or less disable their check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    pub group: String,
    pub tag: String,
    #[serde(default)]
    pub mode: Mode,
    /// Pass calls through unguarded when false
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Permits taken per call from the concurrency ceiling
    #[serde(default = "default_permit")]
    pub concurrent_permit: i64,
    #[serde(default)]
    pub max_permit_concurrent: i64,
    #[serde(default = "default_timeout_ms")]
    pub concurrent_timeout_ms: u64,

    /// Tokens consumed per call
    #[serde(default = "default_permit")]
    pub rate_permit: i64,
    /// Replenishment per second, also the bucket capacity
    #[serde(default)]
    pub max_permit_rate: i64,
    #[serde(default = "default_timeout_ms")]
    pub rate_timeout_ms: u64,

    #[serde(default)]
    pub max_permit_request: i64,
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_permit() -> i64 {
    1
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_request_interval_ms() -> u64 {
    1000
}

impl LimiterConfig {
    /// Create a config with every check disabled.
    pub fn new(group: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            tag: tag.into(),
            mode: Mode::default(),
            enabled: default_enabled(),
            concurrent_permit: default_permit(),
            max_permit_concurrent: 0,
            concurrent_timeout_ms: default_timeout_ms(),
            rate_permit: default_permit(),
            max_permit_rate: 0,
            rate_timeout_ms: default_timeout_ms(),
            max_permit_request: 0,
            request_interval_ms: default_request_interval_ms(),
            request_timeout_ms: default_timeout_ms(),
        }
    }

    /// The registry key of this limiter.
    pub fn identity(&self) -> String {
        identity(&self.group, &self.tag)
    }

    pub fn concurrent_timeout(&self) -> Duration {
        Duration::from_millis(self.concurrent_timeout_ms)
    }

    pub fn rate_timeout(&self) -> Duration {
        Duration::from_millis(self.rate_timeout_ms)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn concurrent_enabled(&self) -> bool {
        self.max_permit_concurrent > 0
    }

    pub fn rate_enabled(&self) -> bool {
        self.max_permit_rate > 0
    }

    pub fn request_enabled(&self) -> bool {
        self.max_permit_request > 0
    }

    /// Check the thresholds are usable.
    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() || self.tag.is_empty() {
            return Err(LimiterError::Config(format!(
                "group and tag are required: {}",
                self.identity()
            )));
        }
        if self.concurrent_enabled() && self.concurrent_permit <= 0 {
            return Err(self.invalid("concurrent_permit must be positive"));
        }
        if self.rate_enabled() && (self.rate_permit <= 0 || self.rate_permit > self.max_permit_rate) {
            return Err(self.invalid("rate_permit must be positive and within max_permit_rate"));
        }
        if self.request_enabled() && self.request_interval_ms == 0 {
            return Err(self.invalid("request_interval_ms must be positive"));
        }
        if self.concurrent_timeout_ms == 0 || self.rate_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(self.invalid("timeouts must be positive"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> LimiterError {
        LimiterError::Config(format!("{}: {}", self.identity(), reason))
    }
}

/// Identity derived from a `(group, tag)` pair.
pub fn identity(group: &str, tag: &str) -> String {
    format!("{}:{}", group, tag)
}

/// One limiter entry inside a group of a rule file: a [`LimiterConfig`]
/// without its group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterRule {
    pub tag: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_permit")]
    pub concurrent_permit: i64,
    #[serde(default)]
    pub max_permit_concurrent: i64,
    #[serde(default = "default_timeout_ms")]
    pub concurrent_timeout_ms: u64,
    #[serde(default = "default_permit")]
    pub rate_permit: i64,
    #[serde(default)]
    pub max_permit_rate: i64,
    #[serde(default = "default_timeout_ms")]
    pub rate_timeout_ms: u64,
    #[serde(default)]
    pub max_permit_request: i64,
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Limiters of one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupRules {
    pub group: String,
    #[serde(default)]
    pub limiters: Vec<LimiterRule>,
}

/// A complete rule file containing one or more groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSet {
    #[serde(default)]
    pub groups: Vec<GroupRules>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let parse_error =
            |e: serde_yaml::Error| LimiterError::Config(format!("Failed to parse limiter rules: {}", e));
        let document: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(parse_error)?;

        // A document with `groups` holds several groups, anything else is one
        if document.get("groups").is_some() {
            serde_yaml::from_str(yaml).map_err(parse_error)
        } else {
            let group: GroupRules = serde_yaml::from_str(yaml).map_err(parse_error)?;
            Ok(RuleSet { groups: vec![group] })
        }
    }

    /// Expand into validated limiter configs, in file order.
    pub fn configs(&self) -> Result<Vec<LimiterConfig>> {
        let mut configs = Vec::new();
        for group in &self.groups {
            for rule in &group.limiters {
                let config = rule.to_config(&group.group);
                config.validate()?;
                configs.push(config);
            }
        }
        Ok(configs)
    }
}

impl LimiterRule {
    fn to_config(&self, group: &str) -> LimiterConfig {
        LimiterConfig {
            group: group.to_string(),
            tag: self.tag.clone(),
            mode: self.mode,
            enabled: self.enabled,
            concurrent_permit: self.concurrent_permit,
            max_permit_concurrent: self.max_permit_concurrent,
            concurrent_timeout_ms: self.concurrent_timeout_ms,
            rate_permit: self.rate_permit,
            max_permit_rate: self.max_permit_rate,
            rate_timeout_ms: self.rate_timeout_ms,
            max_permit_request: self.max_permit_request,
            request_interval_ms: self.request_interval_ms,
            request_timeout_ms: self.request_timeout_ms,
        }
    }
}
