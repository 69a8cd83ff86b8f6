//! Admission control.
//!
//! A [`LimiterRegistry`] holds one [`Limiter`] per `group:tag` identity.
//! Every intercepted call runs through the limiter's lifecycle: the
//! concurrency check, then the rate check, then the request-window check,
//! the call itself, and finally the release of the concurrency permit.

pub mod acquire;
pub mod backend;
pub mod cluster;
pub mod context;
pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod reload;
pub mod rules;
pub mod stats;

pub use acquire::{Acquire, EvalResult};
pub use backend::{Admission, AdmissionFactory, Extensions};
pub use cluster::{ClusterLimiter, RATE_CLASSIFIER};
pub use context::CallContext;
pub use events::{EventBus, EventType, LimiterEvent, DEFAULT_EVENT_CAPACITY};
pub use lifecycle::Limiter;
pub use registry::{LimiterRegistry, MetricsReport};
pub use reload::{publish_config, ConfigWatcher, DEFAULT_RELOAD_CHANNEL};
pub use rules::{identity, GroupRules, LimiterConfig, LimiterRule, Mode, RuleSet};
pub use stats::{LimiterStats, Metric};
