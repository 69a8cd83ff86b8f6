//! Neural Limiter - Distributed Admission Control
//!
//! This crate guards application calls with three admission checks evaluated
//! against a shared store: a concurrency ceiling, a token-bucket rate and a
//! fixed request window. Limiters are registered per `group:tag` identity,
//! wrap calls with a strict acquire → call → release lifecycle, and accept
//! configuration changes at runtime.

pub mod config;
pub mod error;
pub mod limiter;
pub mod store;

pub use error::{LimiterError, Result};
pub use limiter::{CallContext, LimiterConfig, LimiterRegistry};
