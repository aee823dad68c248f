//! CoreLoop common library
//!
//! Shared error, configuration and metrics types used by the dispatcher crate.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{CoreLoopConfig, WeightDType};
pub use error::{CoreLoopError, Result};
pub use metrics::{MetricsRegistry, METRICS};
