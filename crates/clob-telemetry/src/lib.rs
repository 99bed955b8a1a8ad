//! Prometheus metrics and structured logging for the venue gateway.
//!
//! The gateway components emit counters and gauges through the statics in
//! [`metrics`]; storage and export belong to the surrounding process.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
