//! Composition root for the venue gateway.
//!
//! Wires the resilience components around a pluggable remote call executor:
//!
//! - [`VenueGateway`]: the guarded call path (breaker → retry → admission →
//!   dedup → sequence numbering → execution → classification)
//! - [`GatewayConfig`]: fully enumerated, TOML-loadable configuration
//! - [`RemoteCall`] / [`RestExecutor`]: the transport seam and its default
//!   JSON-over-HTTP implementation
//!
//! Lifecycle belongs to the embedding process: construct one gateway,
//! share it by `Arc`, and run [`VenueGateway::spawn_maintenance`] under a
//! cancellation token.

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod remote;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::{CallSpec, VenueGateway};
pub use http::RestExecutor;
pub use remote::{BoxFuture, DynRemoteCall, MockVenue, RemoteCall};

// Logging setup for the embedding process.
pub use clob_telemetry::init_logging;
