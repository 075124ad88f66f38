//! Request-side coordination
//!
//! The coordinator owns the public surface of the pipeline:
//! - Cache-aside reads
//! - Queued writes and deletes
//! - Dependency health aggregation
//! - HTTP API and process wiring

pub mod health;
pub mod http;
pub mod read;
pub mod server;
pub mod write;

pub use health::{ComponentHealth, HealthAggregator, HealthReport, OverallStatus};
pub use http::{create_router, AppState};
pub use read::ReadCoordinator;
pub use server::{Pipeline, Server};
pub use write::{Accepted, WriteCoordinator};
