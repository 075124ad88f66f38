//! # kvpipe
//!
//! A key-value service that reads through a cache and writes through a
//! queue:
//! - Cache-aside reads with store fallback
//! - Writes and deletes accepted once durably queued
//! - A background worker applying queued mutations idempotently
//! - Liveness and readiness with per-dependency verdicts
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            GET /kv                 PUT /kv, DELETE /kv
//!               │                            │
//!       ┌───────▼────────┐          ┌────────▼─────────┐
//!       │ ReadCoordinator│          │ WriteCoordinator │
//!       └───┬────────┬───┘          └────────┬─────────┘
//!      hit  │        │ miss                  │ publish
//!     ┌─────▼──┐  ┌──▼──────┐       ┌────────▼─────────┐
//!     │ Cache  │◄─┤  Store  │       │ Queue            │
//!     └────▲───┘  └──▲──────┘       │ writes | deletes │
//!          │ resync  │ apply        └────────┬─────────┘
//!          │      ┌──┴───────────┐  consume  │
//!          └──────┤ ApplyWorker  ◄───────────┘
//!                 └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the server
//! ```bash
//! kvpipe-server serve --config kvpipe.toml --bind 0.0.0.0:8000
//! ```
//!
//! ### Use the CLI
//! ```bash
//! kvpipe put a 1
//! kvpipe get a
//! kvpipe delete a
//! kvpipe ready
//! ```

pub mod cache;
pub mod client;
pub mod common;
pub mod coordinator;
pub mod queue;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Pipeline, Server};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
