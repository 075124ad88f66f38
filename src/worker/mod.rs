//! Background apply worker
//!
//! Consumes the `writes` and `deletes` channels and turns each message into a
//! store mutation followed by a cache resync.

pub mod apply;

pub use apply::{ApplyOutcome, ApplySettings, ApplyWorker};
