//! Queue transport abstraction
//!
//! Two independent at-least-once channels, `writes` and `deletes`, each FIFO
//! on its own. Nothing orders messages across channels. A consumer receives
//! a [`Delivery`] and must settle it with `ack` (done) or `nack` (give it
//! back). The transport owns redelivery backoff and the dead-letter policy.

pub mod journal;
pub mod local;
pub mod message;

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use local::{LocalQueue, QueuePolicy};
pub use message::QueueMessage;

/// Gauge name for per-channel depth
pub const QUEUE_DEPTH_GAUGE: &str = "kvpipe_mq_queue_size";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Writes,
    Deletes,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Writes, Channel::Deletes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Writes => "writes",
            Channel::Deletes => "deletes",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Channel::Writes => 0,
            Channel::Deletes => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Channel::Writes),
            1 => Some(Channel::Deletes),
            _ => None,
        }
    }

    pub(crate) fn code(&self) -> u8 {
        self.index() as u8
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One handout of a queued message to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport handle for ack/nack; not part of the message identity
    pub tag: u64,
    pub channel: Channel,
    pub body: Vec<u8>,
    /// 1 on first delivery
    pub attempt: u32,
}

/// What the transport did with a nacked delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { delay: Duration },
    DeadLettered,
}

/// Message counts for one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelDepth {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

impl ChannelDepth {
    /// Messages not yet settled
    pub fn pending(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Returns once the transport has durably accepted the message
    async fn publish(&self, channel: Channel, body: Vec<u8>) -> Result<()>;

    /// Wait for the next message on `channel`
    async fn consume(&self, channel: Channel) -> Result<Delivery>;

    /// Settle a delivery as processed
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Give a delivery back for redelivery
    async fn nack(&self, delivery: &Delivery) -> Result<NackOutcome>;

    /// Check that both channels are reachable
    async fn ping(&self) -> Result<()>;

    async fn depth(&self, channel: Channel) -> Result<ChannelDepth>;
}
