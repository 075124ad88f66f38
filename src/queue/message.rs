//! Message bodies carried on the queue
//!
//! A body is a flat JSON record: `{"key":K,"value":V}` on `writes`,
//! `{"key":K}` on `deletes`.

use super::Channel;
use crate::common::{Error, Result};
use crate::store::RESERVED_KEY_PREFIX;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct WriteBody {
    key: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeleteBody {
    key: String,
}

/// Intent carried by a queued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage {
    Write { key: String, value: String },
    Delete { key: String },
}

impl QueueMessage {
    pub fn key(&self) -> &str {
        match self {
            QueueMessage::Write { key, .. } | QueueMessage::Delete { key } => key,
        }
    }

    /// Channel this kind of message travels on
    pub fn channel(&self) -> Channel {
        match self {
            QueueMessage::Write { .. } => Channel::Writes,
            QueueMessage::Delete { .. } => Channel::Deletes,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            QueueMessage::Write { key, value } => serde_json::to_vec(&WriteBody {
                key: key.clone(),
                value: value.clone(),
            })?,
            QueueMessage::Delete { key } => {
                serde_json::to_vec(&DeleteBody { key: key.clone() })?
            }
        };
        Ok(body)
    }

    /// Decode a body received on `channel`. Anything that does not parse
    /// into that channel's record is a poison message.
    pub fn decode(channel: Channel, body: &[u8]) -> Result<Self> {
        let message = match channel {
            Channel::Writes => {
                let WriteBody { key, value } = serde_json::from_slice(body)
                    .map_err(|e| Error::PoisonMessage(format!("{} body: {}", channel, e)))?;
                QueueMessage::Write { key, value }
            }
            Channel::Deletes => {
                let DeleteBody { key } = serde_json::from_slice(body)
                    .map_err(|e| Error::PoisonMessage(format!("{} body: {}", channel, e)))?;
                QueueMessage::Delete { key }
            }
        };
        if message.key().is_empty() {
            return Err(Error::PoisonMessage(format!("{} body: empty key", channel)));
        }
        if message.key().starts_with(RESERVED_KEY_PREFIX) {
            return Err(Error::PoisonMessage(format!("{} body: reserved key", channel)));
        }
        Ok(message)
    }
}
