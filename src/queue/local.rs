//! In-process queue transport
//!
//! `LocalQueue` keeps both channels in memory and, when opened on a journal,
//! records every publish before acknowledging it so unsettled messages
//! survive a restart. Deliveries that are neither acked nor nacked before the
//! process dies come back on the next open.
//!
//! Settlement rules:
//! - `ack` removes the message for good.
//! - `nack` schedules a redelivery after an exponential backoff, or moves the
//!   message to the dead-letter list once `max_deliveries` is spent.

use super::journal::{Journal, JournaledMessage};
use super::{Channel, ChannelDepth, Delivery, NackOutcome, QueueTransport};
use crate::common::{backoff_with_jitter, Component, Error, QueueConfig, Result, SyncPolicy};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Redelivery and dead-letter policy
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    /// Deliveries per message before it is dead-lettered
    pub max_deliveries: u32,
    pub redelivery_backoff: Duration,
    /// Settled records tolerated in the journal before it is rewritten
    pub compact_threshold: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            redelivery_backoff: Duration::from_millis(500),
            compact_threshold: 10_000,
        }
    }
}

impl From<&QueueConfig> for QueuePolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_deliveries: config.max_deliveries,
            redelivery_backoff: config.redelivery_backoff(),
            compact_threshold: config.compact_threshold,
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    tag: u64,
    body: Vec<u8>,
    /// Deliveries handed out so far
    deliveries: u32,
    due: Option<Instant>,
}

impl Pending {
    fn new(tag: u64, body: Vec<u8>) -> Self {
        Self {
            tag,
            body,
            deliveries: 0,
            due: None,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    ready: VecDeque<Pending>,
    delayed: Vec<Pending>,
    in_flight: HashMap<u64, Pending>,
    dead: Vec<Pending>,
}

impl ChannelState {
    /// Move delayed messages whose backoff elapsed to the back of `ready`
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|p| (p.due, p.tag));
        let split = self
            .delayed
            .iter()
            .position(|p| p.due.is_some_and(|due| due > now))
            .unwrap_or(self.delayed.len());
        for mut pending in self.delayed.drain(..split) {
            pending.due = None;
            self.ready.push_back(pending);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().filter_map(|p| p.due).min()
    }

    fn depth(&self) -> ChannelDepth {
        ChannelDepth {
            ready: self.ready.len(),
            delayed: self.delayed.len(),
            in_flight: self.in_flight.len(),
            dead_lettered: self.dead.len(),
        }
    }

    fn journaled(&self, channel: Channel) -> (Vec<JournaledMessage>, Vec<JournaledMessage>) {
        let to_record = |p: &Pending| JournaledMessage {
            tag: p.tag,
            channel,
            body: p.body.clone(),
        };
        let live = self
            .ready
            .iter()
            .chain(self.delayed.iter())
            .chain(self.in_flight.values())
            .map(to_record)
            .collect();
        let dead = self.dead.iter().map(to_record).collect();
        (live, dead)
    }
}

struct State {
    channels: [ChannelState; 2],
    next_tag: u64,
    journal: Option<Journal>,
    /// Ack/dead records appended since the last rewrite
    settled_since_compact: usize,
}

impl State {
    fn channel(&mut self, channel: Channel) -> &mut ChannelState {
        &mut self.channels[channel.index()]
    }

    fn record_settlement(&mut self, compact_threshold: usize) -> Result<()> {
        if self.journal.is_none() {
            return Ok(());
        }
        self.settled_since_compact += 1;
        if self.settled_since_compact < compact_threshold {
            return Ok(());
        }

        let mut live = Vec::new();
        let mut dead = Vec::new();
        for channel in Channel::ALL {
            let (l, d) = self.channels[channel.index()].journaled(channel);
            live.extend(l);
            dead.extend(d);
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.rewrite(&live, &dead)?;
            tracing::debug!(live = live.len(), "Queue journal compacted");
        }
        self.settled_since_compact = 0;
        Ok(())
    }
}

pub struct LocalQueue {
    state: Mutex<State>,
    notify: [Notify; 2],
    policy: QueuePolicy,
    online: AtomicBool,
}

impl LocalQueue {
    /// Volatile queue: nothing survives the process
    pub fn in_memory(policy: QueuePolicy) -> Self {
        Self::with_state(
            State {
                channels: Default::default(),
                next_tag: 0,
                journal: None,
                settled_since_compact: 0,
            },
            policy,
        )
    }

    /// Durable queue journaled at `path`; unsettled messages from a previous
    /// run are made ready again.
    pub fn open(path: impl AsRef<Path>, sync: SyncPolicy, policy: QueuePolicy) -> Result<Self> {
        let (journal, recovered) = Journal::open(path, sync)?;

        let mut channels: [ChannelState; 2] = Default::default();
        for message in recovered.pending {
            channels[message.channel.index()]
                .ready
                .push_back(Pending::new(message.tag, message.body));
        }
        for message in recovered.dead_lettered {
            channels[message.channel.index()]
                .dead
                .push(Pending::new(message.tag, message.body));
        }

        Ok(Self::with_state(
            State {
                channels,
                next_tag: recovered.next_tag,
                journal: Some(journal),
                settled_since_compact: 0,
            },
            policy,
        ))
    }

    fn with_state(state: State, policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(state),
            notify: [Notify::new(), Notify::new()],
            policy,
            online: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the broker
    pub fn set_available(&self, available: bool) {
        self.online.store(available, Ordering::SeqCst);
        if available {
            for notify in &self.notify {
                notify.notify_waiters();
            }
        }
    }

    /// Bodies currently dead-lettered on `channel`
    pub fn dead_letters(&self, channel: Channel) -> Vec<Vec<u8>> {
        self.lock().channels[channel.index()]
            .dead
            .iter()
            .map(|p| p.body.clone())
            .collect()
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unavailable(Component::Queue, "broker unreachable"))
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self, channel: Channel) {
        self.notify[channel.index()].notify_waiters();
    }

    /// Hand out the next ready message, or report when to look again
    fn try_take(&self, channel: Channel) -> std::result::Result<Delivery, Option<Instant>> {
        let mut state = self.lock();
        let chan = state.channel(channel);
        chan.promote_due(Instant::now());

        match chan.ready.pop_front() {
            Some(mut pending) => {
                pending.deliveries += 1;
                let delivery = Delivery {
                    tag: pending.tag,
                    channel,
                    body: pending.body.clone(),
                    attempt: pending.deliveries,
                };
                chan.in_flight.insert(pending.tag, pending);
                Ok(delivery)
            }
            None => Err(chan.next_due()),
        }
    }
}

#[async_trait]
impl QueueTransport for LocalQueue {
    async fn publish(&self, channel: Channel, body: Vec<u8>) -> Result<()> {
        self.check_online()?;
        {
            let mut state = self.lock();
            let tag = state.next_tag;
            if let Some(journal) = state.journal.as_mut() {
                journal
                    .append_publish(tag, channel, &body)
                    .map_err(|e| Error::unavailable(Component::Queue, e))?;
            }
            state.next_tag += 1;
            state.channel(channel).ready.push_back(Pending::new(tag, body));
            tracing::trace!(channel = %channel, tag, "Message published");
        }
        self.wake(channel);
        Ok(())
    }

    async fn consume(&self, channel: Channel) -> Result<Delivery> {
        loop {
            // registered before checking so a publish in between still wakes us
            let notified = self.notify[channel.index()].notified();
            self.check_online()?;

            match self.try_take(channel) {
                Ok(delivery) => return Ok(delivery),
                Err(Some(due)) => {
                    let wait = due.saturating_duration_since(Instant::now());
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.check_online()?;
        let mut state = self.lock();
        state
            .channel(delivery.channel)
            .in_flight
            .remove(&delivery.tag)
            .ok_or(Error::UnknownDelivery(delivery.tag))?;
        if let Some(journal) = state.journal.as_mut() {
            journal.append_ack(delivery.tag, delivery.channel)?;
        }
        state.record_settlement(self.policy.compact_threshold)
    }

    async fn nack(&self, delivery: &Delivery) -> Result<NackOutcome> {
        self.check_online()?;
        let outcome = {
            let mut state = self.lock();
            let chan = state.channel(delivery.channel);
            let mut pending = chan
                .in_flight
                .remove(&delivery.tag)
                .ok_or(Error::UnknownDelivery(delivery.tag))?;

            if pending.deliveries >= self.policy.max_deliveries {
                chan.dead.push(pending);
                if let Some(journal) = state.journal.as_mut() {
                    journal.append_dead_letter(delivery.tag, delivery.channel)?;
                }
                state.record_settlement(self.policy.compact_threshold)?;
                NackOutcome::DeadLettered
            } else {
                let delay = backoff_with_jitter(self.policy.redelivery_backoff, pending.deliveries);
                pending.due = Some(Instant::now() + delay);
                chan.delayed.push(pending);
                NackOutcome::Requeued { delay }
            }
        };
        // consumers parked without a deadline must learn about the new due time
        self.wake(delivery.channel);
        Ok(outcome)
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn depth(&self, channel: Channel) -> Result<ChannelDepth> {
        self.check_online()?;
        Ok(self.lock().channels[channel.index()].depth())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_policy(max_deliveries: u32) -> QueuePolicy {
        QueuePolicy {
            max_deliveries,
            redelivery_backoff: Duration::from_millis(5),
            compact_threshold: 10_000,
        }
    }

    #[tokio::test]
    async fn test_fifo_per_channel() {
        let queue = LocalQueue::in_memory(fast_policy(3));
        queue.publish(Channel::Writes, b"1".to_vec()).await.unwrap();
        queue.publish(Channel::Writes, b"2".to_vec()).await.unwrap();
        queue.publish(Channel::Deletes, b"x".to_vec()).await.unwrap();

        let first = queue.consume(Channel::Writes).await.unwrap();
        let second = queue.consume(Channel::Writes).await.unwrap();
        assert_eq!(first.body, b"1");
        assert_eq!(second.body, b"2");
        assert_eq!(first.attempt, 1);

        let delete = queue.consume(Channel::Deletes).await.unwrap();
        assert_eq!(delete.body, b"x");

        let depth = queue.depth(Channel::Writes).await.unwrap();
        assert_eq!(depth.in_flight, 2);
        assert_eq!(depth.ready, 0);

        queue.ack(&first).await.unwrap();
        queue.ack(&second).await.unwrap();
        assert_eq!(queue.depth(Channel::Writes).await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let queue = std::sync::Arc::new(LocalQueue::in_memory(fast_policy(3)));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.consume(Channel::Writes).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(Channel::Writes, b"late".to_vec()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let queue = LocalQueue::in_memory(fast_policy(2));
        queue.publish(Channel::Writes, b"m".to_vec()).await.unwrap();

        let first = queue.consume(Channel::Writes).await.unwrap();
        assert!(matches!(
            queue.nack(&first).await.unwrap(),
            NackOutcome::Requeued { .. }
        ));

        let second = tokio::time::timeout(Duration::from_secs(2), queue.consume(Channel::Writes))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.tag, first.tag);
        assert_eq!(second.attempt, 2);

        assert_eq!(queue.nack(&second).await.unwrap(), NackOutcome::DeadLettered);
        let depth = queue.depth(Channel::Writes).await.unwrap();
        assert_eq!(depth.pending(), 0);
        assert_eq!(depth.dead_lettered, 1);
        assert_eq!(queue.dead_letters(Channel::Writes), vec![b"m".to_vec()]);
    }

    #[tokio::test]
    async fn test_settling_twice_is_rejected() {
        let queue = LocalQueue::in_memory(fast_policy(3));
        queue.publish(Channel::Deletes, b"d".to_vec()).await.unwrap();
        let delivery = queue.consume(Channel::Deletes).await.unwrap();

        queue.ack(&delivery).await.unwrap();
        assert!(matches!(
            queue.ack(&delivery).await,
            Err(Error::UnknownDelivery(_))
        ));
        assert!(queue.nack(&delivery).await.is_err());
    }

    #[tokio::test]
    async fn test_offline_queue_rejects_publish() {
        let queue = LocalQueue::in_memory(fast_policy(3));
        queue.set_available(false);
        assert!(matches!(
            queue.publish(Channel::Writes, b"x".to_vec()).await,
            Err(Error::DependencyUnavailable {
                component: Component::Queue,
                ..
            })
        ));
        assert!(queue.ping().await.is_err());

        queue.set_available(true);
        assert_eq!(queue.depth(Channel::Writes).await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_journal_restores_unacked_messages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");

        {
            let queue = LocalQueue::open(&path, SyncPolicy::Always, fast_policy(3)).unwrap();
            queue.publish(Channel::Writes, b"done".to_vec()).await.unwrap();
            queue.publish(Channel::Writes, b"in-flight".to_vec()).await.unwrap();
            queue.publish(Channel::Deletes, b"queued".to_vec()).await.unwrap();

            let done = queue.consume(Channel::Writes).await.unwrap();
            queue.ack(&done).await.unwrap();
            // taken but never settled: the process "dies" here
            let _lost = queue.consume(Channel::Writes).await.unwrap();
        }

        let queue = LocalQueue::open(&path, SyncPolicy::Always, fast_policy(3)).unwrap();
        let redelivered = queue.consume(Channel::Writes).await.unwrap();
        assert_eq!(redelivered.body, b"in-flight");
        assert_eq!(queue.consume(Channel::Deletes).await.unwrap().body, b"queued");

        // tags keep increasing across restarts
        queue.publish(Channel::Writes, b"new".to_vec()).await.unwrap();
        let new = queue.consume(Channel::Writes).await.unwrap();
        assert!(new.tag > redelivered.tag);
    }

    #[tokio::test]
    async fn test_compaction_keeps_live_messages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        let policy = QueuePolicy {
            compact_threshold: 2,
            ..fast_policy(3)
        };

        {
            let queue = LocalQueue::open(&path, SyncPolicy::Interval, policy).unwrap();
            for i in 0..5u8 {
                queue.publish(Channel::Writes, vec![i]).await.unwrap();
            }
            for _ in 0..4 {
                let d = queue.consume(Channel::Writes).await.unwrap();
                queue.ack(&d).await.unwrap();
            }
        }

        let queue = LocalQueue::open(&path, SyncPolicy::Interval, policy).unwrap();
        let depth = queue.depth(Channel::Writes).await.unwrap();
        assert_eq!(depth.ready, 1);
        assert_eq!(queue.consume(Channel::Writes).await.unwrap().body, vec![4]);
    }
}
