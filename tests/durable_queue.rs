//! Restart behaviour of the journaled queue and the RocksDB store

use kvpipe::common::{Config, QueueBackend, QueueConfig, StoreBackend, StoreConfig, SyncPolicy};
use kvpipe::coordinator::Pipeline;
use kvpipe::queue::{Channel, LocalQueue, QueueMessage, QueuePolicy, QueueTransport};
use kvpipe::worker::ApplyOutcome;
use std::time::Duration;
use tempfile::TempDir;

fn on_disk_config(dir: &TempDir) -> Config {
    Config {
        queue: QueueConfig {
            backend: QueueBackend::Journal,
            journal_path: dir.path().join("queue.journal"),
            sync: SyncPolicy::Always,
            redelivery_backoff_ms: 1,
            ..QueueConfig::default()
        },
        store: StoreConfig {
            backend: StoreBackend::Rocksdb,
            path: dir.path().join("store"),
            ..StoreConfig::default()
        },
        ..Config::default()
    }
}

#[tokio::test]
async fn test_unacked_write_is_applied_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = on_disk_config(&dir);

    {
        let pipeline = Pipeline::open(&config).unwrap();
        let writer = pipeline.writer(&config);
        writer.write(Some("a"), Some("1")).await.unwrap();
        writer.write(Some("b"), Some("2")).await.unwrap();

        // taken but never settled, as if the worker died mid-apply
        let delivery = pipeline.queue.consume(Channel::Writes).await.unwrap();
        assert_eq!(delivery.attempt, 1);
    }

    let pipeline = Pipeline::open(&config).unwrap();
    let depth = pipeline.queue.depth(Channel::Writes).await.unwrap();
    assert_eq!(depth.ready, 2);

    let worker = pipeline.worker(&config);
    for _ in 0..2 {
        assert_eq!(
            worker.process_next(Channel::Writes).await.unwrap(),
            ApplyOutcome::Acked
        );
    }

    let reader = pipeline.reader(&config);
    assert_eq!(reader.read("a").await.unwrap(), "1");
    assert_eq!(reader.read("b").await.unwrap(), "2");
}

#[tokio::test]
async fn test_applied_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = on_disk_config(&dir);

    {
        let pipeline = Pipeline::open(&config).unwrap();
        pipeline
            .writer(&config)
            .write(Some("k"), Some("v"))
            .await
            .unwrap();
        pipeline
            .worker(&config)
            .process_next(Channel::Writes)
            .await
            .unwrap();
    }

    // cache is gone after restart, the store answers
    let pipeline = Pipeline::open(&config).unwrap();
    assert_eq!(pipeline.queue.depth(Channel::Writes).await.unwrap().pending(), 0);
    assert_eq!(pipeline.reader(&config).read("k").await.unwrap(), "v");
}

#[tokio::test]
async fn test_dead_letters_are_kept_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.journal");
    let policy = QueuePolicy {
        max_deliveries: 2,
        redelivery_backoff: Duration::from_millis(1),
        ..QueuePolicy::default()
    };
    let body = QueueMessage::Delete { key: "x".into() }.encode().unwrap();

    {
        let queue = LocalQueue::open(&path, SyncPolicy::Always, policy).unwrap();
        queue.publish(Channel::Deletes, body.clone()).await.unwrap();
        for _ in 0..2 {
            let delivery = tokio::time::timeout(
                Duration::from_secs(2),
                queue.consume(Channel::Deletes),
            )
            .await
            .unwrap()
            .unwrap();
            queue.nack(&delivery).await.unwrap();
        }
        assert_eq!(queue.dead_letters(Channel::Deletes), vec![body.clone()]);
    }

    let queue = LocalQueue::open(&path, SyncPolicy::Always, policy).unwrap();
    let depth = queue.depth(Channel::Deletes).await.unwrap();
    assert_eq!(depth.pending(), 0);
    assert_eq!(depth.dead_lettered, 1);
    assert_eq!(queue.dead_letters(Channel::Deletes), vec![body]);
}
