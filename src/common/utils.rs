//! Utility functions for kvpipe

use crate::common::{Component, Error, Result};
use crate::store::RESERVED_KEY_PREFIX;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Longest key accepted by the write path
pub const MAX_KEY_LEN: usize = 1024;

/// Ceiling for redelivery backoff
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate key (must be non-empty, reasonable length)
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("key is required".into()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "key too long (max {} bytes)",
            MAX_KEY_LEN
        )));
    }

    if key.starts_with(RESERVED_KEY_PREFIX) {
        return Err(Error::Validation("key uses a reserved prefix".into()));
    }

    if key.chars().any(|c| c.is_control()) {
        return Err(Error::Validation("key contains invalid characters".into()));
    }

    Ok(())
}

/// Run a dependency call under a deadline, mapping expiry to
/// [`Error::DependencyTimeout`] for `component`.
pub async fn with_timeout<T, F>(component: Component, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::DependencyTimeout {
            component,
            millis: limit.as_millis() as u64,
        }),
    }
}

/// Exponential backoff with up to 25% jitter. `attempt` starts at 1.
pub fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp).min(MAX_BACKOFF);
    let jitter_cap = delay.as_millis() as u64 / 4;
    if jitter_cap == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("normal-key").is_ok());
        assert!(validate_key("path/to/key").is_ok());
        assert!(matches!(validate_key(""), Err(Error::Validation(_))));
        assert!(validate_key(&"x".repeat(2000)).is_err());
        assert!(validate_key("bad\nkey").is_err());
        assert!(validate_key("_probe").is_ok());
        assert!(validate_key(&crate::store::probe_key()).is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let first = backoff_with_jitter(base, 1);
        assert!(first >= base && first <= base + base / 4);

        let third = backoff_with_jitter(base, 3);
        assert!(third >= Duration::from_millis(400));

        let huge = backoff_with_jitter(base, 40);
        assert!(huge <= MAX_BACKOFF + MAX_BACKOFF / 4);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_expiry() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        };
        let err = with_timeout(Component::Cache, Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DependencyTimeout {
                component: Component::Cache,
                millis: 10
            }
        ));

        let fast = async { Ok::<_, Error>(7) };
        assert_eq!(
            with_timeout(Component::Cache, Duration::from_millis(10), fast)
                .await
                .unwrap(),
            7
        );
    }
}
