//! Bounded-wait helpers shared by every cross-daemon poll.

use crate::error::{ObsError, ObsResult};
use std::future::Future;
use std::time::{Duration, Instant};

/// A wall-clock budget started at construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Poll `f` every `interval` until it yields `Some`, failing with [`ObsError::Timeout`]
/// once `budget` has passed.
///
/// Errors returned by `f` are propagated immediately. `what` names the awaited condition
/// in the timeout message.
///
/// # Example
///
/// ```rust,ignore
/// let snapshot = retry_until(Duration::from_secs(5), Duration::from_millis(20), "dome closed", || async {
///     let info = dome.get_info(true).await?;
///     Ok(info.info.dome_closed().then_some(info))
/// })
/// .await?;
/// ```
pub async fn retry_until<T, F, Fut>(
    budget: Duration,
    interval: Duration,
    what: &str,
    mut f: F,
) -> ObsResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ObsResult<Option<T>>>,
{
    let deadline = Deadline::new(budget);
    loop {
        if let Some(value) = f().await? {
            return Ok(value);
        }
        if deadline.expired() {
            return Err(ObsError::Timeout(format!(
                "{} not reached after {:.1}s",
                what,
                deadline.elapsed().as_secs_f64()
            )));
        }
        tokio::time::sleep(interval.min(deadline.remaining().max(Duration::from_millis(1))))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_deadline() {
        let d = Deadline::new(Duration::from_secs(60));
        assert!(!d.expired());
        assert!(d.remaining() <= Duration::from_secs(60));

        let d = Deadline::new(Duration::ZERO);
        assert!(d.expired());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retry_until_succeeds() {
        let calls = AtomicU32::new(0);
        let value = retry_until(
            Duration::from_secs(2),
            Duration::from_millis(1),
            "third call",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n >= 3).then_some(n))
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_retry_until_times_out() {
        let result: ObsResult<()> = retry_until(
            Duration::from_millis(20),
            Duration::from_millis(5),
            "never",
            || async { Ok(None) },
        )
        .await;
        match result {
            Err(ObsError::Timeout(msg)) => assert!(msg.starts_with("never not reached")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_until_propagates_errors() {
        let result: ObsResult<()> = retry_until(
            Duration::from_secs(1),
            Duration::from_millis(5),
            "anything",
            || async { Err(ObsError::Dependency("filt".into())) },
        )
        .await;
        assert!(matches!(result, Err(ObsError::Dependency(_))));
    }
}
