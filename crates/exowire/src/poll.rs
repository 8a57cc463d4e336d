//! # Bounded polling
//!
//! Nothing pushes a readiness signal across the isolation boundary, so both sides wait by
//! polling. Every loop here is bounded by a deadline, backs off between attempts, and gives up
//! as soon as the surrounding shutdown signal fires.
//!
//! The trade-off is latency: a condition that becomes true right after a check is only seen
//! one (possibly backed-off) interval later.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::shutdown::Shutdown;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The deadline passed before the condition held.
    TimedOut(Duration),
    /// The shutdown signal fired while waiting.
    Cancelled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut(limit) => write!(f, "gave up after {:?}", limit),
            Self::Cancelled => write!(f, "cancelled by shutdown"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Exponential backoff between polls.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// `None` polls until the condition holds or shutdown fires.
    pub deadline: Option<Duration>,
}

impl Backoff {
    /// Fixed-interval polling with no backoff.
    pub fn fixed(interval: Duration, deadline: Option<Duration>) -> Self {
        Self {
            initial: interval,
            max: interval,
            deadline,
        }
    }

    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max.max(self.initial))
    }
}

/// Calls `check` until it yields `Some`, sleeping between attempts.
pub async fn until<T, F, Fut>(backoff: Backoff, shutdown: &Shutdown, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    let mut interval = backoff.initial;
    let mut shutdown = shutdown.clone();

    loop {
        if shutdown.is_triggered() {
            return Err(Error::Cancelled);
        }
        if let Some(found) = check().await {
            return Ok(found);
        }

        let mut sleep_for = interval;
        if let Some(limit) = backoff.deadline {
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Err(Error::TimedOut(limit));
            }
            sleep_for = sleep_for.min(limit - elapsed);
        }

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.wait() => return Err(Error::Cancelled),
        }
        interval = backoff.next(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_until_returns_first_hit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let backoff = Backoff::fixed(Duration::from_millis(1), Some(Duration::from_secs(5)));

        let found = until(backoff, &Shutdown::never(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                (n == 3).then_some(n)
            }
        })
        .await
        .unwrap();

        assert_eq!(found, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_until_times_out() {
        let backoff = Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            deadline: Some(Duration::from_millis(30)),
        };
        let result: Result<()> = until(backoff, &Shutdown::never(), || async { None }).await;
        assert!(matches!(result, Err(Error::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_until_is_cancelled_by_shutdown() {
        let (trigger, shutdown) = crate::shutdown::channel();
        let backoff = Backoff::fixed(Duration::from_millis(5), None);

        let waiter = tokio::spawn(async move {
            until::<(), _, _>(backoff, &shutdown, || async { None }).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(Error::Cancelled));
    }
}
