use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};

/// Time source for the STATUS poll loop
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real time, backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when slept on. Sleeps return immediately.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.elapsed.lock() {
            Ok(elapsed) => *elapsed,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn advance(&self, duration: Duration) {
        match self.elapsed.lock() {
            Ok(mut elapsed) => *elapsed += duration,
            Err(poisoned) => *poisoned.into_inner() += duration,
        }
    }

    /// Every duration slept so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        match self.sleeps.lock() {
            Ok(sleeps) => sleeps.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
    }
}

#[async_trait]
impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}

/// Runs `operation` unless `cancel` fires first.
pub async fn with_cancel<T, F>(
    cancel: &CancellationToken,
    phase: &str,
    session_id: &str,
    operation: F,
) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            log::warn!("Cancelled during {} for session {}", phase, session_id);
            Err(AppError::upload_cancelled(phase, session_id))
        }
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_millis(1200)).await;
        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now() - start, Duration::from_millis(6200));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(1200), Duration::from_secs(5)]
        );
    }

    #[tokio::test]
    async fn cancelled_operations_report_their_phase() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: AppResult<()> = with_cancel(&cancel, "STATUS", "s-1", async {
            std::future::pending::<AppResult<()>>().await
        })
        .await;

        match result {
            Err(AppError::UploadCancelled { phase, session_id }) => {
                assert_eq!(phase, "STATUS");
                assert_eq!(session_id, "s-1");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn uncancelled_operations_complete() {
        let cancel = CancellationToken::new();
        let value = with_cancel(&cancel, "INIT", "s-1", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
