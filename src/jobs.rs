//! Periodic job runner
//!
//! The schedule contract for the analyzer and the alert monitor is only
//! "invoke handler X every Y". Ticks that overrun are skipped rather than
//! bunched.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Run `job` every `period` until `shutdown` is cancelled
///
/// The first run happens one full period after start. Errors are logged and
/// do not stop the loop.
pub async fn run_periodic<F, Fut, T>(
    name: &str,
    period: Duration,
    shutdown: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    T: std::fmt::Debug,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // interval fires immediately on the first tick
    ticker.tick().await;

    info!(job = name, period_secs = period.as_secs(), "Periodic job scheduled");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match job().await {
            Ok(result) => debug!(job = name, ?result, "Periodic job finished"),
            Err(e) => warn!(job = name, error = %e, "Periodic job failed"),
        }
    }

    info!(job = name, "Periodic job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_period_until_cancelled() {
        let runs = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let handle = {
            let runs = runs.clone();
            let token = token.clone();
            tokio::spawn(async move {
                run_periodic("count", Duration::from_secs(60), token, move || {
                    let runs = runs.clone();
                    async move {
                        let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                        if n == 2 {
                            Err(Error::Internal("flaky".into()))
                        } else {
                            Ok(n)
                        }
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(60 * 3 + 30)).await;
        token.cancel();
        handle.await.unwrap();

        // A failed run does not stop the loop
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
