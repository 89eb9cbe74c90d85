use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Priorité d'un service, détermine le comportement de restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePriority {
    /// Watcher filesystem — restart immédiat, retries illimités
    Critical,
    /// Scheduler de renouvellement — restart lent, max 5 retries
    Background,
}

impl ServicePriority {
    fn max_retries(self) -> u32 {
        match self {
            Self::Critical => u32::MAX,
            Self::Background => 5,
        }
    }

    fn backoff(self, retry: u32) -> Duration {
        match self {
            Self::Critical => Duration::from_millis(200 * u64::from(retry)),
            Self::Background => Duration::from_secs(5 * u64::from(retry)),
        }
    }
}

/// Lance un service supervisé dans une tâche tokio.
///
/// Le service est relancé en cas d'erreur ou de panic selon sa priorité;
/// le compteur de retries se réinitialise après 60 s de fonctionnement.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    priority: ServicePriority,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let max_retries = priority.max_retries();
        let mut retries: u32 = 0;
        let mut last_start = Instant::now();

        loop {
            info!("[supervisor] starting {name}");
            let service = Arc::clone(&factory);
            let outcome = tokio::spawn(async move { service().await }).await;

            match outcome {
                Ok(Ok(())) => {
                    info!("[supervisor] {name} exited cleanly");
                    break;
                }
                Ok(Err(e)) => error!("[supervisor] {name} failed: {e:#}"),
                Err(join_error) => error!("[supervisor] {name} panicked: {join_error}"),
            }

            if last_start.elapsed() > Duration::from_secs(60) {
                retries = 0;
            }
            retries = retries.saturating_add(1);
            if retries > max_retries {
                error!("[supervisor] {name} exceeded {max_retries} retries, giving up");
                break;
            }

            let backoff = priority.backoff(retries);
            warn!("[supervisor] {name} restarting in {backoff:?} (attempt {retries})");
            tokio::time::sleep(backoff).await;
            last_start = Instant::now();
        }
    })
}
