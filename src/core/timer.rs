//! Single-shot node timers.
//!
//! Every timer is armed explicitly and fires exactly once; the callback
//! decides whether to rearm. A timer task keeps its captured state (the
//! strong node reference) alive until it fires or is cancelled.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Default)]
pub(crate) struct OneshotTimer {
    handle: Option<JoinHandle<()>>,
}

impl OneshotTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arms the timer, cancelling any previous schedule.
    pub(crate) fn schedule<F>(
        &mut self,
        delay: Duration,
        fire: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            fire.await;
        }));
    }

    /// Best-effort cancel; safe to call repeatedly or before any schedule.
    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for OneshotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Randomized timeout in `[base, 2 * base)` milliseconds, breaking
/// symmetric election races between replicas.
pub(crate) fn random_timeout(base_ms: u64) -> Duration {
    let base_ms = base_ms.max(1);
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(base_ms..base_ms * 2))
}
