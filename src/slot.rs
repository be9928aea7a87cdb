/// Single-flight gate for blocking advisor calls.
///
/// Each advisor owns one `Slot`. A call takes the slot's only permit and
/// carries it onto the blocking worker, so the slot stays busy until the
/// underlying call has actually returned, even after the caller stopped
/// waiting for it. A cycle that finds the slot busy gets `None` instead of
/// queueing behind the stale call.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct Slot {
    name:    &'static str,
    permits: Arc<Semaphore>,
}

impl Slot {
    pub fn new(name: &'static str) -> Self {
        Self { name, permits: Arc::new(Semaphore::new(1)) }
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Run `call` on the blocking pool and wait at most `timeout` for it.
    /// Busy slot, timeout and worker panic all collapse to `None`.
    pub async fn run<T, F>(&self, timeout: Duration, call: F) -> Option<T>
    where
        F: FnOnce() -> Option<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::debug!("{} advisor still busy — skipped this cycle", self.name);
                return None;
            }
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call()
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                tracing::warn!("{} advisor task failed: {}", self.name, e);
                None
            }
            Err(_) => {
                // Dropping the JoinHandle detaches the call; its permit is
                // released whenever it finally returns.
                tracing::warn!("{} advisor timed out after {:?} — result discarded", self.name, timeout);
                None
            }
        }
    }
}
