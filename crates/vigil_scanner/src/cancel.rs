//! Per-job cancellation watcher.
//!
//! Each in-flight task subscribes to `{cancel_prefix}:{job_id}`. Any message
//! on that channel - the payload does not matter - cancels the task's token,
//! which every long operation under the task observes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vigil_store::{StateBackend, StoreError};

pub struct CancelWatcher {
    /// Set when the cancellation arrived via the channel (as opposed to the
    /// task deadline firing the same token).
    requested: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CancelWatcher {
    /// Subscribe and start watching. The subscription is live before this
    /// returns, so a cancel published right after task start is not missed.
    pub async fn spawn(
        backend: &Arc<dyn StateBackend>,
        channel: String,
        token: CancellationToken,
    ) -> Result<Self, StoreError> {
        let mut subscription = backend.subscribe(&channel).await?;
        let requested = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&requested);
        let handle = tokio::spawn(async move {
            if subscription.recv().await.is_some() {
                info!("Cancellation signal on {}", channel);
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            }
        });
        Ok(Self { requested, handle })
    }

    /// Whether a cancel message was observed (vs. the token firing for some
    /// other reason, like a deadline).
    pub fn cancel_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Tear the watcher down once the task is finished.
    pub fn stop(self) -> bool {
        let requested = self.cancel_requested();
        self.handle.abort();
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vigil_store::MemoryBackend;

    #[tokio::test]
    async fn message_fires_token_and_flag() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let token = CancellationToken::new();
        let watcher = CancelWatcher::spawn(&backend, "vigil:cancel:j5".to_string(), token.clone())
            .await
            .unwrap();

        backend.publish("vigil:cancel:j5", "stop").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should cancel");
        assert!(watcher.stop());
    }

    #[tokio::test]
    async fn no_message_means_no_cancel() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let token = CancellationToken::new();
        let watcher = CancelWatcher::spawn(&backend, "vigil:cancel:j6".to_string(), token.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
        assert!(!watcher.stop());
    }

    #[tokio::test]
    async fn other_jobs_channel_does_not_cancel() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let token = CancellationToken::new();
        let _watcher = CancelWatcher::spawn(&backend, "vigil:cancel:j7".to_string(), token.clone())
            .await
            .unwrap();

        backend.publish("vigil:cancel:other", "stop").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
    }
}
