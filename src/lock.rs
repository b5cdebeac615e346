use crate::event::{Command, EventQueue};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the agent's lock status comes from.
#[async_trait]
pub trait LockStatusSource: Send + Sync {
    async fn is_locked(&self) -> Result<bool>;
}

/// Re-evaluates a condition on a fixed interval until it holds or the token
/// is cancelled.
pub struct PollUntil {
    interval: Duration,
    token: CancellationToken,
}

impl PollUntil {
    pub fn new(interval: Duration, token: CancellationToken) -> Self {
        Self { interval, token }
    }

    /// Returns true once `check` holds, false when cancelled first.
    pub async fn run<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            if check().await {
                return true;
            }
            select! {
                _ = self.token.cancelled() => return false,
                _ = sleep(self.interval) => {}
            }
        }
    }
}

/// Watches a force-locked agent and posts [`Command::Unlock`] once the
/// backend reports it unlocked.
pub struct LockMonitor {
    source: Arc<dyn LockStatusSource>,
    queue: EventQueue,
    poll: PollUntil,
}

impl LockMonitor {
    pub fn new(
        source: Arc<dyn LockStatusSource>,
        queue: EventQueue,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            source,
            queue,
            poll: PollUntil::new(interval, token),
        }
    }

    pub async fn serve(self) {
        info!("waiting for agent unlock");
        let source = self.source.clone();
        let unlocked = self
            .poll
            .run(|| {
                let source = source.clone();
                async move {
                    match source.is_locked().await {
                        Ok(locked) => {
                            debug!(locked, "lock status polled");
                            !locked
                        }
                        Err(e) => {
                            warn!("failed to poll lock status: {}", e);
                            false
                        }
                    }
                }
            })
            .await;
        if unlocked {
            self.queue.send(Command::Unlock.into()).ok();
        } else {
            debug!("lock monitor cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EngineEvent;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        polls: AtomicUsize,
        unlock_after: usize,
    }

    #[async_trait]
    impl LockStatusSource for ScriptedSource {
        async fn is_locked(&self) -> Result<bool> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(anyhow!("backend down"));
            }
            Ok(n < self.unlock_after)
        }
    }

    #[tokio::test]
    async fn test_unlock_posts_command() {
        let source = Arc::new(ScriptedSource {
            polls: AtomicUsize::new(0),
            unlock_after: 3,
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let monitor = LockMonitor::new(
            source.clone(),
            tx,
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        monitor.serve().await;
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::Command(Command::Unlock))
        ));
        assert_eq!(source.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let source = Arc::new(ScriptedSource {
            polls: AtomicUsize::new(0),
            unlock_after: usize::MAX,
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let monitor = LockMonitor::new(source, tx, Duration::from_millis(5), token.clone());
        let handle = tokio::spawn(monitor.serve());
        sleep(Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
