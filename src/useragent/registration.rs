use super::{Registrar, RegistrationState, RegistrationStatus};
use crate::config::{RegistrationConfig, SipConfig};
use crate::error::TransportError;
use crate::event::EventQueue;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Keeps one transport connection and one registration alive for the agent.
pub struct RegistrationManager {
    registrar: Arc<dyn Registrar>,
    queue: EventQueue,
    expires: u32,
    retry_initial: Duration,
    retry_max: Duration,
    token: CancellationToken,
}

enum Outcome {
    Cancelled,
    TransportLost,
}

impl RegistrationManager {
    pub fn new(
        registrar: Arc<dyn Registrar>,
        queue: EventQueue,
        sip: &SipConfig,
        retry: &RegistrationConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            registrar,
            queue,
            expires: sip.register_expires,
            retry_initial: Duration::from_secs(retry.retry_initial_secs.max(1)),
            retry_max: Duration::from_secs(retry.retry_max_secs.max(1)),
            token,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max.max(initial);
        self
    }

    fn report(&self, state: RegistrationState, error: Option<TransportError>) {
        let status = RegistrationStatus {
            state,
            status_code: error.as_ref().and_then(|e| e.status()),
            error,
        };
        self.queue.send(status.into()).ok();
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.retry_max)
    }

    /// Up to a tenth of the delay on top, so a PBX restart is not met by
    /// every agent at once.
    fn jittered(delay: Duration) -> Duration {
        let spread = (delay.as_millis() as u64 / 10).max(1);
        delay + Duration::from_millis(rand::rng().random_range(0..spread))
    }

    /// Returns false when cancelled during the wait.
    async fn wait(&self, delay: Duration) -> bool {
        select! {
            _ = self.token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    async fn registered_loop(&self, backoff: &mut Duration) -> Outcome {
        loop {
            match self.registrar.register(self.expires).await {
                Ok(granted) => {
                    *backoff = self.retry_initial;
                    info!(expires = granted, "registration refreshed");
                    self.report(RegistrationState::Registered, None);
                    // 75% of expiration time
                    let refresh = Duration::from_secs((granted as u64 * 3 / 4).max(1));
                    if !self.wait(refresh).await {
                        return Outcome::Cancelled;
                    }
                }
                Err(e) if e.is_transport_loss() => {
                    warn!("transport lost while registering: {}", e);
                    self.report(RegistrationState::Disconnected, Some(e));
                    return Outcome::TransportLost;
                }
                Err(e) => {
                    warn!(status = ?e.status(), "registration rejected: {}", e);
                    self.report(RegistrationState::Connected, Some(e));
                    let delay = Self::jittered(*backoff);
                    *backoff = self.next_backoff(*backoff);
                    if !self.wait(delay).await {
                        return Outcome::Cancelled;
                    }
                }
            }
        }
    }

    /// Runs until cancelled, then removes the binding.
    pub async fn serve(&self) {
        let mut backoff = self.retry_initial;
        let mut registered_once = false;
        loop {
            if self.token.is_cancelled() {
                break;
            }
            self.report(RegistrationState::Connecting, None);
            match self.registrar.connect().await {
                Ok(()) => {
                    info!("signaling transport connected");
                    self.report(RegistrationState::Connected, None);
                    registered_once = true;
                    match self.registered_loop(&mut backoff).await {
                        Outcome::Cancelled => break,
                        Outcome::TransportLost => {}
                    }
                }
                Err(e) => {
                    warn!("failed to connect signaling transport: {}", e);
                    self.report(RegistrationState::Disconnected, Some(e));
                }
            }
            let delay = Self::jittered(backoff);
            backoff = self.next_backoff(backoff);
            info!(delay_ms = delay.as_millis() as u64, "reconnecting signaling transport");
            if !self.wait(delay).await {
                break;
            }
        }

        if registered_once {
            match self.registrar.register(0).await {
                Ok(_) => info!("registration removed"),
                Err(e) => warn!("failed to remove registration: {}", e),
            }
        }
        self.report(RegistrationState::Disconnected, None);
    }
}
