//! Keeps one logical subscription to a passive feed alive.
//!
//! Passive streams (the cross-session active-agents feed) reconnect on
//! their own with exponential backoff. User-initiated response streams never
//! come through here; see the coordinator for those.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::client::{ActiveAgentsFeed, AuthErrorState, AuthMonitor, ClientError};
use crate::core::config::ReconnectConfig;
use crate::core::ActiveAgentsEvent;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    /// Delay before the next attempt; doubles for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Connected,
    Event(ActiveAgentsEvent),
    /// Subscription lost; next attempt after `retry_in`.
    Disconnected { error: String, retry_in: Duration },
    /// Token rejected; reconnecting waits for new credentials.
    AwaitingCredentials,
}

/// Owns the reconnect task. Shutting down (or dropping) the supervisor
/// cancels any pending timer and closes the open transport.
pub struct ReconnectSupervisor {
    task: Option<JoinHandle<()>>,
}

impl ReconnectSupervisor {
    pub fn spawn<F>(feed: Arc<dyn ActiveAgentsFeed>, backoff: Backoff, auth: AuthMonitor, on_event: F) -> Self
    where
        F: FnMut(SupervisorEvent) + Send + 'static,
    {
        let task = tokio::spawn(supervise(feed, backoff, auth, on_event));
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Cancelled is the expected outcome.
            let _ = task.await;
        }
        tracing::debug!("Active agents supervisor stopped");
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn supervise<F>(feed: Arc<dyn ActiveAgentsFeed>, mut backoff: Backoff, auth: AuthMonitor, mut on_event: F)
where
    F: FnMut(SupervisorEvent),
{
    loop {
        let error = match feed.open_active_agents_stream().await {
            Ok(mut transport) => {
                tracing::info!("Subscribed to active agents feed");
                backoff.reset();
                on_event(SupervisorEvent::Connected);

                let error = loop {
                    match transport.next().await {
                        Some(Ok(event)) => {
                            backoff.reset();
                            on_event(SupervisorEvent::Event(event));
                        }
                        Some(Err(e)) => break e,
                        None => break ClientError::StreamClosed("active-agents".to_string()),
                    }
                };
                transport.close();

                // Open failures already went through the client's response handler.
                if matches!(error, ClientError::Network(_)) {
                    auth.record_network_failure().await;
                }
                error
            }
            Err(e) => e,
        };

        if matches!(error, ClientError::Unauthorized(_)) {
            tracing::warn!("Active agents feed rejected credentials, waiting for new ones");
            on_event(SupervisorEvent::AwaitingCredentials);
            let mut state = auth.subscribe();
            if state
                .wait_for(|state| *state != Some(AuthErrorState::Unauthorized))
                .await
                .is_err()
            {
                return;
            }
        }

        let retry_in = backoff.next_delay();
        tracing::warn!("Active agents feed lost ({}), reconnecting in {:?}", error, retry_in);
        on_event(SupervisorEvent::Disconnected {
            error: error.to_string(),
            retry_in,
        });
        tokio::time::sleep(retry_in).await;
    }
}
