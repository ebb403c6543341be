//! Client-global auth/network error state.
//!
//! 401/403 answers mean the stored credentials are bad; an unreachable
//! server while the host itself is online means the tunnel or backend is
//! down. A failure while the host is offline is not surfaced at all since it
//! heals by itself once connectivity returns.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorState {
    Unauthorized,
    Network,
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Whether this host currently has network connectivity at all.
    async fn is_online(&self) -> bool;
}

/// Treats the host as online when a TCP connect to `addr` succeeds within
/// the timeout.
#[derive(Debug, Clone)]
pub struct TcpConnectivity {
    addr: String,
    timeout: Duration,
}

impl TcpConnectivity {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpConnectivity {
    async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!("Connectivity probe to {} failed: {}", self.addr, e);
                false
            }
            Err(_) => {
                tracing::debug!("Connectivity probe to {} timed out", self.addr);
                false
            }
        }
    }
}

/// Fixed answer, for hosts where probing makes no sense and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticConnectivity(pub bool);

#[async_trait]
impl ConnectivityProbe for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.0
    }
}

#[derive(Clone)]
pub struct AuthMonitor {
    state: Arc<watch::Sender<Option<AuthErrorState>>>,
    connectivity: Arc<dyn ConnectivityProbe>,
}

impl AuthMonitor {
    pub fn new(connectivity: Arc<dyn ConnectivityProbe>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            connectivity,
        }
    }

    pub fn current(&self) -> Option<AuthErrorState> {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AuthErrorState>> {
        self.state.subscribe()
    }

    pub fn record_unauthorized(&self) {
        self.set(Some(AuthErrorState::Unauthorized));
    }

    /// Called for every network-level failure. Returns whether the failure
    /// was surfaced.
    pub async fn record_network_failure(&self) -> bool {
        if !self.connectivity.is_online().await {
            tracing::debug!("Request failed while offline - not surfacing");
            return false;
        }
        // A rejected token stays the more specific diagnosis.
        if self.current() != Some(AuthErrorState::Unauthorized) {
            self.set(Some(AuthErrorState::Network));
        }
        true
    }

    pub fn record_success(&self) {
        self.set(None);
    }

    /// New credentials were entered; assume they are good until a request
    /// proves otherwise.
    pub fn credentials_replaced(&self) {
        self.set(None);
    }

    fn set(&self, value: Option<AuthErrorState>) {
        self.state.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            match value {
                Some(state) => tracing::warn!("Client auth state changed to {:?}", state),
                None => tracing::info!("Client auth state cleared"),
            }
            *current = value;
            true
        });
    }
}

impl std::fmt::Debug for AuthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMonitor")
            .field("state", &self.current())
            .finish()
    }
}
