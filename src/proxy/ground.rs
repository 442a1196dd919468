//! The Block proxy
//!
//! Grounds every dial with a sentinel error. Flows routed here by policy
//! never reach the network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::dialer::{Dialer, NoopController};
use super::{ids, Proxy, ProxyConn, ProxyStatus, ProxyType};
use crate::core::NetProto;
use crate::error::ProxyError;

/// Proxy whose dials always fail.
pub struct GroundProxy {
    dialer: Arc<Dialer>,
    status: AtomicI32,
}

impl GroundProxy {
    /// Create the `Block` proxy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dialer: Arc::new(Dialer::new(ids::BLOCK, Arc::new(NoopController))),
            status: AtomicI32::new(ProxyStatus::Up.code()),
        }
    }
}

impl Default for GroundProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Proxy for GroundProxy {
    fn id(&self) -> &str {
        ids::BLOCK
    }

    fn kind(&self) -> ProxyType {
        ProxyType::Noop
    }

    async fn dial(&self, _network: NetProto, addr: SocketAddr) -> Result<ProxyConn, ProxyError> {
        debug!("proxy: blocked dial to {addr}");
        Err(ProxyError::Blocked)
    }

    fn dialer(&self) -> Arc<Dialer> {
        Arc::clone(&self.dialer)
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus::from_code(self.status.load(Ordering::Relaxed))
    }

    async fn refresh(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn stop(&self) {
        self.status
            .store(ProxyStatus::Stopped.code(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for GroundProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroundProxy")
            .field("status", &self.status())
            .finish()
    }
}
