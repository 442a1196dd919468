//! Direct proxies
//!
//! `Base` dials straight out, bound to whichever interface the controller
//! picks for it. `Exit` is the same dial path but always exits to the
//! Internet regardless of split-routing choices; the controller tells the
//! two apart by the owner name it is handed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::dialer::{Controller, Dialer};
use super::{ids, Proxy, ProxyConn, ProxyStatus, ProxyType};
use crate::core::NetProto;
use crate::error::ProxyError;

/// Direct-dial proxy used for both `Base` and `Exit`.
pub struct DirectProxy {
    id: &'static str,
    kind: ProxyType,
    dialer: Arc<Dialer>,
    status: AtomicI32,
}

impl DirectProxy {
    /// The `Base` proxy: direct dial on the active interface.
    #[must_use]
    pub fn base(ctl: Arc<dyn Controller>) -> Self {
        Self {
            id: ids::BASE,
            kind: ProxyType::Noop,
            dialer: Arc::new(Dialer::new(ids::BASE, ctl)),
            status: AtomicI32::new(ProxyStatus::Up.code()),
        }
    }

    /// The `Exit` proxy: direct dial that always egresses to the Internet.
    #[must_use]
    pub fn exit(ctl: Arc<dyn Controller>) -> Self {
        Self {
            id: ids::EXIT,
            kind: ProxyType::Internet,
            dialer: Arc::new(Dialer::new(ids::EXIT, ctl)),
            status: AtomicI32::new(ProxyStatus::Up.code()),
        }
    }

    fn stopped(&self) -> bool {
        self.status.load(Ordering::Relaxed) == ProxyStatus::Stopped.code()
    }
}

#[async_trait]
impl super::Proxy for DirectProxy {
    fn id(&self) -> &str {
        self.id
    }

    fn kind(&self) -> ProxyType {
        self.kind
    }

    async fn dial(&self, network: NetProto, addr: SocketAddr) -> Result<ProxyConn, ProxyError> {
        if self.stopped() {
            return Err(ProxyError::Stopped {
                id: self.id.to_string(),
            });
        }

        let conn = match network {
            NetProto::Tcp => self.dialer.dial_tcp(addr).await.map(ProxyConn::Tcp),
            NetProto::Udp => self.dialer.dial_udp(addr).await.map(ProxyConn::Udp),
        };

        match conn {
            Ok(c) => {
                self.status
                    .store(ProxyStatus::Up.code(), Ordering::Relaxed);
                Ok(c)
            }
            Err(e) => {
                self.status
                    .store(ProxyStatus::Down.code(), Ordering::Relaxed);
                Err(ProxyError::dial(self.id, addr, e.to_string()))
            }
        }
    }

    fn dialer(&self) -> Arc<Dialer> {
        Arc::clone(&self.dialer)
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus::from_code(self.status.load(Ordering::Relaxed))
    }

    async fn refresh(&self) -> Result<(), ProxyError> {
        if self.stopped() {
            return Err(ProxyError::Stopped {
                id: self.id.to_string(),
            });
        }
        self.status
            .store(ProxyStatus::Up.code(), Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        debug!("proxy: {} stopped", self.id);
        self.status
            .store(ProxyStatus::Stopped.code(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for DirectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectProxy")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}
