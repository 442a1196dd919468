//! Proxy registry
//!
//! Every upstream dial goes through a [`Proxy`]. Three are always present:
//! `Base` (direct, interface-bound), `Exit` (direct, always to the
//! Internet), and `Block` (refuses everything). The embedder registers any
//! further proxies (SOCKS5, HTTP CONNECT, WireGuard, ...) behind the same
//! trait.

pub mod dialer;
mod direct;
mod ground;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

pub use dialer::{Controller, Dialer, NoopController};
pub use direct::DirectProxy;
pub use ground::GroundProxy;

use crate::core::NetProto;
use crate::error::ProxyError;

/// Reserved proxy ids.
pub mod ids {
    /// Blocks all traffic
    pub const BLOCK: &str = "Block";
    /// Direct dial on the active interface; the catch-all fallback
    pub const BASE: &str = "Base";
    /// Direct dial that always exits to the Internet
    pub const EXIT: &str = "Exit";
}

/// Proxy flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// SOCKS5 proxy
    Socks5,
    /// HTTP/1.1 CONNECT proxy
    Http1,
    /// WireGuard-as-a-proxy
    Wg,
    /// HTTP/2 tunnel
    PipH2,
    /// WebSockets tunnel
    PipWs,
    /// No proxying (Base, Block)
    Noop,
    /// Egress network (Exit)
    Internet,
}

impl ProxyType {
    /// The conventional short name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Socks5 => "socks5",
            Self::Http1 => "http1",
            Self::Wg => "wg",
            Self::PipH2 => "piph2",
            Self::PipWs => "pipws",
            Self::Noop => "noop",
            Self::Internet => "net",
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of a proxy after its last operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Working
    Up,
    /// Last operation failed
    Down,
    /// Stopped
    Stopped,
}

impl ProxyStatus {
    /// Numeric code (`0`, `-1`, `-2`) reported to the embedder.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Up => 0,
            Self::Down => -1,
            Self::Stopped => -2,
        }
    }

    /// Inverse of [`ProxyStatus::code`]; unknown codes read as `Down`.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Up,
            -2 => Self::Stopped,
            _ => Self::Down,
        }
    }
}

/// An established upstream connection.
///
/// Proxies may only hand back stream or datagram sockets; anything else is
/// a setup failure at the flow engine.
#[derive(Debug)]
pub enum ProxyConn {
    /// A TCP connection
    Tcp(TcpStream),
    /// A connected UDP socket
    Udp(UdpSocket),
}

impl ProxyConn {
    /// Narrow to TCP.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotProxyConn`] for a datagram connection.
    pub fn into_tcp(self) -> Result<TcpStream, ProxyError> {
        match self {
            Self::Tcp(s) => Ok(s),
            Self::Udp(_) => Err(ProxyError::NotProxyConn),
        }
    }

    /// Narrow to UDP.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotProxyConn`] for a stream connection.
    pub fn into_udp(self) -> Result<UdpSocket, ProxyError> {
        match self {
            Self::Udp(s) => Ok(s),
            Self::Tcp(_) => Err(ProxyError::NotProxyConn),
        }
    }
}

/// A dialable upstream.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Unique id of this proxy.
    fn id(&self) -> &str;

    /// Flavor of this proxy.
    fn kind(&self) -> ProxyType;

    /// Dial `addr` over `network` through this proxy.
    ///
    /// # Errors
    ///
    /// Returns a [`ProxyError`] when the dial fails or is refused.
    async fn dial(&self, network: NetProto, addr: SocketAddr) -> Result<ProxyConn, ProxyError>;

    /// The direct dialer backing this proxy.
    fn dialer(&self) -> Arc<Dialer>;

    /// Health after the previous operation.
    fn status(&self) -> ProxyStatus;

    /// Re-register this proxy.
    ///
    /// # Errors
    ///
    /// Returns a [`ProxyError`] when the proxy cannot be refreshed.
    async fn refresh(&self) -> Result<(), ProxyError>;

    /// Stop this proxy.
    async fn stop(&self);
}

/// Keyed registry of proxies; `Base`, `Exit`, and `Block` are installed at
/// construction and survive refreshes.
pub struct ProxyRegistry {
    proxies: RwLock<HashMap<String, Arc<dyn Proxy>>>,
}

impl ProxyRegistry {
    /// Create a registry with the three fixed proxies installed.
    #[must_use]
    pub fn new(ctl: Arc<dyn Controller>) -> Self {
        let registry = Self {
            proxies: RwLock::new(HashMap::new()),
        };
        registry.add(Arc::new(DirectProxy::exit(Arc::clone(&ctl))));
        registry.add(Arc::new(DirectProxy::base(ctl)));
        registry.add(Arc::new(GroundProxy::new()));
        info!("proxy: registry ready");
        registry
    }

    /// Register `proxy`, stopping any proxy it displaces.
    pub fn add(&self, proxy: Arc<dyn Proxy>) -> bool {
        let id = proxy.id().to_string();
        let displaced = self.proxies.write().insert(id.clone(), proxy);
        if let Some(old) = displaced {
            debug!("proxy: {id} replaced; stopping old");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { old.stop().await });
            }
        }
        true
    }

    /// Deregister a proxy, stopping it.
    pub fn remove_proxy(&self, id: &str) -> bool {
        let removed = self.proxies.write().remove(id);
        match removed {
            Some(p) => {
                info!("proxy: removed {id}");
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { p.stop().await });
                }
                true
            }
            None => false,
        }
    }

    /// Look up a proxy by id.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] for empty or unknown ids.
    pub fn get_proxy(&self, id: &str) -> Result<Arc<dyn Proxy>, ProxyError> {
        if id.is_empty() {
            return Err(ProxyError::NotFound { id: id.to_string() });
        }
        self.proxies
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound { id: id.to_string() })
    }

    /// True when `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.proxies.read().contains_key(id)
    }

    /// Number of registered proxies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }

    /// Stop and drop every proxy.
    pub async fn stop_proxies(&self) {
        let drained: Vec<Arc<dyn Proxy>> =
            std::mem::take(&mut *self.proxies.write()).into_values().collect();
        let n = drained.len();
        for p in drained {
            p.stop().await;
        }
        info!("proxy: all({n}) stopped and removed");
    }

    /// Refresh every proxy; returns a csv of the ids that refreshed
    /// without error. No proxy is removed, so `Base`, `Exit`, and `Block`
    /// always survive.
    pub async fn refresh_proxies(&self) -> String {
        let proxies: Vec<Arc<dyn Proxy>> = self.proxies.read().values().cloned().collect();

        let mut active = Vec::with_capacity(proxies.len());
        for p in proxies {
            match p.refresh().await {
                Ok(()) => active.push(p.id().to_string()),
                Err(e) => warn!("proxy: refresh {}/{} failed: {e}", p.id(), p.kind()),
            }
        }
        active.sort_unstable();
        active.join(",")
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.proxies.read().keys().cloned().collect();
        f.debug_struct("ProxyRegistry").field("ids", &ids).finish()
    }
}
