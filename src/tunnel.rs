//! Tunnel assembly
//!
//! Wires the resolver, proxy registry, and flow engines together around a
//! single embedder [`Bridge`] and owns the global end flag. The embedder
//! feeds flows in from its IP-stack primitive and calls
//! [`Tunnel::disconnect`] exactly once on teardown (further calls are
//! no-ops).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::config::{BlockMode, TunMode, TunnelConfig};
use crate::dns::{NatPt, Resolver, Transport};
use crate::engine::{TcpHandler, UdpHandler};
use crate::ipset::IpSetRegistry;
use crate::proxy::ProxyRegistry;

/// A running tunnel core.
pub struct Tunnel {
    mode: Arc<TunMode>,
    resolver: Arc<Resolver>,
    proxies: Arc<ProxyRegistry>,
    ipset: Arc<IpSetRegistry>,
    tcp: Arc<TcpHandler>,
    udp: Arc<UdpHandler>,
    end: Arc<AtomicBool>,
}

impl Tunnel {
    /// Assemble a tunnel around the embedder's `bridge`.
    ///
    /// `default_dns` is the fallback transport registered with the
    /// resolver; the embedder adds further transports (and proxies) after
    /// construction.
    #[must_use]
    pub fn new<B>(config: &TunnelConfig, default_dns: Arc<dyn Transport>, bridge: Arc<B>) -> Arc<Self>
    where
        B: Bridge + 'static,
    {
        let mode = Arc::new(TunMode::new(config.block_mode));
        let natpt = Arc::new(NatPt::new());
        let proxies = Arc::new(ProxyRegistry::new(
            Arc::clone(&bridge) as Arc<dyn crate::proxy::Controller>
        ));

        let resolver = Resolver::new(
            &config.fake_dns,
            config.alg.clone(),
            Arc::clone(&mode),
            default_dns,
            Arc::clone(&bridge) as Arc<dyn crate::dns::DnsListener>,
            natpt,
        );

        let end = Arc::new(AtomicBool::new(false));
        let ipset = Arc::new(IpSetRegistry::new());
        let tcp = TcpHandler::new(
            Arc::clone(&resolver),
            Arc::clone(&proxies),
            Arc::clone(&mode),
            Arc::clone(&bridge) as Arc<dyn crate::bridge::SocketListener>,
            Arc::clone(&ipset),
            Arc::clone(&end),
        );
        let udp = UdpHandler::new(
            Arc::clone(&resolver),
            Arc::clone(&proxies),
            Arc::clone(&mode),
            Arc::clone(&bridge) as Arc<dyn crate::bridge::SocketListener>,
            Arc::clone(&ipset),
            config.nat_timeout(),
            Arc::clone(&end),
        );

        match resolver.start() {
            Ok(live) => info!("tun: <<< new >>>; dns: {live}"),
            Err(e) => warn!("tun: <<< new >>>; dns not ready: {e}"),
        }

        Arc::new(Self {
            mode,
            resolver,
            proxies,
            ipset,
            tcp,
            udp,
            end,
        })
    }

    /// The per-domain IP-set registry backing dial fallback order.
    #[must_use]
    pub fn ipset(&self) -> Arc<IpSetRegistry> {
        Arc::clone(&self.ipset)
    }

    /// The resolver.
    #[must_use]
    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.resolver)
    }

    /// The proxy registry.
    #[must_use]
    pub fn proxies(&self) -> Arc<ProxyRegistry> {
        Arc::clone(&self.proxies)
    }

    /// The TCP flow engine; the stack's TCP accept callback feeds it.
    #[must_use]
    pub fn tcp(&self) -> Arc<TcpHandler> {
        Arc::clone(&self.tcp)
    }

    /// The UDP flow engine; the stack's UDP callbacks feed it.
    #[must_use]
    pub fn udp(&self) -> Arc<UdpHandler> {
        Arc::clone(&self.udp)
    }

    /// The runtime-mutable tunnel mode.
    #[must_use]
    pub fn mode(&self) -> Arc<TunMode> {
        Arc::clone(&self.mode)
    }

    /// Switch the block mode.
    pub fn set_tun_mode(&self, block: BlockMode) {
        self.mode.set_block_mode(block);
    }

    /// Declare which address families currently have egress routes.
    pub fn set_route(&self, use4: bool, use6: bool) {
        self.mode.set_families(use4, use6);
    }

    /// True after [`Tunnel::disconnect`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.end.load(Ordering::Relaxed)
    }

    /// Tear the tunnel down: sets the end flag every pump observes, then
    /// stops the resolver, the proxies, and live NAT mappings. Idempotent.
    pub async fn disconnect(&self) {
        if self.end.swap(true, Ordering::SeqCst) {
            warn!("tun: <<< disconnect >>>; already closed");
            return;
        }

        self.resolver.stop();
        self.proxies.stop_proxies().await;
        self.udp.close_all().await;
        info!("tun: <<< disconnect >>>; ok");
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("closed", &self.is_closed())
            .finish()
    }
}
