//! tungate: userspace TUN flow engine with a DNS application-level gateway
//!
//! This crate is the core of a userspace network tunnel. An external
//! IP-stack primitive turns raw TUN packets into TCP/UDP flows and hands
//! them in through the [`netstack`] contracts; from there:
//!
//! - the [`flow`] gate undoes synthetic DNS answers against the
//!   [ALG](dns::AlgGateway), consults the embedder's policy callback, and
//!   stalls repeat offenders,
//! - the [`proxy`] registry dials upstream (direct, Internet-bound, or a
//!   registered proxy client; `Block` refuses),
//! - the [`engine`] splices bytes both ways and emits one
//!   [summary](summary::SocketSummary) per flow,
//! - the [`dns`] pipeline serves intercepted DNS through named transports,
//!   rewriting answers to synthetic IPs so every flow can be attributed to
//!   a domain at setup time.
//!
//! # Architecture
//!
//! ```text
//! TUN → IP stack → accept callbacks → flow gate → proxy dial → splice
//!                        │                 │
//!                   DNS intercept      DNS ALG (synthetic ⇄ real)
//!                        │                 │
//!                     resolver ── transports (DNS53/DoH/DNSCrypt/System)
//! ```
//!
//! The stack primitive, concrete proxy clients, and concrete DNS
//! transports live with the embedder; this crate defines their contracts
//! and everything between them.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod config;
pub mod core;
pub mod dns;
pub mod engine;
pub mod error;
pub mod flow;
pub mod ipset;
pub mod netstack;
pub mod proxy;
pub mod summary;
pub mod tunnel;

pub use bridge::{Bridge, FlowDecision, SocketListener};
pub use config::{AlgConfig, BlockMode, TunMode, TunnelConfig};
pub use crate::core::{ExpiringCounter, NetProto};
pub use dns::{
    AlgGateway, DnsListener, DnsSummary, DomainFilter, NatPt, Resolver, StaticDomainFilter,
    Transport, TransportKind, TransportMult,
};
pub use engine::{TcpHandler, UdpHandler};
pub use error::{FlowError, ProxyError, QueryError, QueryStatus, TungateError};
pub use ipset::{IpSetRegistry, NameResolver};
pub use netstack::{StackStream, TcpFlow, UdpFlow};
pub use proxy::{
    Controller, Dialer, DirectProxy, GroundProxy, NoopController, Proxy, ProxyConn, ProxyRegistry,
    ProxyStatus, ProxyType,
};
pub use summary::{L4Proto, SocketSummary};
pub use tunnel::Tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
