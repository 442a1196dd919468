//! DNS resolution pipeline
//!
//! A multi-transport [`resolver`](crate::dns::Resolver) fronted by the
//! [`ALG`](crate::dns::AlgGateway), with blocklist filtering and DNS64
//! synthesis applied around whichever transport answers.

pub mod alg;
pub mod blocklist;
pub mod dns64;
pub mod resolver;
pub mod transport;
pub mod util;

pub use alg::AlgGateway;
pub use blocklist::{DomainFilter, StaticDomainFilter};
pub use dns64::NatPt;
pub use resolver::Resolver;
pub use transport::{
    ids, is_reserved, DnsListener, DnsSummary, Transport, TransportKind, TransportMult,
};
