//! DNS transport contracts
//!
//! A [`Transport`] answers raw DNS wire queries over a given network
//! (datagram or stream). Concrete transports (DNS53, DoH, DNSCrypt, the
//! system resolver) live with the embedder; the resolver only sees this
//! trait. A handful of ids are reserved for singleton roles.

use async_trait::async_trait;

use crate::core::NetProto;
use crate::error::{QueryError, QueryStatus};

/// Reserved transport ids.
pub mod ids {
    /// Default (fallback) DNS
    pub const DEFAULT: &str = "Default";
    /// Network/OS provided DNS
    pub const SYSTEM: &str = "System";
    /// User-preferred DNS; the ALG fronts this transport
    pub const PREFERRED: &str = "Preferred";
    /// No local blocks; falls back to Default when unset
    pub const BLOCK_FREE: &str = "BlockFree";
    /// Blocks all queries
    pub const BLOCK_ALL: &str = "BlockAll";
    /// The DNS application-level gateway
    pub const ALG: &str = "Alg";
    /// DNSCrypt multi-transport
    pub const DC_PROXY: &str = "DcProxy";
}

/// True for ids the resolver treats as internal singletons.
#[must_use]
pub fn is_reserved(id: &str) -> bool {
    matches!(id, ids::ALG | ids::DC_PROXY | ids::BLOCK_ALL)
}

/// Transport flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain RFC 1035 over udp/tcp port 53
    Dns53,
    /// DNS-over-HTTPS
    Doh,
    /// DNSCrypt
    DnsCrypt,
    /// Whatever the host network hands out
    System,
}

impl TransportKind {
    /// The conventional display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns53 => "DNS",
            Self::Doh => "DNS-over-HTTPS",
            Self::DnsCrypt => "DNSCrypt",
            Self::System => "System",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one DNS transaction, reported to the embedder when complete.
#[derive(Debug, Clone, Default)]
pub struct DnsSummary {
    /// Transport flavor that served the query
    pub kind: String,
    /// Transport id that served the query
    pub id: String,
    /// Response (or failure) latency in seconds
    pub latency: f64,
    /// Normalized query domain
    pub qname: String,
    /// Numeric query type
    pub qtype: u16,
    /// Response digest, usually a csv of answer IPs
    pub rdata: String,
    /// Numeric response code
    pub rcode: u16,
    /// Response TTL, seconds
    pub rttl: u32,
    /// Server that answered
    pub server: String,
    /// Relay, for anonymized transports
    pub relay_server: String,
    /// Transaction status
    pub status: QueryStatus,
    /// csv of blocklist names that matched, if any
    pub blocklists: String,
}

impl DnsSummary {
    /// A summary in its initial state for a yet-unparsed query.
    #[must_use]
    pub fn start() -> Self {
        Self {
            qname: super::util::INVALID_QNAME.to_string(),
            status: QueryStatus::Start,
            ..Self::default()
        }
    }
}

/// A DNS query transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Uniquely identifies this transport.
    fn id(&self) -> &str;

    /// Transport flavor.
    fn kind(&self) -> TransportKind;

    /// Answer a DNS query (including ID) with a response carrying a
    /// matching ID. Implementations fill latency/server fields of
    /// `summary` as they go.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryError`] when no response was received; the error
    /// may carry a response for the ALG soft-error contract.
    async fn query(
        &self,
        network: NetProto,
        q: &[u8],
        summary: &mut DnsSummary,
    ) -> Result<Vec<u8>, QueryError>;

    /// Server address this transport was initialized with.
    fn addr(&self) -> &str;

    /// State of the transport after its previous query.
    fn status(&self) -> QueryStatus;
}

/// A transport that multiplexes other transports (the DNSCrypt proxy).
#[async_trait]
pub trait TransportMult: Transport {
    /// Register a transport.
    fn add(&self, t: std::sync::Arc<dyn Transport>) -> bool;

    /// Deregister a transport by id.
    fn remove(&self, id: &str) -> bool;

    /// Start the multi-transport; returns a csv of live servers.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryError`] when no server could be started.
    async fn start(&self) -> Result<String, QueryError>;

    /// Stop the multi-transport.
    async fn stop(&self);

    /// Re-register transports; returns a csv of active ones.
    async fn refresh(&self) -> Result<String, QueryError>;

    /// csv of active transports.
    fn live_transports(&self) -> String;
}

/// Receives per-query callbacks and transaction summaries.
pub trait DnsListener: Send + Sync {
    /// Called with the normalized qname and a suggested transport id;
    /// returns the id to use (empty string defers to the suggestion).
    fn on_query(&self, qname: &str, suggested: &str) -> String;

    /// Called once per completed (or failed) transaction.
    fn on_response(&self, summary: &DnsSummary);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert!(is_reserved(ids::ALG));
        assert!(is_reserved(ids::DC_PROXY));
        assert!(is_reserved(ids::BLOCK_ALL));
        assert!(!is_reserved(ids::PREFERRED));
        assert!(!is_reserved("my-doh"));
    }

    #[test]
    fn test_summary_start_state() {
        let s = DnsSummary::start();
        assert_eq!(s.qname, "invalid.query");
        assert_eq!(s.status, QueryStatus::Start);
        assert!(s.rdata.is_empty());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(TransportKind::Doh.to_string(), "DNS-over-HTTPS");
        assert_eq!(TransportKind::Dns53.to_string(), "DNS");
    }
}
