//! DNS64 synthesis and NAT64 translation
//!
//! Keeps a NAT64 prefix per transport id. When an AAAA query comes back
//! with no usable AAAA answer from a transport registered here, an A query
//! is made through the same transport and AAAA records are synthesized by
//! embedding the IPv4 answers in the prefix (RFC 6052 /96 embedding). The
//! flow engines use the reverse direction to un-map synthesized addresses
//! before dialing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use dashmap::DashMap;
use hickory_proto::op::Query;
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{RData, Record, RecordType};
use ipnet::Ipv6Net;
use tracing::{debug, warn};

use super::transport::{DnsSummary, Transport};
use super::util;
use crate::core::NetProto;

/// Matches any registered resolver.
pub const ANY_RESOLVER: &str = "__anyresolver";
/// The transport backing the `System` id.
pub const UNDERLAY_RESOLVER: &str = "__underlay";
/// The host's default resolver.
pub const OVERLAY_RESOLVER: &str = "__overlay";
/// Preset "forced" DNS64/NAT64.
pub const LOCAL464_RESOLVER: &str = "__local464";

/// RFC 6052 well-known prefix.
#[must_use]
pub fn well_known_prefix() -> Ipv6Net {
    "64:ff9b::/96".parse().expect("valid prefix")
}

/// Per-transport DNS64/NAT64 registry.
pub struct NatPt {
    prefixes: DashMap<String, Ipv6Net>,
}

impl NatPt {
    /// Create a registry with the forced local resolver preset to the
    /// well-known prefix.
    #[must_use]
    pub fn new() -> Self {
        let prefixes = DashMap::new();
        prefixes.insert(LOCAL464_RESOLVER.to_string(), well_known_prefix());
        Self { prefixes }
    }

    /// Register DNS64 for transport `id` with the well-known prefix.
    pub fn add64(&self, id: &str) -> bool {
        self.prefixes
            .insert(id.to_string(), well_known_prefix())
            .is_none()
    }

    /// Deregister DNS64 for transport `id`.
    pub fn remove64(&self, id: &str) -> bool {
        self.prefixes.remove(id).is_some()
    }

    /// Override the NAT64 prefix for transport `id`. Only /96 prefixes are
    /// accepted.
    pub fn reset_nat64_prefix(&self, id: &str, prefix: Ipv6Net) -> bool {
        if prefix.prefix_len() != 96 {
            warn!("dns64: rejecting non-/96 prefix {prefix}");
            return false;
        }
        self.prefixes.insert(id.to_string(), prefix);
        true
    }

    /// True when DNS64 is registered for `id`.
    #[must_use]
    pub fn registered(&self, id: &str) -> bool {
        self.prefixes.contains_key(id)
    }

    /// True when `ip` is a NAT64 address minted for transport `id`
    /// (or for any transport, with [`ANY_RESOLVER`]).
    #[must_use]
    pub fn is_nat64(&self, id: &str, ip: IpAddr) -> bool {
        let IpAddr::V6(ip6) = ip else {
            return false;
        };
        if id == ANY_RESOLVER {
            return self.prefixes.iter().any(|p| p.value().contains(&ip6));
        }
        self.prefixes
            .get(id)
            .is_some_and(|p| p.value().contains(&ip6))
    }

    /// Translate a NAT64 address back to IPv4 using `id`'s prefix.
    ///
    /// The unspecified address maps to the unspecified IPv4 address.
    #[must_use]
    pub fn x64(&self, id: &str, ip: IpAddr) -> Option<Ipv4Addr> {
        let IpAddr::V6(ip6) = ip else {
            return None;
        };
        if ip6.is_unspecified() {
            return Some(Ipv4Addr::UNSPECIFIED);
        }
        if !self.is_nat64(id, ip) {
            return None;
        }
        let octets = ip6.octets();
        Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ))
    }

    /// Synthesize an AAAA answer from `answer` if needed.
    ///
    /// Returns `None` when no synthesis applies: the query was not AAAA,
    /// the answer already carries usable AAAA records, or `id` has no
    /// registered prefix.
    pub async fn d64(
        &self,
        id: &str,
        answer: &[u8],
        transport: &Arc<dyn Transport>,
    ) -> Option<Vec<u8>> {
        let prefix = *self.prefixes.get(id)?.value();

        let msg = util::parse(answer).ok()?;
        if !util::has_aaaa_question(&msg) {
            return None;
        }
        let have6 = util::aaaa_answers(&msg);
        if have6.iter().any(|ip| !ip.is_unspecified()) {
            return None;
        }

        // Re-ask the same name for A through the same transport.
        let name = msg.queries().first()?.name().clone();
        let mut q4 = hickory_proto::op::Message::new();
        q4.set_id(msg.id());
        q4.set_message_type(hickory_proto::op::MessageType::Query);
        q4.set_op_code(hickory_proto::op::OpCode::Query);
        q4.set_recursion_desired(true);
        q4.add_query(Query::query(name.clone(), RecordType::A));
        let q4_wire = q4.to_vec().ok()?;

        let mut summary = DnsSummary::start();
        let ans4 = transport
            .query(NetProto::Udp, &q4_wire, &mut summary)
            .await
            .ok()?;
        let msg4 = util::parse(&ans4).ok()?;
        let a = util::a_answers(&msg4);
        if a.is_empty() {
            return None;
        }

        let ttl = util::min_ttl(&msg4).unwrap_or(0);
        let mut synth = msg.clone();
        synth.take_answers();
        for ip4 in &a {
            let ip6 = embed(prefix, *ip4);
            synth.add_answer(Record::from_rdata(
                name.clone(),
                ttl,
                RData::AAAA(AAAA(ip6)),
            ));
        }
        debug!(
            "dns64: synthesized {} AAAA for {} via {}",
            a.len(),
            util::qname(&msg),
            id
        );
        synth.to_vec().ok()
    }
}

impl Default for NatPt {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NatPt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatPt")
            .field("registered", &self.prefixes.len())
            .finish()
    }
}

/// RFC 6052 /96 embedding.
fn embed(prefix: Ipv6Net, ip4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.network().octets();
    octets[12..16].copy_from_slice(&ip4.octets());
    Ipv6Addr::from(octets)
}
