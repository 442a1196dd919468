//! Multi-transport DNS resolver
//!
//! Holds named transports behind a shared-exclusive lock, picks one per
//! query (the embedder gets a veto through `on_query`), runs the block
//! filters and the DNS64 synthesizer around the transport, and reports a
//! summary for every transaction. Serves the same pipeline over datagrams
//! (`forward`) and 2-byte length-prefixed streams (`serve`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::alg::AlgGateway;
use super::blocklist::DomainFilter;
use super::dns64::{self, NatPt};
use super::transport::{ids, is_reserved, DnsListener, DnsSummary, Transport, TransportKind};
use super::util;
use crate::config::{AlgConfig, TunMode};
use crate::core::NetProto;
use crate::error::{QueryError, QueryStatus};

/// Domains the public DNS hierarchy does not delegate; queries for them are
/// steered to the system resolver.
const UNDELEGATED: &[&str] = &[
    "localhost",
    "local",
    "lan",
    "home",
    "home.arpa",
    "internal",
    "intranet",
    "test",
    "invalid",
    "in-addr.arpa",
    "ip6.arpa",
];

/// Multi-transport resolver with an ALG in front of the preferred
/// transport.
pub struct Resolver {
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    system: RwLock<Vec<Arc<dyn Transport>>>,
    gateway: Arc<AlgGateway>,
    natpt: Arc<NatPt>,
    filter: RwLock<Option<Arc<dyn DomainFilter>>>,
    listener: Arc<dyn DnsListener>,
    dns_addrs: RwLock<Vec<SocketAddr>>,
    answer_ttl: u32,
}

impl Resolver {
    /// Create a resolver.
    ///
    /// `fake_dns` is a csv of `ip:port` addresses the tunnel intercepts as
    /// DNS. `default_dns` is registered as-is; the ALG is created and
    /// registered under [`ids::ALG`].
    #[must_use]
    pub fn new(
        fake_dns: &str,
        alg_cfg: AlgConfig,
        mode: Arc<TunMode>,
        default_dns: Arc<dyn Transport>,
        listener: Arc<dyn DnsListener>,
        natpt: Arc<NatPt>,
    ) -> Arc<Self> {
        let answer_ttl = alg_cfg.answer_ttl_secs;
        let gateway = Arc::new(AlgGateway::new(alg_cfg, mode));

        let resolver = Arc::new(Self {
            transports: RwLock::new(HashMap::new()),
            system: RwLock::new(Vec::new()),
            gateway: Arc::clone(&gateway),
            natpt,
            filter: RwLock::new(None),
            listener,
            dns_addrs: RwLock::new(parse_addrs(fake_dns)),
            answer_ttl,
        });

        resolver.add(default_dns);
        resolver.add(gateway as Arc<dyn Transport>);
        resolver
    }

    /// Register a transport; replacing [`ids::PREFERRED`] rewires the ALG.
    pub fn add(&self, t: Arc<dyn Transport>) -> bool {
        let id = t.id().to_string();
        if is_reserved(&id) {
            info!("dns: updating reserved transport {id}");
        }

        if id == ids::PREFERRED {
            self.gateway.with_transport(&t);
        }
        self.transports.write().insert(id, t);
        true
    }

    /// Deregister a transport by id, detaching the ALG when it fronted it.
    pub fn remove(&self, id: &str) -> bool {
        if is_reserved(id) {
            info!("dns: removing reserved transport {id}");
        }
        let removed = self.transports.write().remove(id);
        if let Some(t) = &removed {
            self.gateway.without_transport(t);
        }
        removed.is_some()
    }

    /// Append a network-provided transport and register it for DNS64.
    pub fn add_system_dns(&self, t: Arc<dyn Transport>) -> bool {
        self.system.write().push(Arc::clone(&t));
        self.natpt.add64(dns64::UNDERLAY_RESOLVER);
        self.add(t)
    }

    /// Drop all network-provided transports.
    pub fn remove_system_dns(&self) -> usize {
        let drained = std::mem::take(&mut *self.system.write());
        self.natpt.remove64(dns64::UNDERLAY_RESOLVER);
        self.remove(ids::SYSTEM);
        drained.len()
    }

    /// The ALG this resolver fronts `Preferred` with.
    #[must_use]
    pub fn gateway(&self) -> Arc<AlgGateway> {
        Arc::clone(&self.gateway)
    }

    /// The DNS64/NAT64 registry.
    #[must_use]
    pub fn natpt(&self) -> Arc<NatPt> {
        Arc::clone(&self.natpt)
    }

    /// The DNSCrypt multi-transport, when registered.
    #[must_use]
    pub fn dc_proxy(&self) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(ids::DC_PROXY).cloned()
    }

    /// Install (or clear) the blocklist filter.
    pub fn set_domain_filter(&self, filter: Option<Arc<dyn DomainFilter>>) {
        *self.filter.write() = filter;
    }

    /// True when `addr` is one of the tunnel's DNS intercept addresses.
    #[must_use]
    pub fn is_dns_addr(&self, addr: SocketAddr) -> bool {
        self.dns_addrs.read().contains(&addr)
    }

    /// csv of registered transport ids.
    #[must_use]
    pub fn live_transports(&self) -> String {
        let ids: Vec<String> = self.transports.read().keys().cloned().collect();
        ids.join(",")
    }

    /// Start serving; returns the live transports.
    ///
    /// # Errors
    ///
    /// Returns a transport [`QueryError`] when nothing is registered.
    pub fn start(&self) -> Result<String, QueryError> {
        let live = self.live_transports();
        if live.is_empty() {
            return Err(QueryError::transport("no transports"));
        }
        Ok(live)
    }

    /// Stop the resolver: drops ALG bindings.
    pub fn stop(&self) {
        self.gateway.stop();
    }

    /// Re-register transports; returns a csv of the active ones.
    #[must_use]
    pub fn refresh(&self) -> String {
        self.live_transports()
    }

    /// Answer one datagram query.
    ///
    /// # Errors
    ///
    /// Returns the transaction's [`QueryError`]; callers that owe the
    /// client wire bytes should fall back to [`util::servfail`].
    pub async fn forward(&self, q: &[u8]) -> Result<Vec<u8>, QueryError> {
        let start = Instant::now();
        let mut summary = DnsSummary::start();
        let result = self.resolve(NetProto::Udp, q, &mut summary, start).await;
        if let Err(e) = &result {
            summary.status = e.status();
        }
        summary.latency = start.elapsed().as_secs_f64();
        self.emit(summary);
        result
    }

    /// Serve length-prefixed DNS over a stream until EOF or error.
    ///
    /// Each request runs the same pipeline as [`Resolver::forward`];
    /// oversize responses are fatal for the connection.
    pub async fn serve<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                debug!("dns: stream closed");
                break;
            }
            let qlen = usize::from(u16::from_be_bytes(len_buf));
            if !(util::MIN_DNS_PACKET_SIZE..=util::MAX_DNS_PACKET_SIZE).contains(&qlen) {
                warn!("dns: stream query length {qlen} out of bounds");
                break;
            }

            let mut q = vec![0u8; qlen];
            if let Err(e) = stream.read_exact(&mut q).await {
                warn!("dns: stream read failed: {e}");
                break;
            }

            let start = Instant::now();
            let mut summary = DnsSummary::start();
            let result = self.resolve(NetProto::Tcp, &q, &mut summary, start).await;
            if let Err(e) = &result {
                summary.status = e.status();
            }
            summary.latency = start.elapsed().as_secs_f64();

            let response = match result {
                Ok(b) if b.len() <= util::MAX_DNS_PACKET_SIZE => b,
                Ok(b) => {
                    summary.status = QueryStatus::BadResponse;
                    self.emit(summary);
                    warn!("dns: oversize stream response: {} bytes", b.len());
                    break;
                }
                Err(e) => {
                    self.emit(summary);
                    warn!("dns: stream query failed: {e}");
                    break;
                }
            };
            self.emit(summary);

            // One buffered write per response keeps frames atomic.
            #[allow(clippy::cast_possible_truncation)]
            let len = response.len() as u16; // bounded by MAX_DNS_PACKET_SIZE
            let mut framed = Vec::with_capacity(response.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(&response);
            if let Err(e) = stream.write_all(&framed).await {
                warn!("dns: stream write failed: {e}");
                break;
            }
        }
    }

    async fn resolve(
        &self,
        network: NetProto,
        q: &[u8],
        summary: &mut DnsSummary,
        start: Instant,
    ) -> Result<Vec<u8>, QueryError> {
        let msg = util::parse(q)?;
        let qname = util::qname(&msg);
        let qtype = util::qtype(&msg);
        summary.qname.clone_from(&qname);
        summary.qtype = qtype;

        // Pick a transport: embedder choice, then the suggestion, then the
        // ALG in front of Preferred.
        let suggested = self.requires_system(&qname).unwrap_or_default();
        let chosen = self.listener.on_query(&qname, &suggested);
        let id = if chosen.is_empty() {
            if suggested.is_empty() {
                ids::ALG.to_string()
            } else {
                suggested
            }
        } else {
            chosen
        };

        let Some((transport, wrapper)) = self.determine_transports(&id) else {
            return Err(QueryError::transport(format!("missing transport {id}")));
        };

        // Block by question before any transport is consulted.
        if id != ids::BLOCK_FREE {
            let filter = self.filter.read().clone();
            if let Some(lists) = filter.and_then(|f| f.block_question(&qname, qtype)) {
                debug!("dns: {qname} blocked by question ({lists})");
                let refusal = util::refused_response(&msg, self.answer_ttl);
                summary.status = QueryStatus::Complete;
                summary.blocklists = lists;
                summary.rdata = util::interesting_rdata(&refusal);
                summary.rcode = util::rcode(&refusal);
                summary.rttl = self.answer_ttl;
                summary.latency = start.elapsed().as_secs_f64();
                return util::pack(&refusal);
            }
        }

        summary.kind = transport.kind().to_string();
        summary.id = transport.id().to_string();
        summary.server = transport.addr().to_string();

        let answer = match self.exchange(&transport, network, q, summary).await {
            Ok(b) => b,
            Err(mut e) if e.is_alg_soft() => {
                // The ALG succeeded without rewriting; its answer stands.
                summary.status = QueryStatus::Complete;
                let response = e.take_response().unwrap_or_default();
                summary.rcode = util::parse(&response).map(|m| util::rcode(&m)).unwrap_or(0);
                return Ok(response);
            }
            Err(e) => return Err(e),
        };

        let mut ans = util::parse(&answer)
            .map_err(|e| QueryError::bad_response(format!("unpack answer: {e}")))?;

        // Block by answer: CNAME targets in the real answer.
        if id != ids::BLOCK_FREE {
            let filter = self.filter.read().clone();
            let targets = util::cname_targets(&ans);
            if let Some(lists) = filter.and_then(|f| f.block_answer(&targets)) {
                debug!("dns: {qname} blocked by answer ({lists})");
                summary.blocklists = lists;
                ans = util::refused_response(&msg, self.answer_ttl);
            }
        }

        let mut wire = util::pack(&ans)?;

        // DNS64, when a synthesizer is registered for this transport.
        if let Some(d64) = self.natpt.d64(transport.id(), &wire, &wrapper).await {
            if d64.len() >= util::MIN_DNS_PACKET_SIZE {
                wire = d64;
                ans = util::parse(&wire)?;
            }
        }

        summary.status = QueryStatus::Complete;
        summary.rcode = util::rcode(&ans);
        summary.rttl = util::rttl(&ans);
        if summary.rdata.is_empty() {
            summary.rdata = util::interesting_rdata(&ans);
        }
        Ok(wire)
    }

    /// Query the transport; truncated datagram answers from non-DoH
    /// transports are retried over the stream network. A soft ALG error
    /// wrapping a truncated answer retries the same way.
    async fn exchange(
        &self,
        transport: &Arc<dyn Transport>,
        network: NetProto,
        q: &[u8],
        summary: &mut DnsSummary,
    ) -> Result<Vec<u8>, QueryError> {
        let result = transport.query(network, q, summary).await;
        if network != NetProto::Udp || transport.kind() == TransportKind::Doh {
            return result;
        }

        match result {
            Ok(answer) if util::has_tc_flag(&answer) => {
                debug!("dns: {} truncated; retrying over tcp", summary.qname);
                transport.query(NetProto::Tcp, q, summary).await
            }
            Err(mut e) if e.is_alg_soft() => {
                let answer = e.take_response().unwrap_or_default();
                if util::has_tc_flag(&answer) {
                    debug!("dns: {} truncated (soft); retrying over tcp", summary.qname);
                    transport.query(NetProto::Tcp, q, summary).await
                } else {
                    Err(QueryError::alg_soft("no rewritable answers", answer))
                }
            }
            other => other,
        }
    }

    /// Resolve an id to `(transport, dns64-requery wrapper)`.
    ///
    /// [`ids::ALG`] maps to the gateway backed by `Preferred`'s wrapper.
    fn determine_transports(
        &self,
        id: &str,
    ) -> Option<(Arc<dyn Transport>, Arc<dyn Transport>)> {
        let transports = self.transports.read();
        if id == ids::ALG {
            let alg = transports.get(ids::ALG)?;
            let preferred = transports.get(ids::PREFERRED)?;
            return Some((Arc::clone(alg), Arc::clone(preferred)));
        }
        let t = transports.get(id)?;
        Some((Arc::clone(t), Arc::clone(t)))
    }

    /// Suggest the system transport for undelegated or local domains.
    fn requires_system(&self, qname: &str) -> Option<String> {
        let has_system = self.transports.read().contains_key(ids::SYSTEM);
        if !has_system {
            return None;
        }
        let matched = UNDELEGATED.iter().any(|suffix| {
            qname == *suffix
                || qname
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.ends_with('.'))
        });
        matched.then(|| ids::SYSTEM.to_string())
    }

    /// Report the transaction to the embedder off the query path.
    fn emit(&self, summary: DnsSummary) {
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            listener.on_response(&summary);
        });
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("transports", &self.live_transports())
            .field("dns_addrs", &*self.dns_addrs.read())
            .finish()
    }
}

fn parse_addrs(csv: &str) -> Vec<SocketAddr> {
    csv.split(',')
        .filter_map(|s| {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            match s.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("dns: skipping bad intercept addr {s}: {e}");
                    None
                }
            }
        })
        .collect()
}
