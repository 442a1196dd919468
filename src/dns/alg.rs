//! DNS application-level gateway
//!
//! The gateway fronts the `Preferred` transport. Answers passing through it
//! have their A/AAAA records and SVCB/HTTPS ip hints replaced with synthetic
//! addresses drawn from reserved pools; each synthetic address is bound to
//! the original answer set, the normalized qname, and any blocklist names,
//! so flow setup can later undo the rewrite (`x`), recover the domain
//! (`ptr`), and read the blocklist verdict (`rdnsbl`).
//!
//! Bindings outlive the answer's minimum TTL or a configured floor,
//! whichever is larger. Repeat queries for the same answer set reuse the
//! same synthetic address while the binding is alive.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use super::transport::{ids, DnsSummary, Transport, TransportKind};
use super::util;
use crate::config::{AlgConfig, TunMode};
use crate::error::{QueryError, QueryStatus};
use crate::core::NetProto;

/// One live synthetic-address binding.
#[derive(Debug, Clone)]
struct Binding {
    domain: String,
    real_ips: Vec<IpAddr>,
    blocklists: String,
    reverse_key: String,
    expiry: Instant,
    fresh_until: Instant,
}

impl Binding {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expiry
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now <= self.fresh_until
    }
}

/// Bounded number of expired bindings purged per transform.
const MAX_PURGE_PER_PASS: usize = 16;

#[derive(Default)]
struct Tables {
    by_synth: HashMap<IpAddr, Binding>,
    by_reals: HashMap<String, IpAddr>,
    cursor4: u64,
    cursor6: u64,
}

impl Tables {
    fn evict(&mut self, ip: IpAddr) {
        if let Some(b) = self.by_synth.remove(&ip) {
            self.by_reals.remove(&b.reverse_key);
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let doomed: Vec<IpAddr> = self
            .by_synth
            .iter()
            .filter(|(_, b)| b.is_expired(now))
            .take(MAX_PURGE_PER_PASS)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in doomed {
            self.evict(ip);
        }
    }
}

/// DNS ALG fronting the `Preferred` transport.
pub struct AlgGateway {
    cfg: AlgConfig,
    mode: Arc<TunMode>,
    upstream: RwLock<Weak<dyn Transport>>,
    tables: RwLock<Tables>,
    inflight: DashMap<(String, u16), Arc<AsyncMutex<()>>>,
    last_status: Mutex<QueryStatus>,
}

impl AlgGateway {
    /// Create a gateway over `cfg`'s pools; `mode` supplies the active
    /// dial families for [`AlgGateway::x`].
    #[must_use]
    pub fn new(cfg: AlgConfig, mode: Arc<TunMode>) -> Self {
        let detached: Weak<dyn Transport> = Weak::<NoTransport>::new();
        Self {
            cfg,
            mode,
            upstream: RwLock::new(detached),
            tables: RwLock::new(Tables::default()),
            inflight: DashMap::new(),
            last_status: Mutex::new(QueryStatus::Start),
        }
    }

    /// Point the gateway at a new underlying transport. The reference is
    /// weak: the resolver owns the transport, the gateway only borrows it.
    pub fn with_transport(&self, t: &Arc<dyn Transport>) {
        debug!("alg: now fronting transport {}", t.id());
        *self.upstream.write() = Arc::downgrade(t);
    }

    /// Detach the gateway from `t` if it is the current underlying
    /// transport.
    pub fn without_transport(&self, t: &Arc<dyn Transport>) -> bool {
        let mut up = self.upstream.write();
        if up.upgrade().is_some_and(|cur| Arc::ptr_eq(&cur, t)) {
            let detached: Weak<dyn Transport> = Weak::<NoTransport>::new();
            *up = detached;
            return true;
        }
        false
    }

    /// Drop all bindings.
    pub fn stop(&self) {
        let mut tables = self.tables.write();
        let n = tables.by_synth.len();
        *tables = Tables::default();
        debug!("alg: stopped; dropped {n} bindings");
    }

    /// True when `ip` falls in a synthetic pool.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.cfg.pool4.contains(&v4),
            IpAddr::V6(v6) => self.cfg.pool6.contains(&v6),
        }
    }

    /// Reverse-lookup the domain bound to a synthetic IP.
    ///
    /// Conservative mode (`force == false`) only answers within the
    /// binding's fresh window; forced mode accepts any binding that has
    /// not been evicted.
    #[must_use]
    pub fn ptr(&self, ip: IpAddr, force: bool) -> String {
        let now = Instant::now();
        let tables = self.tables.read();
        match tables.by_synth.get(&ip) {
            Some(b) if force || b.is_fresh(now) => b.domain.clone(),
            _ => String::new(),
        }
    }

    /// The original answer IPs bound to a synthetic IP, as a csv filtered
    /// to the address families the dialing subsystem has active.
    #[must_use]
    pub fn x(&self, ip: IpAddr) -> String {
        let use4 = self.mode.use4();
        let use6 = self.mode.use6();
        let tables = self.tables.read();
        match tables.by_synth.get(&ip) {
            Some(b) => b
                .real_ips
                .iter()
                .filter(|r| match r {
                    IpAddr::V4(_) => use4,
                    IpAddr::V6(_) => use6,
                })
                .map(IpAddr::to_string)
                .collect::<Vec<_>>()
                .join(","),
            None => String::new(),
        }
    }

    /// Blocklist names recorded against a synthetic IP's domain.
    #[must_use]
    pub fn rdnsbl(&self, ip: IpAddr) -> String {
        let tables = self.tables.read();
        tables
            .by_synth
            .get(&ip)
            .map(|b| b.blocklists.clone())
            .unwrap_or_default()
    }

    /// Number of live bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().by_synth.len()
    }

    /// True when no bindings are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().by_synth.is_empty()
    }

    /// Forward `q` to the underlying transport and rewrite the answer.
    ///
    /// # Errors
    ///
    /// Hard transport errors propagate. An answer with nothing to rewrite
    /// comes back as an ALG soft error with the untouched answer attached.
    pub async fn transform(
        &self,
        network: NetProto,
        q: &[u8],
        summary: &mut DnsSummary,
    ) -> Result<Vec<u8>, QueryError> {
        let Some(upstream) = self.upstream.read().upgrade() else {
            self.set_status(QueryStatus::TransportError);
            return Err(QueryError::transport("alg: no underlying transport"));
        };

        let msg = util::parse(q).map_err(|e| {
            self.set_status(QueryStatus::BadQuery);
            e
        })?;
        let qname = util::qname(&msg);
        if qname.is_empty() {
            self.set_status(QueryStatus::BadQuery);
            return Err(QueryError::bad_query("alg: empty qname"));
        }
        let qt = util::qtype(&msg);

        // One in-flight resolution per (qname, qtype); followers wait on
        // the first and then reuse its binding through the reverse map.
        let pair = (qname.clone(), qt);
        let gate = self
            .inflight
            .entry(pair.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let result = {
            let _guard = gate.lock().await;
            self.transform_locked(&upstream, network, q, &qname, summary)
                .await
        };
        self.inflight
            .remove_if(&pair, |_, v| Arc::strong_count(v) <= 2);
        result
    }

    async fn transform_locked(
        &self,
        upstream: &Arc<dyn Transport>,
        network: NetProto,
        q: &[u8],
        qname: &str,
        summary: &mut DnsSummary,
    ) -> Result<Vec<u8>, QueryError> {
        let ans = match upstream.query(network, q, summary).await {
            Ok(ans) => ans,
            Err(e) => {
                self.set_status(e.status());
                return Err(e);
            }
        };

        let mut ansmsg = util::parse(&ans).map_err(|e| {
            self.set_status(QueryStatus::BadResponse);
            QueryError::bad_response(format!("alg: unparseable answer: {e}"))
        })?;

        let reals4 = util::a_answers(&ansmsg);
        let reals6 = util::aaaa_answers(&ansmsg);
        let (hints4, hints6) = util::svcb_ip_hints(&ansmsg);

        let mut reals: Vec<IpAddr> = Vec::new();
        for ip in reals4.iter().chain(hints4.iter()) {
            if !ip.is_unspecified() && !reals.contains(&IpAddr::V4(*ip)) {
                reals.push(IpAddr::V4(*ip));
            }
        }
        for ip in reals6.iter().chain(hints6.iter()) {
            if !ip.is_unspecified() && !reals.contains(&IpAddr::V6(*ip)) {
                reals.push(IpAddr::V6(*ip));
            }
        }

        if reals.is_empty() {
            self.set_status(QueryStatus::Complete);
            trace!("alg: nothing to rewrite for {qname}/{}", summary.qtype);
            return Err(QueryError::alg_soft("alg: no rewritable answers", ans));
        }

        let need4 = !reals4.is_empty() || !hints4.is_empty();
        let need6 = !reals6.is_empty() || !hints6.is_empty();
        let ttl_secs = u64::from(util::min_ttl(&ansmsg).unwrap_or(0));
        let lifetime = std::cmp::max(
            self.cfg.binding_ttl_floor(),
            std::time::Duration::from_secs(ttl_secs),
        );

        let (synth4, synth6) =
            self.bind(qname, &reals, &summary.blocklists, lifetime, need4, need6);

        let ttl = self.cfg.answer_ttl_secs;
        if let Some(ip) = synth4 {
            util::subst_a_records(&mut ansmsg, ip, ttl);
        }
        if let Some(ip) = synth6 {
            util::subst_aaaa_records(&mut ansmsg, ip, ttl);
        }
        util::subst_svcb_hints(&mut ansmsg, synth4, synth6, ttl);

        let mut rdata: Vec<String> = Vec::new();
        rdata.extend(synth4.map(|ip| ip.to_string()));
        rdata.extend(synth6.map(|ip| ip.to_string()));
        summary.rdata = rdata.join(",");
        summary.rttl = ttl;
        summary.status = QueryStatus::Complete;
        self.set_status(QueryStatus::Complete);

        debug!(
            "alg: {qname} -> synth({}) for reals({})",
            summary.rdata,
            reals.len()
        );
        util::pack(&ansmsg)
    }

    /// Allocate (or reuse) synthetic addresses and record the binding.
    fn bind(
        &self,
        qname: &str,
        reals: &[IpAddr],
        blocklists: &str,
        lifetime: std::time::Duration,
        need4: bool,
        need6: bool,
    ) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
        let now = Instant::now();
        let mut csv: Vec<String> = reals.iter().map(IpAddr::to_string).collect();
        csv.sort_unstable();
        let base_key = csv.join(",");

        let mut tables = self.tables.write();
        tables.purge_expired(now);

        let synth4 = need4.then(|| {
            let key = format!("4|{base_key}");
            match Self::reuse(&tables, &key, now) {
                Some(IpAddr::V4(ip)) => ip,
                _ => self.alloc4(&mut tables),
            }
        });
        let synth6 = need6.then(|| {
            let key = format!("6|{base_key}");
            match Self::reuse(&tables, &key, now) {
                Some(IpAddr::V6(ip)) => ip,
                _ => self.alloc6(&mut tables),
            }
        });

        let expiry = now + lifetime;
        let fresh_until = now + self.cfg.fresh_window();
        let mut record = |ip: IpAddr, family: char| {
            let binding = Binding {
                domain: qname.to_string(),
                real_ips: reals.to_vec(),
                blocklists: blocklists.to_string(),
                reverse_key: format!("{family}|{base_key}"),
                expiry,
                fresh_until,
            };
            tables.by_reals.insert(binding.reverse_key.clone(), ip);
            tables.by_synth.insert(ip, binding);
        };
        if let Some(ip) = synth4 {
            record(IpAddr::V4(ip), '4');
        }
        if let Some(ip) = synth6 {
            record(IpAddr::V6(ip), '6');
        }

        (synth4, synth6)
    }

    fn reuse(tables: &Tables, key: &str, now: Instant) -> Option<IpAddr> {
        let ip = *tables.by_reals.get(key)?;
        let binding = tables.by_synth.get(&ip)?;
        (!binding.is_expired(now)).then_some(ip)
    }

    fn alloc4(&self, tables: &mut Tables) -> Ipv4Addr {
        let base = u32::from(self.cfg.pool4.network());
        let hosts = (1u64 << (32 - u32::from(self.cfg.pool4.prefix_len()))).saturating_sub(2);
        let offset = 1 + (tables.cursor4 % hosts.max(1));
        tables.cursor4 = tables.cursor4.wrapping_add(1);

        #[allow(clippy::cast_possible_truncation)]
        let ip = Ipv4Addr::from(base.wrapping_add(offset as u32));
        // A wrap-around collision lands on the pool's oldest allocation.
        if tables.by_synth.contains_key(&IpAddr::V4(ip)) {
            warn!("alg: pool4 wrapped; evicting binding at {ip}");
            tables.evict(IpAddr::V4(ip));
        }
        ip
    }

    fn alloc6(&self, tables: &mut Tables) -> Ipv6Addr {
        let base = u128::from(self.cfg.pool6.network());
        let hosts = if self.cfg.pool6.prefix_len() >= 64 {
            (1u128 << (128 - u32::from(self.cfg.pool6.prefix_len()))).saturating_sub(1)
        } else {
            u128::from(u64::MAX)
        };
        let offset = 1 + (u128::from(tables.cursor6) % hosts.max(1));
        tables.cursor6 = tables.cursor6.wrapping_add(1);

        let ip = Ipv6Addr::from(base.wrapping_add(offset));
        if tables.by_synth.contains_key(&IpAddr::V6(ip)) {
            warn!("alg: pool6 wrapped; evicting binding at {ip}");
            tables.evict(IpAddr::V6(ip));
        }
        ip
    }

    fn set_status(&self, s: QueryStatus) {
        *self.last_status.lock() = s;
    }
}

/// Placeholder target for an unset weak upstream.
struct NoTransport;

#[async_trait]
impl Transport for NoTransport {
    fn id(&self) -> &str {
        ""
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Dns53
    }

    async fn query(
        &self,
        _network: NetProto,
        _q: &[u8],
        _summary: &mut DnsSummary,
    ) -> Result<Vec<u8>, QueryError> {
        Err(QueryError::transport("no transport"))
    }

    fn addr(&self) -> &str {
        ""
    }

    fn status(&self) -> QueryStatus {
        QueryStatus::TransportError
    }
}

#[async_trait]
impl Transport for AlgGateway {
    fn id(&self) -> &str {
        ids::ALG
    }

    fn kind(&self) -> TransportKind {
        self.upstream
            .read()
            .upgrade()
            .map_or(TransportKind::Dns53, |t| t.kind())
    }

    async fn query(
        &self,
        network: NetProto,
        q: &[u8],
        summary: &mut DnsSummary,
    ) -> Result<Vec<u8>, QueryError> {
        self.transform(network, q, summary).await
    }

    fn addr(&self) -> &str {
        "alg"
    }

    fn status(&self) -> QueryStatus {
        *self.last_status.lock()
    }
}

impl std::fmt::Debug for AlgGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgGateway")
            .field("bindings", &self.len())
            .field("pool4", &self.cfg.pool4)
            .field("pool6", &self.cfg.pool6)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    struct FixedTransport {
        answer: Vec<u8>,
    }

    #[async_trait]
    impl Transport for FixedTransport {
        fn id(&self) -> &str {
            ids::PREFERRED
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Dns53
        }

        async fn query(
            &self,
            _network: NetProto,
            _q: &[u8],
            _summary: &mut DnsSummary,
        ) -> Result<Vec<u8>, QueryError> {
            Ok(self.answer.clone())
        }

        fn addr(&self) -> &str {
            "9.9.9.9:53"
        }

        fn status(&self) -> QueryStatus {
            QueryStatus::Complete
        }
    }

    fn query_wire(name: &str, rtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        msg.to_vec().unwrap()
    }

    fn answer_wire(name: &str, rtype: RecordType, data: RData, ttl: u32) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        msg.add_answer(Record::from_rdata(Name::from_str(name).unwrap(), ttl, data));
        msg.to_vec().unwrap()
    }

    fn gateway_with(answer: Vec<u8>) -> (AlgGateway, Arc<dyn Transport>) {
        let gw = AlgGateway::new(AlgConfig::default(), Arc::new(TunMode::default()));
        let upstream: Arc<dyn Transport> = Arc::new(FixedTransport { answer });
        gw.with_transport(&upstream);
        (gw, upstream)
    }

    #[tokio::test]
    async fn test_rewrite_and_ptr_roundtrip() {
        let real = Ipv4Addr::new(93, 184, 216, 34);
        let ans = answer_wire("good.example.", RecordType::A, RData::A(A(real)), 300);
        let (gw, _upstream) = gateway_with(ans);

        let q = query_wire("good.example.", RecordType::A);
        let mut summary = DnsSummary::start();
        let out = gw.transform(NetProto::Udp, &q, &mut summary).await.unwrap();

        let msg = Message::from_vec(&out).unwrap();
        let synth = util::a_answers(&msg)[0];
        assert!(gw.contains(IpAddr::V4(synth)));
        assert_eq!(msg.answers()[0].ttl(), 10);

        assert_eq!(gw.ptr(IpAddr::V4(synth), false), "good.example");
        assert_eq!(gw.x(IpAddr::V4(synth)), real.to_string());
    }

    #[tokio::test]
    async fn test_repeat_query_is_stable() {
        let real = Ipv4Addr::new(203, 0, 113, 9);
        let ans = answer_wire("stable.example.", RecordType::A, RData::A(A(real)), 60);
        let (gw, _upstream) = gateway_with(ans);

        let q = query_wire("stable.example.", RecordType::A);
        let mut s1 = DnsSummary::start();
        let mut s2 = DnsSummary::start();
        let out1 = gw.transform(NetProto::Udp, &q, &mut s1).await.unwrap();
        let out2 = gw.transform(NetProto::Udp, &q, &mut s2).await.unwrap();

        let ip1 = util::a_answers(&Message::from_vec(&out1).unwrap())[0];
        let ip2 = util::a_answers(&Message::from_vec(&out2).unwrap())[0];
        assert_eq!(ip1, ip2);
        assert_eq!(gw.len(), 1);
    }

    #[tokio::test]
    async fn test_aaaa_rewrite_uses_pool6() {
        let real: Ipv6Addr = "2606:2800:220:1::1".parse().unwrap();
        let ans = answer_wire("six.example.", RecordType::AAAA, RData::AAAA(AAAA(real)), 60);
        let (gw, _upstream) = gateway_with(ans);

        let q = query_wire("six.example.", RecordType::AAAA);
        let mut summary = DnsSummary::start();
        let out = gw.transform(NetProto::Udp, &q, &mut summary).await.unwrap();

        let synth = util::aaaa_answers(&Message::from_vec(&out).unwrap())[0];
        assert!(gw.contains(IpAddr::V6(synth)));
        assert_eq!(gw.x(IpAddr::V6(synth)), real.to_string());
    }

    #[tokio::test]
    async fn test_no_rewritable_answers_is_soft_error() {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(
            Name::from_str("empty.example.").unwrap(),
            RecordType::A,
        ));
        let ans = msg.to_vec().unwrap();
        let (gw, _upstream) = gateway_with(ans.clone());

        let q = query_wire("empty.example.", RecordType::A);
        let mut summary = DnsSummary::start();
        let mut err = gw
            .transform(NetProto::Udp, &q, &mut summary)
            .await
            .unwrap_err();
        assert!(err.is_alg_soft());
        assert_eq!(err.take_response(), Some(ans));
    }

    #[tokio::test]
    async fn test_detached_gateway_errors() {
        let gw = AlgGateway::new(AlgConfig::default(), Arc::new(TunMode::default()));
        let q = query_wire("any.example.", RecordType::A);
        let mut summary = DnsSummary::start();
        let err = gw
            .transform(NetProto::Udp, &q, &mut summary)
            .await
            .unwrap_err();
        assert!(!err.is_alg_soft());
        assert_eq!(err.status(), QueryStatus::TransportError);
    }

    #[tokio::test]
    async fn test_family_filter_on_x() {
        let real4 = Ipv4Addr::new(198, 51, 100, 4);
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(
            Name::from_str("dual.example.").unwrap(),
            RecordType::A,
        ));
        let name = Name::from_str("dual.example.").unwrap();
        msg.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A(real4))));
        msg.add_answer(Record::from_rdata(
            name,
            60,
            RData::AAAA(AAAA("2001:db8::4".parse().unwrap())),
        ));

        let mode = Arc::new(TunMode::default());
        let gw = AlgGateway::new(AlgConfig::default(), Arc::clone(&mode));
        let upstream: Arc<dyn Transport> = Arc::new(FixedTransport {
            answer: msg.to_vec().unwrap(),
        });
        gw.with_transport(&upstream);

        let q = query_wire("dual.example.", RecordType::A);
        let mut summary = DnsSummary::start();
        let out = gw.transform(NetProto::Udp, &q, &mut summary).await.unwrap();
        let synth = util::a_answers(&Message::from_vec(&out).unwrap())[0];

        // Both families active: both reals come back.
        let both = gw.x(IpAddr::V4(synth));
        assert!(both.contains("198.51.100.4") && both.contains("2001:db8::4"));

        // v4-only egress sees only v4 reals.
        mode.set_families(true, false);
        assert_eq!(gw.x(IpAddr::V4(synth)), "198.51.100.4");
    }

    #[tokio::test]
    async fn test_ptr_forced_vs_conservative() {
        let mut cfg = AlgConfig::default();
        cfg.fresh_window_secs = 0;
        let gw = AlgGateway::new(cfg, Arc::new(TunMode::default()));
        let upstream: Arc<dyn Transport> = Arc::new(FixedTransport {
            answer: answer_wire(
                "stale.example.",
                RecordType::A,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 10))),
                60,
            ),
        });
        gw.with_transport(&upstream);

        let q = query_wire("stale.example.", RecordType::A);
        let mut summary = DnsSummary::start();
        let out = gw.transform(NetProto::Udp, &q, &mut summary).await.unwrap();
        let synth = util::a_answers(&Message::from_vec(&out).unwrap())[0];

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(gw.ptr(IpAddr::V4(synth), false), "");
        assert_eq!(gw.ptr(IpAddr::V4(synth), true), "stale.example");
    }
}
