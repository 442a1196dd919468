//! UDP flow engine
//!
//! UDP mappings are timer-based: the first datagram of an unseen 5-tuple
//! gates the flow, dials upstream (trying each candidate real IP), and
//! parks a tracker in the NAT table. An ingress pump reads the upstream
//! socket under a rolling deadline and masquerade-writes into the stack;
//! egress datagrams are pushed by the stack and looked up in the NAT
//! table. DNS datagrams to an intercepted address are answered inline by
//! the resolver with no NAT entry at all.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bridge::SocketListener;
use crate::config::TunMode;
use crate::core::{ExpiringCounter, NetProto};
use crate::dns::{util, Resolver};
use crate::error::FlowError;
use crate::flow::{self, UID_SELF};
use crate::ipset::IpSetRegistry;
use crate::netstack::UdpFlow;
use crate::proxy::ProxyRegistry;
use crate::summary::{queue_summary, L4Proto, SocketSummary};

/// Temporary send/recv errors tolerated before a mapping is torn down.
pub const MAX_CONN_ERRORS: u32 = 3;

const DATAGRAM_BUF_SIZE: usize = 64 * 1024;

type FlowKey = (SocketAddr, SocketAddr);

/// One NAT mapping: the dialed upstream plus accounting.
struct Tracker {
    conn: UdpSocket,
    flow: Arc<dyn UdpFlow>,
    /// Source address used when writing responses back into the stack;
    /// the original (synthetic) destination.
    masq: SocketAddr,
    upload: AtomicU64,
    download: AtomicU64,
    errcount: AtomicU32,
    msg: Mutex<String>,
    summary: Mutex<SocketSummary>,
}

impl Tracker {
    fn record_err(&self, msg: String) {
        let mut slot = self.msg.lock();
        if slot.is_empty() {
            *slot = msg;
        }
    }
}

/// UDP flow engine.
pub struct UdpHandler {
    resolver: Arc<Resolver>,
    proxies: Arc<ProxyRegistry>,
    mode: Arc<TunMode>,
    listener: Arc<dyn SocketListener>,
    fwtracker: Arc<ExpiringCounter>,
    ipset: Arc<IpSetRegistry>,
    nat: DashMap<FlowKey, Arc<Tracker>>,
    timeout: Duration,
    end: Arc<AtomicBool>,
}

impl UdpHandler {
    /// Create a handler. `nat_timeout` is the mapping lifetime; RFC 4787
    /// asks for five minutes, most home routers give far less.
    #[must_use]
    pub fn new(
        resolver: Arc<Resolver>,
        proxies: Arc<ProxyRegistry>,
        mode: Arc<TunMode>,
        listener: Arc<dyn SocketListener>,
        ipset: Arc<IpSetRegistry>,
        nat_timeout: Duration,
        end: Arc<AtomicBool>,
    ) -> Arc<Self> {
        info!("udp: new handler created");
        Arc::new(Self {
            resolver,
            proxies,
            mode,
            listener,
            fwtracker: Arc::new(ExpiringCounter::new()),
            ipset,
            nat: DashMap::new(),
            timeout: nat_timeout,
            end,
        })
    }

    /// Stack new-mapping callback: hands off to a task immediately.
    pub fn accept(self: &Arc<Self>, flow: Arc<dyn UdpFlow>) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.connect(flow).await;
        });
    }

    fn ended(&self) -> bool {
        self.end.load(Ordering::Relaxed)
    }

    /// Number of live NAT mappings.
    #[must_use]
    pub fn mappings(&self) -> usize {
        self.nat.len()
    }

    /// Gate a new 5-tuple, dial upstream, and start its ingress pump.
    pub async fn connect(self: &Arc<Self>, flow: Arc<dyn UdpFlow>) {
        if self.ended() {
            debug!("udp: connect: end");
            let _ = flow.establish(false).await;
            return;
        }

        let src = flow.src();
        let dst = flow.dst();
        let gateway = self.resolver.gateway();
        let verdict = flow::gate(L4Proto::Udp, &self.mode, &gateway, &self.listener, src, dst);

        let mut summary = SocketSummary::new(
            L4Proto::Udp,
            &verdict.decision.cid,
            &verdict.decision.pid,
            &verdict.decision.uid,
        );
        summary.target = dst.to_string();

        if verdict.decision.is_block() {
            let key = flow::stall_key(&verdict.decision.uid, &verdict.ctx, dst);
            let secs = flow::stall(&self.fwtracker, &key);
            if secs > 0 {
                tokio::time::sleep(Duration::from_secs(u64::from(secs))).await;
            }
            info!(
                "udp: {} firewalled {src} -> {dst} (dom: {} + {}/ real: {}); stall? {secs}s",
                verdict.decision.cid,
                verdict.ctx.domains,
                verdict.ctx.probable_domains,
                verdict.ctx.real_ips
            );
            let _ = flow.establish(false).await;
            summary.done(&[Some(FlowError::udp_firewalled().to_string())]);
            self.notify(summary);
            return;
        }

        // DNS to an intercepted address is completed inline per-datagram;
        // no NAT mapping, no upstream dial.
        if verdict.decision.uid != UID_SELF && self.resolver.is_dns_addr(dst) {
            let _ = flow.establish(true).await;
            return;
        }

        let proxy = match self.proxies.get_proxy(&verdict.decision.pid) {
            Ok(p) => p,
            Err(e) => {
                warn!("udp: no proxy {} for {dst}: {e}", verdict.decision.pid);
                let _ = flow.establish(false).await;
                summary.done(&[Some(FlowError::SetupFailed { proto: "udp" }.to_string())]);
                self.notify(summary);
                return;
            }
        };

        // Try each candidate real IP until one dials; the confirmed
        // address for this domain goes first.
        let domain = verdict.ctx.domains.clone();
        flow::track_candidates(&self.ipset, &domain, &verdict.candidates);
        let candidates = flow::prefer_confirmed(&self.ipset, &domain, verdict.candidates);

        let mut dialed = None;
        for target in &candidates {
            match proxy.dial(NetProto::Udp, *target).await {
                Ok(conn) => match conn.into_udp() {
                    Ok(socket) => {
                        if !domain.is_empty() {
                            self.ipset.confirm(&domain, target.ip());
                        }
                        dialed = Some((socket, *target));
                        break;
                    }
                    Err(e) => {
                        warn!("udp: proxy {} returned non-udp conn: {e}", proxy.id());
                        break;
                    }
                },
                Err(e) => {
                    warn!(
                        "udp: {} dial {target} via {} failed: {e}",
                        verdict.decision.cid,
                        proxy.id()
                    );
                    if !domain.is_empty() {
                        self.ipset.disconfirm(&domain, target.ip());
                    }
                }
            }
        }
        let Some((socket, target)) = dialed else {
            let _ = flow.establish(false).await;
            summary.done(&[Some(FlowError::SetupFailed { proto: "udp" }.to_string())]);
            self.notify(summary);
            return;
        };
        summary.target = target.to_string();

        let tracker = Arc::new(Tracker {
            conn: socket,
            flow: Arc::clone(&flow),
            masq: dst,
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            errcount: AtomicU32::new(0),
            msg: Mutex::new(String::new()),
            summary: Mutex::new(summary),
        });

        let key = (src, dst);
        self.nat.insert(key, Arc::clone(&tracker));

        if let Err(e) = flow.establish(true).await {
            warn!("udp: establish {src} -> {dst} failed: {e}");
            tracker.record_err(e.to_string());
            self.teardown(key).await;
            return;
        }

        info!(
            "udp: connect: {} (proxy? {}) {src} -> {target}",
            tracker.summary.lock().id,
            proxy.id()
        );

        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.ingress(key, tracker).await;
        });
    }

    /// Read from upstream under a rolling deadline and masquerade-write
    /// into the stack. Any exit tears the mapping down.
    async fn ingress(self: Arc<Self>, key: FlowKey, tracker: Arc<Tracker>) {
        let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];

        loop {
            if self.ended() {
                tracker.record_err(FlowError::Ended { proto: "udp" }.to_string());
                break;
            }
            if tracker.errcount.load(Ordering::Relaxed) > MAX_CONN_ERRORS {
                debug!("udp: ingress: too many errors, closing");
                break;
            }

            // The deadline rolls: every arrival re-arms it.
            let n = match timeout(self.timeout, tracker.conn.recv(&mut buf)).await {
                Err(_) => {
                    debug!("udp: ingress: mapping expired");
                    tracker.record_err("udp: read timeout".to_string());
                    break;
                }
                Ok(Err(e)) if is_temporary(&e) => {
                    let errs = tracker.errcount.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("udp: ingress: temp err#{errs} ({e})");
                    continue;
                }
                Ok(Err(e)) => {
                    info!("udp: ingress: read failed ({e})");
                    tracker.record_err(FlowError::ReadFailed.to_string());
                    break;
                }
                Ok(Ok(n)) => n,
            };

            match tracker.flow.write_from(&buf[..n], tracker.masq).await {
                Ok(_) => {
                    tracker.download.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("udp: ingress: stack write failed ({e})");
                    tracker.record_err(e.to_string());
                    break;
                }
            }
        }

        self.teardown(key).await;
    }

    /// Stack egress callback: one datagram from the client toward `dst`.
    ///
    /// # Errors
    ///
    /// Returns a [`FlowError`] when the tunnel has ended, the datagram has
    /// no mapping and is not interceptable DNS, or the mapping died.
    pub async fn on_datagram(
        &self,
        flow: &Arc<dyn UdpFlow>,
        data: &[u8],
        dst: SocketAddr,
    ) -> Result<(), FlowError> {
        if self.ended() {
            return Err(FlowError::Ended { proto: "udp" });
        }

        let key = (flow.src(), dst);
        let Some(tracker) = self.nat.get(&key).map(|t| Arc::clone(&t)) else {
            if self.resolver.is_dns_addr(dst) {
                self.serve_dns_inline(flow, data, dst).await;
                return Ok(());
            }
            warn!("udp: egress: no nat for {:?}", key);
            return Err(FlowError::NoNatMapping);
        };

        tracker.upload.fetch_add(data.len() as u64, Ordering::Relaxed);

        match timeout(self.timeout, tracker.conn.send(data)).await {
            Ok(Ok(_)) => {
                tracker.errcount.store(0, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) if is_temporary(&e) => {
                let errs = tracker.errcount.fetch_add(1, Ordering::Relaxed) + 1;
                if errs > MAX_CONN_ERRORS {
                    warn!("udp: egress: too many errors({errs}) for {:?}", key);
                    tracker.record_err(e.to_string());
                    self.teardown(key).await;
                    Err(FlowError::Io(e))
                } else {
                    debug!("udp: egress: temporary error ({e}) for {:?}", key);
                    Ok(())
                }
            }
            Ok(Err(e)) => {
                info!("udp: egress: end splice for {:?} ({e})", key);
                tracker.record_err(e.to_string());
                self.teardown(key).await;
                Err(FlowError::Io(e))
            }
            Err(_) => {
                let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "udp send timed out");
                tracker.record_err(e.to_string());
                self.teardown(key).await;
                Err(FlowError::Io(e))
            }
        }
    }

    /// Complete a DNS request inline: the response is written back into
    /// the stack from the masqueraded source and the one-shot flow is torn
    /// down; no NAT entry, no traffic summary.
    async fn serve_dns_inline(&self, flow: &Arc<dyn UdpFlow>, query: &[u8], dst: SocketAddr) {
        debug!("udp: egress: dns-override for {dst}");
        let response = match self.resolver.forward(query).await {
            Ok(b) => Some(b),
            Err(e) => {
                warn!("udp: dns: query failed: {e}");
                util::servfail(query)
            }
        };
        if let Some(b) = response {
            if let Err(e) = flow.write_from(&b, dst).await {
                warn!("udp: dns: response write failed: {e}");
            }
        }
        flow.close().await;
    }

    /// Remove the mapping, close both sides, and queue the summary.
    async fn teardown(&self, key: FlowKey) {
        let Some((_, tracker)) = self.nat.remove(&key) else {
            return;
        };
        tracker.flow.close().await;

        let mut summary = tracker.summary.lock().clone();
        summary.rx = tracker.download.load(Ordering::Relaxed);
        summary.tx = tracker.upload.load(Ordering::Relaxed);
        let msg = tracker.msg.lock().clone();
        summary.done(&[(!msg.is_empty()).then_some(msg)]);
        debug!(
            "udp: closed {:?}; rx: {}, tx: {}",
            key, summary.rx, summary.tx
        );
        self.notify(summary);
    }

    /// Tear down every mapping (tunnel disconnect).
    pub async fn close_all(&self) {
        let keys: Vec<FlowKey> = self.nat.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.teardown(key).await;
        }
    }

    fn notify(&self, summary: SocketSummary) {
        queue_summary(
            Arc::clone(&self.listener),
            Arc::clone(&self.end),
            summary,
        );
    }
}

impl std::fmt::Debug for UdpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpHandler")
            .field("mappings", &self.mappings())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn is_temporary(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}
