//! TCP flow engine
//!
//! Accepts TCP flows from the userspace stack, gates them through policy,
//! dials upstream through the chosen proxy, and splices bytes both ways
//! with independent upload and download pumps. Flows to an intercepted DNS
//! address are served by the resolver over the stream instead of being
//! dialed anywhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::split::UpstreamWriter;
use crate::bridge::SocketListener;
use crate::config::TunMode;
use crate::core::{ExpiringCounter, NetProto};
use crate::dns::Resolver;
use crate::error::FlowError;
use crate::flow;
use crate::ipset::IpSetRegistry;
use crate::netstack::TcpFlow;
use crate::proxy::{ids, ProxyRegistry};
use crate::summary::{queue_summary, L4Proto, SocketSummary};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Outcome of one splice direction.
struct PumpResult {
    bytes: u64,
    err: Option<String>,
}

/// TCP flow engine.
pub struct TcpHandler {
    resolver: Arc<Resolver>,
    proxies: Arc<ProxyRegistry>,
    mode: Arc<TunMode>,
    listener: Arc<dyn SocketListener>,
    fwtracker: Arc<ExpiringCounter>,
    ipset: Arc<IpSetRegistry>,
    end: Arc<AtomicBool>,
}

impl TcpHandler {
    /// Create a handler. `end` is the tunnel's global end flag.
    #[must_use]
    pub fn new(
        resolver: Arc<Resolver>,
        proxies: Arc<ProxyRegistry>,
        mode: Arc<TunMode>,
        listener: Arc<dyn SocketListener>,
        ipset: Arc<IpSetRegistry>,
        end: Arc<AtomicBool>,
    ) -> Arc<Self> {
        info!("tcp: new handler created");
        Arc::new(Self {
            resolver,
            proxies,
            mode,
            listener,
            fwtracker: Arc::new(ExpiringCounter::new()),
            ipset,
            end,
        })
    }

    /// Stack accept callback: hands the flow off to a task immediately.
    pub fn accept(self: &Arc<Self>, flow: Box<dyn TcpFlow>) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.proxy(flow).await;
        });
    }

    fn ended(&self) -> bool {
        self.end.load(Ordering::Relaxed)
    }

    /// Gate, handshake, dial, and splice one flow.
    pub async fn proxy(&self, mut flow: Box<dyn TcpFlow>) {
        if self.ended() {
            debug!("tcp: proxy: end");
            return;
        }

        let src = flow.src();
        let dst = flow.dst();
        let gateway = self.resolver.gateway();
        let verdict = flow::gate(L4Proto::Tcp, &self.mode, &gateway, &self.listener, src, dst);

        let mut summary = SocketSummary::new(
            L4Proto::Tcp,
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
                "tcp: firewalled {src} -> {dst} (dom: {}/ real: {}); stall? {secs}s",
                verdict.ctx.domains, verdict.ctx.real_ips
            );
            let _ = flow.establish(false).await;
            summary.done(&[Some(FlowError::tcp_firewalled().to_string())]);
            self.notify(summary);
            return;
        }

        if let Err(e) = flow.establish(true).await {
            warn!("tcp: handshake {src} -> {dst} failed: {e}");
            summary.done(&[Some(FlowError::HandshakeFailed.to_string())]);
            self.notify(summary);
            return;
        }

        let stream = flow.into_stream();

        // Intercepted DNS is answered in-place; the resolver owns the
        // stream until EOF.
        if self.resolver.is_dns_addr(dst) {
            self.resolver.serve(stream).await;
            return;
        }

        let proxy = match self.proxies.get_proxy(&verdict.decision.pid) {
            Ok(p) => p,
            Err(e) => {
                warn!("tcp: no proxy {} for {dst}: {e}", verdict.decision.pid);
                summary.done(&[Some(FlowError::SetupFailed { proto: "tcp" }.to_string())]);
                self.notify(summary);
                return;
            }
        };

        // Dialers connect to the un-ALG'd address; the confirmed address
        // for this domain, if any, goes first.
        let domain = verdict.ctx.domains.clone();
        flow::track_candidates(&self.ipset, &domain, &verdict.candidates);
        let candidates = flow::prefer_confirmed(&self.ipset, &domain, verdict.candidates);
        let target = candidates.first().copied().unwrap_or(dst);
        summary.target = target.to_string();

        let dial_start = Instant::now();
        let dialed = proxy.dial(NetProto::Tcp, target).await;
        let latency = dial_start.elapsed();
        #[allow(clippy::cast_possible_truncation)]
        {
            summary.rtt_ms = latency.as_millis().min(u128::from(u32::MAX)) as u32;
        }

        let remote = match dialed.and_then(crate::proxy::ProxyConn::into_tcp) {
            Ok(s) => {
                if !domain.is_empty() {
                    self.ipset.confirm(&domain, target.ip());
                }
                s
            }
            Err(e) => {
                warn!("tcp: dial {} via {} failed: {e}", target, proxy.id());
                if !domain.is_empty() {
                    self.ipset.disconfirm(&domain, target.ip());
                }
                summary.done(&[Some(FlowError::SetupFailed { proto: "tcp" }.to_string())]);
                self.notify(summary);
                return;
            }
        };

        info!(
            "tcp: new conn via proxy({}) {src} -> {target}",
            proxy.id()
        );

        let (remote_read, remote_write) = remote.into_split();
        let hello_split = proxy.id() == ids::BASE && target.port() == 443;
        let up_writer = if hello_split {
            UpstreamWriter::split(remote_write, latency)
        } else {
            UpstreamWriter::plain(remote_write)
        };

        let (stack_read, stack_write) = tokio::io::split(stream);

        // Upload and download run as independent halves joined on a
        // rendezvous channel; each half-closes its own direction.
        let (done_tx, done_rx) = oneshot::channel();
        let end = Arc::clone(&self.end);
        tokio::spawn(async move {
            let result = upload_pump(stack_read, up_writer, &end).await;
            let _ = done_tx.send(result);
        });

        let download = download_pump(remote_read, stack_write, &self.end).await;
        let upload = done_rx.await.unwrap_or(PumpResult {
            bytes: 0,
            err: Some("tcp: upload pump lost".to_string()),
        });

        summary.rx = download.bytes;
        summary.tx = upload.bytes;
        summary.done(&[download.err, upload.err]);
        debug!(
            "tcp: {src} -> {target} done; rx: {}, tx: {}",
            summary.rx, summary.tx
        );
        self.notify(summary);
    }

    fn notify(&self, summary: SocketSummary) {
        queue_summary(
            Arc::clone(&self.listener),
            Arc::clone(&self.end),
            summary,
        );
    }
}

impl std::fmt::Debug for TcpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpHandler")
            .field("ended", &self.ended())
            .finish()
    }
}

/// stack → remote. Ends on EOF, error, or the global end flag; half-closes
/// the upstream write side when done.
async fn upload_pump<R, W>(
    mut reader: R,
    mut writer: UpstreamWriter<W>,
    end: &AtomicBool,
) -> PumpResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut bytes: u64 = 0;

    loop {
        if end.load(Ordering::Relaxed) {
            let _ = writer.shutdown().await;
            return PumpResult {
                bytes,
                err: Some(FlowError::Ended { proto: "tcp" }.to_string()),
            };
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return PumpResult { bytes, err: None };
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    let _ = writer.shutdown().await;
                    return PumpResult {
                        bytes,
                        err: Some(e.to_string()),
                    };
                }
                bytes += n as u64;
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                return PumpResult {
                    bytes,
                    err: Some(e.to_string()),
                };
            }
        }
    }
}

/// remote → stack. Mirror of the upload pump.
async fn download_pump<R, W>(mut reader: R, mut writer: W, end: &AtomicBool) -> PumpResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut bytes: u64 = 0;

    loop {
        if end.load(Ordering::Relaxed) {
            let _ = writer.shutdown().await;
            return PumpResult {
                bytes,
                err: Some(FlowError::Ended { proto: "tcp" }.to_string()),
            };
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return PumpResult { bytes, err: None };
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return PumpResult {
                        bytes,
                        err: Some(e.to_string()),
                    };
                }
                bytes += n as u64;
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                return PumpResult {
                    bytes,
                    err: Some(e.to_string()),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_pump_counts_and_half_closes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);

        let (sink, mut sink_read) = {
            let (a, b) = tokio::io::duplex(1024);
            (a, b)
        };
        let end = AtomicBool::new(false);

        client.write_all(b"hello upstream").await.unwrap();
        client.shutdown().await.unwrap();

        let result = upload_pump(server_read, UpstreamWriter::plain(sink), &end).await;
        assert_eq!(result.bytes, 14);
        assert!(result.err.is_none());

        let mut out = Vec::new();
        sink_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello upstream");
    }

    #[tokio::test]
    async fn test_pump_observes_end_flag() {
        let (_client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (sink, _sink_read) = tokio::io::duplex(1024);

        let end = AtomicBool::new(true);
        let result = upload_pump(server_read, UpstreamWriter::plain(sink), &end).await;
        assert_eq!(result.bytes, 0);
        assert_eq!(result.err.as_deref(), Some("tcp: end"));
    }

    #[tokio::test]
    async fn test_download_pump_roundtrip() {
        let (mut remote, remote_peer) = tokio::io::duplex(1024);
        let (remote_read, _rw) = tokio::io::split(remote_peer);
        let (stack, mut stack_peer) = tokio::io::duplex(1024);
        let (_sr, stack_write) = tokio::io::split(stack);

        remote.write_all(b"payload").await.unwrap();
        remote.shutdown().await.unwrap();

        let end = AtomicBool::new(false);
        let result = download_pump(remote_read, stack_write, &end).await;
        assert_eq!(result.bytes, 7);
        assert!(result.err.is_none());

        let mut out = Vec::new();
        stack_peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }
}
