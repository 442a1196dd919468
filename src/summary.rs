//! Socket summaries
//!
//! Every flow emits exactly one [`SocketSummary`] when it ends. Emission is
//! delayed by a second so the control-plane consumer has had a chance to
//! observe the flow's creation before its obituary arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::bridge::SocketListener;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    /// TCP (protocol number 6)
    Tcp,
    /// UDP (protocol number 17)
    Udp,
}

impl L4Proto {
    /// IANA protocol number.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl std::fmt::Display for L4Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage summary for one flow, emitted once on close.
#[derive(Debug, Clone)]
pub struct SocketSummary {
    /// Connection id handed out by the policy gate
    pub id: String,
    /// Proxy id the flow was routed through
    pub pid: String,
    /// Uid that owned the flow
    pub uid: String,
    /// Flow protocol
    pub proto: L4Proto,
    /// Bytes written back into the stack (download)
    pub rx: u64,
    /// Bytes sent upstream (upload)
    pub tx: u64,
    /// Flow lifetime, seconds
    pub duration: u32,
    /// Upstream dial latency, milliseconds (TCP only)
    pub rtt_ms: u32,
    /// Dialed destination
    pub target: String,
    /// Terminal message; empty on clean close
    pub msg: String,
    start: Instant,
}

impl SocketSummary {
    /// A fresh summary for a flow starting now.
    #[must_use]
    pub fn new(proto: L4Proto, id: &str, pid: &str, uid: &str) -> Self {
        Self {
            id: id.to_string(),
            pid: pid.to_string(),
            uid: uid.to_string(),
            proto,
            rx: 0,
            tx: 0,
            duration: 0,
            rtt_ms: 0,
            target: String::new(),
            msg: String::new(),
            start: Instant::now(),
        }
    }

    /// Stamp the duration and record the first error, if any.
    pub fn done(&mut self, errs: &[Option<String>]) {
        self.duration = elapsed_secs(self.start);
        if self.msg.is_empty() {
            if let Some(msg) = errs.iter().flatten().next() {
                self.msg.clone_from(msg);
            }
        }
    }

    /// Elapsed time since the flow started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_secs(start: Instant) -> u32 {
    start.elapsed().as_secs().min(u64::from(u32::MAX)) as u32
}

/// Delay before a summary reaches the embedder.
pub const SUMMARY_DELAY: Duration = Duration::from_secs(1);

/// Queue `summary` for delivery to `listener` after [`SUMMARY_DELAY`].
///
/// Nothing is delivered once `end` is set or when the summary has no id.
pub fn queue_summary(
    listener: Arc<dyn SocketListener>,
    end: Arc<AtomicBool>,
    summary: SocketSummary,
) {
    tokio::spawn(async move {
        tokio::time::sleep(SUMMARY_DELAY).await;
        let ended = end.load(Ordering::Relaxed);
        if ended || summary.id.is_empty() {
            trace!(
                "summary: dropped (ended: {ended}, id: {:?})",
                summary.id
            );
            return;
        }
        listener.on_socket_closed(&summary);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_numbers() {
        assert_eq!(L4Proto::Tcp.number(), 6);
        assert_eq!(L4Proto::Udp.number(), 17);
    }

    #[test]
    fn test_done_records_first_error() {
        let mut s = SocketSummary::new(L4Proto::Tcp, "c1", "Base", "u0");
        s.done(&[None, Some("tcp: firewalled".to_string()), Some("other".to_string())]);
        assert_eq!(s.msg, "tcp: firewalled");

        // msg is sticky
        s.done(&[Some("later".to_string())]);
        assert_eq!(s.msg, "tcp: firewalled");
    }

    #[test]
    fn test_done_clean() {
        let mut s = SocketSummary::new(L4Proto::Udp, "c2", "Base", "u0");
        s.done(&[None, None]);
        assert!(s.msg.is_empty());
    }
}
