//! Flow policy gate
//!
//! Every new flow passes through here before anything is dialed: the
//! synthetic destination is undone against the ALG, the block mode (and,
//! for `FilterProc`, a /proc/net scan for the owning uid) decides whether
//! the embedder's `flow` callback is consulted, and the verdict comes back
//! with dial candidates resolved from the real answer set. Repeated blocked
//! attempts from the same caller are stalled with a growing delay.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, warn};

use crate::bridge::{FlowDecision, SocketListener};
use crate::config::{BlockMode, TunMode};
use crate::core::ExpiringCounter;
use crate::dns::AlgGateway;
use crate::ipset::IpSetRegistry;
use crate::summary::L4Proto;

/// Uid attributed to the tunnel's own sockets; their DNS traffic is not
/// re-intercepted.
pub const UID_SELF: &str = "self";

/// What the ALG knew about a synthetic destination.
#[derive(Debug, Clone, Default)]
pub struct AlgContext {
    /// csv of original answer IPs, family-filtered for dialing
    pub real_ips: String,
    /// Domain from a conservative (fresh-window) reverse lookup
    pub domains: String,
    /// Domain from a forced reverse lookup; only set when `domains` is
    /// empty, and never used for firewall keying
    pub probable_domains: String,
    /// csv of blocklists recorded against the domain
    pub blocklists: String,
}

/// Undo a synthetic destination IP against the ALG.
#[must_use]
pub fn undo_alg(gateway: &AlgGateway, ip: IpAddr) -> AlgContext {
    if ip.is_unspecified() {
        debug!("flow: undo_alg: unspecified dst");
        return AlgContext::default();
    }

    let domains = gateway.ptr(ip, false);
    let probable_domains = if domains.is_empty() {
        gateway.ptr(ip, true)
    } else {
        String::new()
    };

    AlgContext {
        real_ips: gateway.x(ip),
        domains,
        probable_domains,
        blocklists: gateway.rdnsbl(ip),
    }
}

/// The gate's verdict for one flow.
#[derive(Debug)]
pub struct GateResult {
    /// The policy decision
    pub decision: FlowDecision,
    /// What the ALG knew about the destination
    pub ctx: AlgContext,
    /// Dial targets in preference order; empty only for blocked flows
    pub candidates: Vec<SocketAddr>,
}

/// Gate a new flow.
///
/// `Sink` blocks and `None` goes direct without consulting the embedder;
/// the filter modes ask the embedder's `flow` callback. An empty proxy id
/// from the embedder falls back to `Base`.
#[must_use]
pub fn gate(
    proto: L4Proto,
    mode: &TunMode,
    gateway: &AlgGateway,
    listener: &Arc<dyn SocketListener>,
    src: SocketAddr,
    dst: SocketAddr,
) -> GateResult {
    let ctx = undo_alg(gateway, dst.ip());

    let decision = match mode.block_mode() {
        BlockMode::Sink => FlowDecision::block(),
        BlockMode::None => FlowDecision::base(),
        filter_mode @ (BlockMode::Filter | BlockMode::FilterProc) => {
            let uid = if filter_mode == BlockMode::FilterProc {
                lookup_uid(proto, src, dst).unwrap_or(-1)
            } else {
                -1
            };

            if ctx.real_ips.is_empty() || ctx.domains.is_empty() {
                debug!(
                    "flow: no realips({}) or domains({} + {}) for {src} -> {dst}",
                    ctx.real_ips, ctx.domains, ctx.probable_domains
                );
            }

            let mut decision = listener.flow(
                proto.number(),
                uid,
                &src.to_string(),
                &dst.to_string(),
                &ctx.real_ips,
                &ctx.domains,
                &ctx.probable_domains,
                &ctx.blocklists,
            );
            if decision.pid.is_empty() {
                warn!("flow: empty pid from listener; using Base");
                decision.pid = crate::proxy::ids::BASE.to_string();
            }
            decision
        }
    };

    let candidates = if decision.is_block() {
        Vec::new()
    } else {
        dial_candidates(&ctx.real_ips, dst, mode)
    };

    GateResult {
        decision,
        ctx,
        candidates,
    }
}

/// Key for the firewall stall tracker: uid + domain, or uid + target when
/// no domain is known. Probable domains are not reliable for firewalling.
#[must_use]
pub fn stall_key(uid: &str, ctx: &AlgContext, dst: SocketAddr) -> String {
    if ctx.domains.is_empty() {
        format!("{uid}{dst}")
    } else {
        format!("{uid}{}", ctx.domains)
    }
}

/// Compute how long a blocked caller should wait, and remember the block.
///
/// The first blocked attempt passes straight through; the next few jitter
/// between one and five seconds; from the sixth consecutive attempt on the
/// stall equals the attempt ordinal, capped at thirty seconds.
#[must_use]
pub fn stall(tracker: &ExpiringCounter, key: &str) -> u32 {
    let n = tracker.get(key);
    let secs = if n == 0 {
        0
    } else if n < 5 {
        rand::thread_rng().gen_range(1..=5)
    } else {
        (n + 1).min(30)
    };

    // Remember the block for secs, or 30s when not stalling yet.
    let life = u64::from(((29 + secs) % 30) + 1);
    tracker.set(key, Duration::from_secs(life));
    secs
}

/// Resolve the dial candidates for a flow: parse the real-IP csv, drop
/// unusable entries, unmap mapped addresses, keep the active families,
/// shuffle. Falls back to the original (synthetic) destination when the
/// list comes up empty.
#[must_use]
pub fn dial_candidates(real_ips: &str, orig: SocketAddr, mode: &TunMode) -> Vec<SocketAddr> {
    let use4 = mode.use4();
    let use6 = mode.use6();

    let mut ips: Vec<IpAddr> = real_ips
        .split(',')
        .filter_map(|s| {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            let ip = unmap(s.parse().ok()?);
            if ip.is_unspecified() {
                return None;
            }
            match ip {
                IpAddr::V4(_) if use4 => Some(ip),
                IpAddr::V6(_) if use6 => Some(ip),
                _ => None,
            }
        })
        .collect();

    if ips.is_empty() {
        return vec![orig];
    }

    ips.shuffle(&mut rand::thread_rng());
    ips.into_iter()
        .map(|ip| SocketAddr::new(ip, orig.port()))
        .collect()
}

/// Seed the IP-set registry with a flow's dial candidates, so later flows
/// to the same domain benefit from confirm/disconfirm ordering. Existing
/// sets are left alone.
pub fn track_candidates(registry: &IpSetRegistry, domain: &str, candidates: &[SocketAddr]) {
    if domain.is_empty() || candidates.is_empty() || registry.contains(domain) {
        return;
    }
    let addrs: Vec<String> = candidates.iter().map(|a| a.ip().to_string()).collect();
    let refs: Vec<&str> = addrs.iter().map(String::as_str).collect();
    registry.renew(domain, &refs);
}

/// Reorder `candidates` so the registry's confirmed address for `domain`
/// dials first.
#[must_use]
pub fn prefer_confirmed(
    registry: &IpSetRegistry,
    domain: &str,
    mut candidates: Vec<SocketAddr>,
) -> Vec<SocketAddr> {
    if domain.is_empty() {
        return candidates;
    }
    let Some(head) = registry.addrs_for(domain).first().copied() else {
        return candidates;
    };
    if let Some(pos) = candidates.iter().position(|a| a.ip() == head) {
        candidates.swap(0, pos);
    }
    candidates
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// Resolve the uid owning a socket pair from /proc/net.
///
/// Returns `None` off Linux or when no matching socket row is found.
#[must_use]
pub fn lookup_uid(proto: L4Proto, src: SocketAddr, dst: SocketAddr) -> Option<i32> {
    let tables: &[&str] = match (proto, src.is_ipv4()) {
        (L4Proto::Tcp, true) => &["/proc/net/tcp"],
        (L4Proto::Tcp, false) => &["/proc/net/tcp6"],
        (L4Proto::Udp, true) => &["/proc/net/udp"],
        (L4Proto::Udp, false) => &["/proc/net/udp6"],
    };

    for table in tables {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        if let Some(uid) = scan_proc_net(&content, src, dst) {
            return Some(uid);
        }
    }
    None
}

/// Scan one /proc/net table for `src` (and, when it matches, prefer an
/// exact remote match on `dst`).
fn scan_proc_net(content: &str, src: SocketAddr, dst: SocketAddr) -> Option<i32> {
    let mut local_match = None;

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let Some(local) = parse_proc_addr(fields[1]) else {
            continue;
        };
        if local != src {
            continue;
        }
        let uid: i32 = fields[7].parse().ok()?;

        match parse_proc_addr(fields[2]) {
            Some(remote) if remote == dst => return Some(uid),
            _ => local_match = Some(uid),
        }
    }
    local_match
}

/// Parse a `hexaddr:hexport` column. Addresses are little-endian per
/// 32-bit group.
fn parse_proc_addr(field: &str) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match addr_hex.len() {
        8 => {
            let raw = u32::from_str_radix(addr_hex, 16).ok()?;
            IpAddr::V4(raw.swap_bytes().into())
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in addr_hex.as_bytes().chunks(8).enumerate() {
                let group = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
                octets[i * 4..(i + 1) * 4].copy_from_slice(&group.to_le_bytes());
            }
            IpAddr::V6(octets.into())
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_ramp() {
        let tracker = ExpiringCounter::new();
        let key = "u0ads.example";

        assert_eq!(stall(&tracker, key), 0);
        for _ in 0..4 {
            let secs = stall(&tracker, key);
            assert!((1..=5).contains(&secs), "expected jitter, got {secs}");
        }
        assert_eq!(stall(&tracker, key), 6);
        assert_eq!(stall(&tracker, key), 7);
    }

    #[test]
    fn test_stall_caps_at_thirty() {
        let tracker = ExpiringCounter::new();
        let key = "u0bad.example";
        let mut last = 0;
        for _ in 0..40 {
            last = stall(&tracker, key);
        }
        assert_eq!(last, 30);
    }

    #[test]
    fn test_stall_key_prefers_domain() {
        let dst: SocketAddr = "198.18.0.1:443".parse().unwrap();
        let ctx = AlgContext {
            domains: "ads.example".into(),
            ..AlgContext::default()
        };
        assert_eq!(stall_key("u0", &ctx, dst), "u0ads.example");

        let no_domain = AlgContext::default();
        assert_eq!(stall_key("u0", &no_domain, dst), "u0198.18.0.1:443");
    }

    #[test]
    fn test_dial_candidates_filters_and_falls_back() {
        let mode = TunMode::default();
        let orig: SocketAddr = "198.18.0.1:443".parse().unwrap();

        let out = dial_candidates("93.184.216.34,2606:2800:220:1::1", orig, &mode);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|a| a.port() == 443));

        // v4-only egress drops the v6 candidate.
        mode.set_families(true, false);
        let out = dial_candidates("93.184.216.34,2606:2800:220:1::1", orig, &mode);
        assert_eq!(out, vec!["93.184.216.34:443".parse().unwrap()]);

        // Nothing usable: keep the original destination.
        let out = dial_candidates(",,0.0.0.0,", orig, &mode);
        assert_eq!(out, vec![orig]);

        let out = dial_candidates("", orig, &mode);
        assert_eq!(out, vec![orig]);
    }

    #[test]
    fn test_dial_candidates_unmaps() {
        let mode = TunMode::default();
        mode.set_families(true, false);
        let orig: SocketAddr = "198.18.0.9:80".parse().unwrap();
        let out = dial_candidates("::ffff:203.0.113.9", orig, &mode);
        assert_eq!(out, vec!["203.0.113.9:80".parse().unwrap()]);
    }

    #[test]
    fn test_candidate_tracking_and_preference() {
        let registry = IpSetRegistry::new();
        let candidates: Vec<SocketAddr> = vec![
            "203.0.113.1:443".parse().unwrap(),
            "203.0.113.2:443".parse().unwrap(),
            "203.0.113.3:443".parse().unwrap(),
        ];

        track_candidates(&registry, "multi.example", &candidates);
        assert!(registry.contains("multi.example"));

        // A later flow seeds nothing over the existing set.
        track_candidates(&registry, "multi.example", &candidates[..1]);
        assert_eq!(registry.addrs_for("multi.example").len(), 3);

        // Confirm the third; it dials first from now on.
        registry.confirm("multi.example", "203.0.113.3".parse().unwrap());
        let ordered = prefer_confirmed(&registry, "multi.example", candidates.clone());
        assert_eq!(ordered[0], "203.0.113.3:443".parse().unwrap());

        // Unknown domains pass through untouched.
        let same = prefer_confirmed(&registry, "", candidates.clone());
        assert_eq!(same, candidates);
    }

    #[test]
    fn test_parse_proc_addr_v4() {
        // 0100007F:1F90 = 127.0.0.1:8080
        let addr = parse_proc_addr("0100007F:1F90").unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_parse_proc_addr_v6_loopback() {
        let addr = parse_proc_addr("00000000000000000000000001000000:0035").unwrap();
        assert_eq!(addr, "[::1]:53".parse().unwrap());
    }

    #[test]
    fn test_scan_proc_net() {
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1
   1: 0100007F:0050 0200007F:01BB 01 00000000:00000000 00:00000000 00000000  1001        0 12346 1
";
        let src: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let dst: SocketAddr = "127.0.0.2:443".parse().unwrap();
        assert_eq!(scan_proc_net(table, src, dst), Some(1001));

        // Local-only match still yields the row's uid.
        let other_dst: SocketAddr = "127.0.0.9:1".parse().unwrap();
        assert_eq!(scan_proc_net(table, src, other_dst), Some(1001));

        let miss: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(scan_proc_net(table, miss, dst), None);
    }
}
