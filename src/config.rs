//! Configuration types
//!
//! Static configuration is plain serde structs with defaults; the pieces
//! that change at runtime (block mode, active dial families) live in
//! [`TunMode`] behind atomics so handlers never take a lock to read them.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// How flows are gated before dialing upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    /// Everything goes direct; the policy callback is not consulted
    None,
    /// Everything is refused
    Sink,
    /// The policy callback decides
    #[default]
    Filter,
    /// Like `Filter`, but the owning uid is resolved from /proc first
    FilterProc,
}

/// Runtime-mutable tunnel mode: block mode plus the address families the
/// dialing subsystem currently has routes for.
#[derive(Debug)]
pub struct TunMode {
    block: AtomicU8,
    use4: AtomicBool,
    use6: AtomicBool,
}

const BLOCK_NONE: u8 = 0;
const BLOCK_SINK: u8 = 1;
const BLOCK_FILTER: u8 = 2;
const BLOCK_FILTER_PROC: u8 = 3;

impl TunMode {
    /// Create a mode with the given block mode and both families active.
    #[must_use]
    pub fn new(block: BlockMode) -> Self {
        let mode = Self {
            block: AtomicU8::new(BLOCK_FILTER),
            use4: AtomicBool::new(true),
            use6: AtomicBool::new(true),
        };
        mode.set_block_mode(block);
        mode
    }

    /// Current block mode.
    #[must_use]
    pub fn block_mode(&self) -> BlockMode {
        match self.block.load(Ordering::Relaxed) {
            BLOCK_NONE => BlockMode::None,
            BLOCK_SINK => BlockMode::Sink,
            BLOCK_FILTER_PROC => BlockMode::FilterProc,
            _ => BlockMode::Filter,
        }
    }

    /// Switch the block mode.
    pub fn set_block_mode(&self, block: BlockMode) {
        let v = match block {
            BlockMode::None => BLOCK_NONE,
            BlockMode::Sink => BLOCK_SINK,
            BlockMode::Filter => BLOCK_FILTER,
            BlockMode::FilterProc => BLOCK_FILTER_PROC,
        };
        self.block.store(v, Ordering::Relaxed);
    }

    /// Whether IPv4 egress is currently routable.
    #[must_use]
    pub fn use4(&self) -> bool {
        self.use4.load(Ordering::Relaxed)
    }

    /// Whether IPv6 egress is currently routable.
    #[must_use]
    pub fn use6(&self) -> bool {
        self.use6.load(Ordering::Relaxed)
    }

    /// Set the active dial families (typically on route changes).
    pub fn set_families(&self, use4: bool, use6: bool) {
        self.use4.store(use4, Ordering::Relaxed);
        self.use6.store(use6, Ordering::Relaxed);
    }
}

impl Default for TunMode {
    fn default() -> Self {
        Self::new(BlockMode::default())
    }
}

/// DNS ALG configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgConfig {
    /// IPv4 pool synthetic answers are drawn from
    #[serde(default = "default_pool4")]
    pub pool4: Ipv4Net,
    /// IPv6 pool synthetic answers are drawn from
    #[serde(default = "default_pool6")]
    pub pool6: Ipv6Net,
    /// TTL stamped on rewritten answers, seconds
    #[serde(default = "default_answer_ttl")]
    pub answer_ttl_secs: u32,
    /// Minimum binding lifetime, seconds; bindings live for
    /// max(answer min-TTL, this floor) so in-flight flows can resolve them
    #[serde(default = "default_binding_floor")]
    pub binding_ttl_floor_secs: u64,
    /// Window after allocation in which a conservative PTR still answers
    #[serde(default = "default_fresh_window")]
    pub fresh_window_secs: u64,
}

fn default_pool4() -> Ipv4Net {
    "198.18.0.0/15".parse().expect("valid pool")
}

fn default_pool6() -> Ipv6Net {
    "64:ff9b:1:da7a::/96".parse().expect("valid pool")
}

const fn default_answer_ttl() -> u32 {
    10
}

const fn default_binding_floor() -> u64 {
    30 * 60
}

const fn default_fresh_window() -> u64 {
    2 * 60
}

impl AlgConfig {
    /// Binding lifetime floor as a [`Duration`].
    #[must_use]
    pub const fn binding_ttl_floor(&self) -> Duration {
        Duration::from_secs(self.binding_ttl_floor_secs)
    }

    /// Fresh window as a [`Duration`].
    #[must_use]
    pub const fn fresh_window(&self) -> Duration {
        Duration::from_secs(self.fresh_window_secs)
    }
}

impl Default for AlgConfig {
    fn default() -> Self {
        Self {
            pool4: default_pool4(),
            pool6: default_pool6(),
            answer_ttl_secs: default_answer_ttl(),
            binding_ttl_floor_secs: default_binding_floor(),
            fresh_window_secs: default_fresh_window(),
        }
    }
}

/// Top-level tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Comma-separated `ip:port` addresses the tunnel intercepts as DNS
    #[serde(default = "default_fake_dns")]
    pub fake_dns: String,
    /// Initial block mode
    #[serde(default)]
    pub block_mode: BlockMode,
    /// UDP NAT mapping lifetime, seconds
    #[serde(default = "default_nat_timeout")]
    pub nat_timeout_secs: u64,
    /// ALG settings
    #[serde(default)]
    pub alg: AlgConfig,
}

fn default_fake_dns() -> String {
    "10.111.222.3:53".to_string()
}

const fn default_nat_timeout() -> u64 {
    2 * 60
}

impl TunnelConfig {
    /// NAT mapping lifetime as a [`Duration`].
    #[must_use]
    pub const fn nat_timeout(&self) -> Duration {
        Duration::from_secs(self.nat_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            fake_dns: default_fake_dns(),
            block_mode: BlockMode::default(),
            nat_timeout_secs: default_nat_timeout(),
            alg: AlgConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tun_mode_roundtrip() {
        let mode = TunMode::new(BlockMode::Sink);
        assert_eq!(mode.block_mode(), BlockMode::Sink);

        mode.set_block_mode(BlockMode::FilterProc);
        assert_eq!(mode.block_mode(), BlockMode::FilterProc);

        assert!(mode.use4());
        assert!(mode.use6());
        mode.set_families(true, false);
        assert!(mode.use4());
        assert!(!mode.use6());
    }

    #[test]
    fn test_alg_defaults() {
        let alg = AlgConfig::default();
        assert!(alg.pool4.contains(&"198.18.0.1".parse::<std::net::Ipv4Addr>().unwrap()));
        assert!(alg.pool4.contains(&"198.19.255.254".parse::<std::net::Ipv4Addr>().unwrap()));
        assert!(!alg.pool4.contains(&"198.20.0.1".parse::<std::net::Ipv4Addr>().unwrap()));
        assert_eq!(alg.binding_ttl_floor(), Duration::from_secs(1800));
    }

    #[test]
    fn test_config_deserialize_partial() {
        let cfg: TunnelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.fake_dns, "10.111.222.3:53");
        assert_eq!(cfg.nat_timeout(), Duration::from_secs(120));
    }
}
