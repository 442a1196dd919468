//! IP-set registry
//!
//! Tracks, per hostname, an ordered list of resolved IPs with the confirmed
//! (last known working) address at the head. Dialing walks the list in
//! order; callers promote an address that worked and demote one that did
//! not. An optional resolver hook fills the registry on a miss.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

/// Hostname → IP translation hook consulted when the registry has no entry.
pub trait NameResolver: Send + Sync {
    /// Resolve `hostname` to addresses, best-effort.
    fn lookup(&self, hostname: &str) -> Vec<IpAddr>;
}

/// Ordered IP list with the confirmed address at the head.
#[derive(Debug, Clone, Default)]
pub struct IpSet {
    addrs: Vec<IpAddr>,
}

impl IpSet {
    fn new(addrs: Vec<IpAddr>) -> Self {
        Self { addrs }
    }

    /// All addresses, confirmed first.
    #[must_use]
    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }

    /// True when the set holds no addresses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Promote `ip` to the head if present.
    fn confirm(&mut self, ip: IpAddr) -> bool {
        match self.addrs.iter().position(|a| *a == ip) {
            Some(0) => true,
            Some(pos) => {
                self.addrs.remove(pos);
                self.addrs.insert(0, ip);
                true
            }
            None => false,
        }
    }

    /// Demote `ip` to the tail if present.
    fn disconfirm(&mut self, ip: IpAddr) -> bool {
        match self.addrs.iter().position(|a| *a == ip) {
            Some(pos) if pos + 1 < self.addrs.len() => {
                self.addrs.remove(pos);
                self.addrs.push(ip);
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Process-wide registry from normalized hostname to [`IpSet`].
pub struct IpSetRegistry {
    sets: DashMap<String, IpSet>,
    resolver: RwLock<Option<Arc<dyn NameResolver>>>,
}

impl IpSetRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sets: DashMap::new(),
            resolver: RwLock::new(None),
        }
    }

    /// Attach the resolver hook; usually set just the once.
    pub fn with_resolver(&self, resolver: Arc<dyn NameResolver>) {
        debug!("ipset: resolver hook attached");
        *self.resolver.write() = Some(resolver);
    }

    /// Replace or initialize the set for `hostname`.
    ///
    /// Unparseable entries are dropped. Returns true when the resulting set
    /// is non-empty.
    pub fn renew(&self, hostname: &str, addrs: &[&str]) -> bool {
        let name = normalize(hostname);
        let ips: Vec<IpAddr> = addrs.iter().filter_map(|a| a.parse().ok()).collect();
        let ok = !ips.is_empty();
        self.sets.insert(name, IpSet::new(ips));
        ok
    }

    /// Addresses for `hostname`, confirmed first.
    ///
    /// On a miss the resolver hook, if any, is consulted and its answer
    /// cached.
    #[must_use]
    pub fn addrs_for(&self, hostname: &str) -> Vec<IpAddr> {
        let name = normalize(hostname);
        if let Some(set) = self.sets.get(&name) {
            if !set.is_empty() {
                return set.addrs().to_vec();
            }
        }

        let hook = self.resolver.read().clone();
        if let Some(r) = hook {
            let ips = r.lookup(&name);
            if !ips.is_empty() {
                self.sets.insert(name, IpSet::new(ips.clone()));
                return ips;
            }
        }
        Vec::new()
    }

    /// True when `hostname` has a non-empty set, without consulting the
    /// resolver hook.
    #[must_use]
    pub fn contains(&self, hostname: &str) -> bool {
        self.sets
            .get(&normalize(hostname))
            .is_some_and(|set| !set.is_empty())
    }

    /// Promote `ip` to the head of `hostname`'s set.
    pub fn confirm(&self, hostname: &str, ip: IpAddr) -> bool {
        self.sets
            .get_mut(&normalize(hostname))
            .is_some_and(|mut set| set.confirm(ip))
    }

    /// Demote `ip` to the tail of `hostname`'s set.
    pub fn disconfirm(&self, hostname: &str, ip: IpAddr) -> bool {
        self.sets
            .get_mut(&normalize(hostname))
            .is_some_and(|mut set| set.disconfirm(ip))
    }

    /// Number of tracked hostnames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// True when no hostnames are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl Default for IpSetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IpSetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpSetRegistry")
            .field("hostnames", &self.len())
            .finish()
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
