//! process wide session bookkeeping: the connection registry, the source
//! address blocklists and the per source usage counters
//!
//! all of it lives in the server context and is only touched from the event
//! loop thread

use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::Context;
use mio::Token;

use crate::config::SourceLimits;

pub struct RegistryEntry {
    pub token: Token,
    pub created: Instant,
    pub last_refresh: Instant,
}

/// live sessions keyed by peer address, in recency order: the least recently
/// refreshed entries are the first eviction candidates
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: HashMap<SocketAddr, RegistryEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, peer: SocketAddr, token: Token) {
        let now = Instant::now();
        self.entries.insert(
            peer,
            RegistryEntry {
                token,
                created: now,
                last_refresh: now,
            },
        );
    }

    pub fn refresh(&mut self, peer: &SocketAddr) {
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.last_refresh = Instant::now();
        }
    }

    pub fn remove(&mut self, peer: &SocketAddr) -> Option<RegistryEntry> {
        self.entries.remove(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// tokens of the least recently refreshed sessions to close so a new one
    /// fits, skipping sessions protected by the minimum keepalive guarantee.
    /// When not enough candidates exist the capacity will be exceeded and
    /// the second member is true.
    pub fn eviction_plan(
        &self,
        capacity: usize,
        min_keepalive: Duration,
    ) -> (Vec<Token>, bool) {
        if self.entries.len() < capacity {
            return (Vec::new(), false);
        }

        let needed = self.entries.len() + 1 - capacity;
        let now = Instant::now();

        let mut candidates: Vec<(&SocketAddr, &RegistryEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_refresh) >= min_keepalive)
            .collect();
        candidates.sort_by_key(|(_, e)| e.last_refresh);

        let evicted: Vec<Token> = candidates
            .iter()
            .take(needed)
            .map(|(_, e)| e.token)
            .collect();
        let exceeded = evicted.len() < needed;
        (evicted, exceeded)
    }
}

/// a blocked address or a /8 /16 /24 subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockSpec {
    Addr(IpAddr),
    Subnet { base: Ipv4Addr, prefix: u8 },
}

impl BlockSpec {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            BlockSpec::Addr(blocked) => *blocked == ip,
            BlockSpec::Subnet { base, prefix } => match ip {
                IpAddr::V4(v4) => {
                    let shift = 32 - prefix;
                    (u32::from(v4) >> shift) == (u32::from(*base) >> shift)
                }
                IpAddr::V6(_) => false,
            },
        }
    }
}

impl FromStr for BlockSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<BlockSpec, Self::Err> {
        match s.split_once('/') {
            None => {
                let addr: IpAddr = s
                    .parse()
                    .with_context(|| format!("invalid blocked address: {s}"))?;
                Ok(BlockSpec::Addr(addr))
            }
            Some((base, prefix)) => {
                let base: Ipv4Addr = base
                    .parse()
                    .with_context(|| format!("invalid blocked subnet base: {s}"))?;
                let prefix: u8 = prefix
                    .parse()
                    .with_context(|| format!("invalid subnet prefix: {s}"))?;
                if !matches!(prefix, 8 | 16 | 24) {
                    anyhow::bail!("only /8, /16 and /24 subnets are supported: {s}");
                }
                Ok(BlockSpec::Subnet { base, prefix })
            }
        }
    }
}

impl fmt::Display for BlockSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockSpec::Addr(ip) => write!(f, "{ip}"),
            BlockSpec::Subnet { base, prefix } => write!(f, "{base}/{prefix}"),
        }
    }
}

/// permanent, administrator issued blocks plus temporary blocks recorded on
/// rate limit breaches; the whole list is rewritten to the blocklist file on
/// every mutation, for external tooling
pub struct Blocklist {
    permanent: HashSet<BlockSpec>,
    temporary: HashMap<IpAddr, Instant>,
    path: Option<PathBuf>,
}

impl Blocklist {
    pub fn new(static_specs: Vec<BlockSpec>, path: Option<PathBuf>) -> Blocklist {
        Blocklist {
            permanent: static_specs.into_iter().collect(),
            temporary: HashMap::new(),
            path,
        }
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.temporary.contains_key(&ip) || self.permanent.iter().any(|spec| spec.matches(ip))
    }

    pub fn block(&mut self, spec: BlockSpec) {
        if self.permanent.insert(spec) {
            self.persist();
        }
    }

    pub fn unblock(&mut self, spec: BlockSpec) {
        let mut changed = self.permanent.remove(&spec);
        if let BlockSpec::Addr(ip) = spec {
            changed |= self.temporary.remove(&ip).is_some();
        }
        if changed {
            self.persist();
        }
    }

    pub fn block_temporarily(&mut self, ip: IpAddr) {
        self.temporary.insert(ip, Instant::now());
        self.persist();
    }

    /// drops temporary entries older than the retention window
    pub fn prune(&mut self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.temporary.len();
        self.temporary
            .retain(|_, blocked_at| now.duration_since(*blocked_at) < retention);
        let pruned = before - self.temporary.len();
        if pruned > 0 {
            self.persist();
        }
        pruned
    }

    pub fn list_blocked(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .permanent
            .iter()
            .map(|spec| spec.to_string())
            .chain(self.temporary.keys().map(|ip| ip.to_string()))
            .collect();
        lines.sort();
        lines
    }

    fn persist(&self) {
        if let Err(e) = self.write_file() {
            error!("could not persist the blocklist: {:?}", e);
        }
    }

    fn write_file(&self) -> anyhow::Result<()> {
        let path = match self.path.as_ref() {
            Some(path) => path,
            None => return Ok(()),
        };

        let mut contents = String::new();
        for line in self.list_blocked() {
            contents.push_str(&line);
            contents.push('\n');
        }
        fs::write(path, contents)
            .with_context(|| format!("could not write blocklist to {}", path.display()))
    }
}

/// details recorded when a source address exceeds its ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitBreach {
    pub window_age: Duration,
    pub requests: u64,
    pub bytes: u64,
}

struct SourceUsage {
    requests: u64,
    bytes: u64,
    window_start: Instant,
    last_logged: Option<Instant>,
    lifetime_requests: u64,
}

/// windowed request/byte accounting per source address
#[derive(Default)]
pub struct SourceStats {
    entries: HashMap<IpAddr, SourceUsage>,
}

impl SourceStats {
    pub fn new() -> SourceStats {
        SourceStats {
            entries: HashMap::new(),
        }
    }

    fn entry(&mut self, ip: IpAddr) -> &mut SourceUsage {
        self.entries.entry(ip).or_insert_with(|| SourceUsage {
            requests: 0,
            bytes: 0,
            window_start: Instant::now(),
            last_logged: None,
            lifetime_requests: 0,
        })
    }

    pub fn record_request(&mut self, ip: IpAddr) {
        let usage = self.entry(ip);
        usage.requests += 1;
        usage.lifetime_requests += 1;
    }

    pub fn record_bytes(&mut self, ip: IpAddr, count: u64) {
        self.entry(ip).bytes += count;
    }

    /// checks the source against its ceilings, restarting the window when it
    /// lapsed on its own
    pub fn check(&mut self, ip: IpAddr, limits: &SourceLimits) -> Result<(), LimitBreach> {
        let usage = self.entry(ip);
        let now = Instant::now();

        if now.duration_since(usage.window_start) > limits.window {
            usage.requests = 0;
            usage.bytes = 0;
            usage.window_start = now;
        }

        if usage.requests > limits.max_requests || usage.bytes > limits.max_bytes {
            return Err(LimitBreach {
                window_age: now.duration_since(usage.window_start),
                requests: usage.requests,
                bytes: usage.bytes,
            });
        }
        Ok(())
    }

    /// rate limits access records: at most one per source per interval
    pub fn should_log(&mut self, ip: IpAddr, interval: Duration) -> bool {
        let usage = self.entry(ip);
        let now = Instant::now();
        match usage.last_logged {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                usage.last_logged = Some(now);
                true
            }
        }
    }

    /// a source with prior request history is protected from the 503
    /// rejection when the registry overflows
    pub fn known_source(&self, ip: IpAddr) -> bool {
        self.entries
            .get(&ip)
            .map(|usage| usage.lifetime_requests > 0)
            .unwrap_or(false)
    }

    /// drops windows that lapsed longer than the retention ago
    pub fn prune(&mut self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, usage| now.duration_since(usage.window_start) < retention);
        before - self.entries.len()
    }
}
