//! Fake-IP table: domain -> fake IP and fake IP -> DNS session
//!
//! Both maps and the pool cursors live in one [`FakeIpTable`] behind a
//! single `parking_lot::Mutex`, so a session is either reachable from both
//! directions or from neither. The raw maps never leave this module.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::config::FakeIpConfig;
use super::pool::FakeIpPool;
use super::session::DnsSession;
use crate::error::FakeDnsError;
use crate::packet::DnsMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(query_type: RecordType) -> Self {
        if query_type == RecordType::AAAA {
            Self::V6
        } else {
            Self::V4
        }
    }
}

struct FakeIpTable {
    ipv4: FakeIpPool,
    ipv6: Option<FakeIpPool>,
    by_domain: HashMap<(Family, String), IpAddr>,
    by_ip: HashMap<IpAddr, Arc<DnsSession>>,
}

impl FakeIpTable {
    /// Drop the mapping for `ip` from both maps
    fn evict(&mut self, ip: IpAddr) {
        if let Some(session) = self.by_ip.remove(&ip) {
            let family = Family::of(session.query_type());
            let key = (family, session.domain().to_string());
            if self.by_domain.get(&key) == Some(&ip) {
                self.by_domain.remove(&key);
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<IpAddr> = self
            .by_ip
            .iter()
            .filter(|(_, session)| session.is_expired(now))
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &expired {
            self.evict(*ip);
        }
        expired.len()
    }

    fn pool_mut(&mut self, family: Family) -> Result<&mut FakeIpPool, FakeDnsError> {
        match family {
            Family::V4 => Ok(&mut self.ipv4),
            Family::V6 => self.ipv6.as_mut().ok_or(FakeDnsError::Ipv6Disabled),
        }
    }

    /// Find a free address, reclaiming expired ones on the way
    fn allocate(&mut self, family: Family, now: Instant) -> Result<IpAddr, FakeDnsError> {
        let size = self.pool_mut(family)?.size();

        for _ in 0..size {
            let candidate = self.pool_mut(family)?.next_candidate();
            match self.by_ip.get(&candidate).map(|owner| owner.is_expired(now)) {
                None => return Ok(candidate),
                Some(true) => {
                    self.evict(candidate);
                    return Ok(candidate);
                }
                Some(false) => {}
            }
        }

        Err(FakeDnsError::PoolExhausted { size })
    }
}

/// Fake-IP manager
///
/// Hands out synthetic addresses for domains and resolves them back to the
/// [`DnsSession`] that produced them until the session expires.
pub struct FakeDnsManager {
    table: Mutex<FakeIpTable>,
    ttl: Duration,
    max_entries: usize,
    cleanup_interval: Duration,
    enabled: bool,
}

impl FakeDnsManager {
    /// Create a manager from configuration
    #[must_use]
    pub fn new(config: &FakeIpConfig) -> Self {
        Self {
            table: Mutex::new(FakeIpTable {
                ipv4: FakeIpPool::v4(config.ipv4_pool),
                ipv6: config.ipv6_pool.map(FakeIpPool::v6),
                by_domain: HashMap::new(),
                by_ip: HashMap::new(),
            }),
            ttl: config.ttl(),
            max_entries: config.max_entries,
            cleanup_interval: config.cleanup_interval(),
            enabled: config.enabled,
        }
    }

    /// Whether connect sessions should translate fake IPs
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lifetime of a mapping
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Assign a fake IPv4 address to `domain`.
    ///
    /// Builds a synthetic A query session for the domain and records it,
    /// exactly as if the DNS server had answered a query for it.
    ///
    /// # Errors
    ///
    /// Returns [`FakeDnsError::InvalidDomain`] if the domain is not a valid
    /// DNS name and [`FakeDnsError::PoolExhausted`] if no address is free.
    pub fn assign_fake_ip(&self, domain: &str) -> Result<IpAddr, FakeDnsError> {
        let session = synthetic_session(domain, RecordType::A)?;
        let session = self.assign_session(session)?;
        session
            .fake_ip()
            .ok_or_else(|| FakeDnsError::InvalidDomain(domain.to_string()))
    }

    /// Record `session` in the table under a fake IP.
    ///
    /// A domain that still holds a live address keeps it; the session
    /// replaces the old one and the expiry is pushed out by one TTL.
    /// Otherwise a free address is taken from the pool (AAAA queries use
    /// the IPv6 pool).
    ///
    /// # Errors
    ///
    /// [`FakeDnsError::Ipv6Disabled`] for AAAA without an IPv6 pool and
    /// [`FakeDnsError::PoolExhausted`] when every address is live.
    pub fn assign_session(&self, mut session: DnsSession) -> Result<Arc<DnsSession>, FakeDnsError> {
        let family = Family::of(session.query_type());
        let key = (family, session.domain().to_string());
        let now = Instant::now();
        let expire_at = now + self.ttl;

        let mut table = self.table.lock();

        let existing = table.by_domain.get(&key).copied().filter(|ip| {
            table
                .by_ip
                .get(ip)
                .is_some_and(|owner| !owner.is_expired(now))
        });

        let ip = match existing {
            Some(ip) => {
                trace!("fake ip reused: {} -> {}", key.1, ip);
                ip
            }
            None => {
                if let Some(stale) = table.by_domain.get(&key).copied() {
                    table.evict(stale);
                }
                if table.by_ip.len() >= self.max_entries && table.purge_expired(now) == 0 {
                    warn!("fake ip table full ({} entries), refusing {}", self.max_entries, key.1);
                    return Err(FakeDnsError::PoolExhausted {
                        size: self.max_entries as u64,
                    });
                }
                let ip = table.allocate(family, now).inspect_err(|e| {
                    warn!("fake ip allocation failed for {}: {}", key.1, e);
                })?;
                debug!("fake ip assigned: {} -> {}", key.1, ip);
                ip
            }
        };

        session.set_fake_ip(ip, expire_at);
        let session = Arc::new(session);
        table.by_ip.insert(ip, Arc::clone(&session));
        table.by_domain.insert(key, ip);
        Ok(session)
    }

    /// Reverse lookup of a fake IP.
    ///
    /// Returns `None` if `ip` is not mapped or its session has expired; an
    /// expired mapping is evicted on the spot.
    #[must_use]
    pub fn lookup_fake_ip(&self, ip: IpAddr) -> Option<Arc<DnsSession>> {
        let now = Instant::now();
        let mut table = self.table.lock();
        let session = table.by_ip.get(&ip).cloned()?;
        if session.is_expired(now) {
            table.evict(ip);
            return None;
        }
        Some(session)
    }

    /// Whether `ip` belongs to a configured fake-IP block
    #[must_use]
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        let table = self.table.lock();
        table.ipv4.contains(ip) || table.ipv6.as_ref().is_some_and(|p| p.contains(ip))
    }

    /// Number of live or not-yet-swept mappings
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().by_ip.len()
    }

    /// Whether the table holds no mappings
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired mappings, returning how many were dropped
    pub fn cleanup(&self) -> usize {
        let removed = self.table.lock().purge_expired(Instant::now());
        if removed > 0 {
            debug!("fake ip cleanup removed {} expired entries", removed);
        }
        removed
    }

    /// Spawn the periodic cleanup task.
    ///
    /// The task holds only a weak reference and exits once the manager is
    /// dropped. Abort the handle to stop it earlier.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.cleanup();
            }
        })
    }
}

impl std::fmt::Debug for FakeDnsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDnsManager")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn synthetic_session(domain: &str, query_type: RecordType) -> Result<DnsSession, FakeDnsError> {
    let trimmed = domain.trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(FakeDnsError::InvalidDomain(domain.to_string()));
    }
    let name = Name::from_str(&format!("{trimmed}."))
        .map_err(|e| FakeDnsError::InvalidDomain(format!("{domain}: {e}")))?;

    let mut msg = Message::new();
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, query_type));

    DnsSession::new(DnsMessage::from_message(msg), None)
        .ok_or_else(|| FakeDnsError::InvalidDomain(domain.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn manager_with(pool: &str, ttl: Duration) -> FakeDnsManager {
        let config = FakeIpConfig::new().with_ipv4_pool(pool.parse().unwrap());
        let mut manager = FakeDnsManager::new(&config);
        // Sub-second TTLs keep the expiry tests fast
        manager.ttl = ttl;
        manager
    }

    #[test]
    fn test_assign_and_lookup() {
        let manager = manager_with("10.0.0.0/24", Duration::from_secs(60));
        let ip = manager.assign_fake_ip("example.com").unwrap();

        assert!(manager.is_fake_ip(ip));
        let session = manager.lookup_fake_ip(ip).expect("mapping is live");
        assert_eq!(session.domain(), "example.com");
        assert_eq!(session.fake_ip(), Some(ip));
        assert!(session.expire_at().is_some());
    }

    #[test]
    fn test_same_domain_keeps_ip() {
        let manager = manager_with("10.0.0.0/24", Duration::from_secs(60));
        let a = manager.assign_fake_ip("example.com").unwrap();
        let b = manager.assign_fake_ip("Example.com.").unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_distinct_domains_never_collide() {
        let manager = manager_with("10.0.0.0/24", Duration::from_secs(60));
        let mut seen = HashSet::new();
        for i in 0..200 {
            let ip = manager.assign_fake_ip(&format!("host{i}.example")).unwrap();
            assert!(seen.insert(ip), "duplicate fake ip {ip}");
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let manager = manager_with("10.0.0.0/30", Duration::from_secs(60));
        manager.assign_fake_ip("a.example").unwrap();
        manager.assign_fake_ip("b.example").unwrap();
        assert!(matches!(
            manager.assign_fake_ip("c.example"),
            Err(FakeDnsError::PoolExhausted { size: 2 })
        ));
    }

    #[test]
    fn test_expiry_and_reuse() {
        let manager = manager_with("10.0.0.0/30", Duration::from_millis(30));
        let a = manager.assign_fake_ip("a.example").unwrap();
        let b = manager.assign_fake_ip("b.example").unwrap();

        thread::sleep(Duration::from_millis(60));

        assert!(manager.lookup_fake_ip(a).is_none());
        // b is still in the table but expired, so it can be handed out again
        let c = manager.assign_fake_ip("c.example").unwrap();
        assert!(c == a || c == b);
        let session = manager.lookup_fake_ip(c).unwrap();
        assert_eq!(session.domain(), "c.example");
    }

    #[test]
    fn test_cleanup() {
        let manager = manager_with("10.0.0.0/24", Duration::from_millis(20));
        manager.assign_fake_ip("a.example").unwrap();
        manager.assign_fake_ip("b.example").unwrap();
        assert_eq!(manager.len(), 2);

        thread::sleep(Duration::from_millis(40));
        assert_eq!(manager.cleanup(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_is_fake_ip() {
        let manager = manager_with("198.18.0.0/15", Duration::from_secs(60));
        assert!(manager.is_fake_ip("198.18.0.1".parse().unwrap()));
        assert!(manager.is_fake_ip("198.19.255.254".parse().unwrap()));
        assert!(!manager.is_fake_ip("8.8.8.8".parse().unwrap()));
        assert!(!manager.is_fake_ip("fc00::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_requires_pool() {
        let manager = manager_with("10.0.0.0/24", Duration::from_secs(60));
        let session = synthetic_session("v6.example", RecordType::AAAA).unwrap();
        assert!(matches!(
            manager.assign_session(session),
            Err(FakeDnsError::Ipv6Disabled)
        ));

        let config = FakeIpConfig::new().with_ipv6_pool("fc00::/120".parse().unwrap());
        let manager = FakeDnsManager::new(&config);
        let session = synthetic_session("v6.example", RecordType::AAAA).unwrap();
        let session = manager.assign_session(session).unwrap();
        let ip = session.fake_ip().unwrap();
        assert!(ip.is_ipv6());
        assert!(manager.is_fake_ip(ip));
    }

    #[test]
    fn test_invalid_domain() {
        let manager = manager_with("10.0.0.0/24", Duration::from_secs(60));
        assert!(matches!(
            manager.assign_fake_ip(""),
            Err(FakeDnsError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_concurrent_assign() {
        let manager = Arc::new(manager_with("10.0.0.0/16", Duration::from_secs(60)));
        let mut handles = vec![];
        for t in 0..4 {
            let manager = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                (0..100)
                    .map(|i| {
                        let domain = format!("t{t}-{i}.example");
                        let ip = manager.assign_fake_ip(&domain).unwrap();
                        (domain, ip)
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut ips = HashSet::new();
        for handle in handles {
            for (domain, ip) in handle.join().unwrap() {
                assert!(ips.insert(ip));
                assert_eq!(manager.lookup_fake_ip(ip).unwrap().domain(), domain);
            }
        }
    }
}
