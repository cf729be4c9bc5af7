//! In-memory DNS cache owned by the resolver agent.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Address family requested by a resolver client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Does `address` belong to this family?
    pub fn matches(self, address: &IpAddr) -> bool {
        match self {
            IpVersion::V4 => address.is_ipv4(),
            IpVersion::V6 => address.is_ipv6(),
        }
    }
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => f.write_str("IPv4"),
            IpVersion::V6 => f.write_str("IPv6"),
        }
    }
}

/// First address in `addresses` whose family matches `version`.
///
/// The scan preserves resolver order, so repeated calls with the same
/// inputs pick the same address.
pub(crate) fn resolve_address_from_list(
    addresses: &[IpAddr],
    version: IpVersion,
) -> Option<IpAddr> {
    addresses.iter().copied().find(|a| version.matches(a))
}

/// One cached resolution: the addresses a lookup produced, in resolver
/// order, plus when they were stored.
#[derive(Debug, Clone)]
pub struct ResolveInfo {
    addresses: Vec<IpAddr>,
    created_at: Instant,
}

impl ResolveInfo {
    fn new(addresses: Vec<IpAddr>) -> Self {
        Self {
            addresses,
            created_at: Instant::now(),
        }
    }

    /// The stored addresses, in resolver order. Never empty.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    fn is_outdated(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.created_at) >= ttl
    }
}

/// Hostname -> [`ResolveInfo`] map. Owned solely by the resolver agent;
/// lookups are exact and case-sensitive.
#[derive(Debug, Default)]
pub struct LocalCache {
    data: HashMap<String, ResolveInfo>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `name` and pick the first stored address matching
    /// `version`. Returns `None` when the name is absent, and also when
    /// the name is cached but holds no address of the requested family.
    pub fn resolve(&self, name: &str, version: IpVersion) -> Option<IpAddr> {
        self.data
            .get(name)
            .and_then(|info| resolve_address_from_list(&info.addresses, version))
    }

    /// Store a fresh resolution for `name`, timestamped now.
    ///
    /// Empty address lists are not stored. If `name` is already cached the
    /// earlier entry wins and `addresses` is discarded; the agent issues at
    /// most one resolution per name, so the duplicate case does not occur
    /// in normal operation.
    pub fn add_records(&mut self, name: String, addresses: Vec<IpAddr>) {
        if addresses.is_empty() {
            return;
        }
        self.data
            .entry(name)
            .or_insert_with(|| ResolveInfo::new(addresses));
    }

    /// Drop every entry at least `ttl` old; returns how many were removed.
    pub fn remove_outdated_records(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, info| !info.is_outdated(ttl, now));
        before - self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn v6(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_resolve_missing_name_returns_none() {
        let cache = LocalCache::new();
        assert_eq!(cache.resolve("example.test", IpVersion::V4), None);
    }

    #[test]
    fn test_resolve_picks_first_matching_family() {
        let mut cache = LocalCache::new();
        cache.add_records(
            "example.test".to_string(),
            vec![v6("::1"), v4("10.0.0.1"), v4("10.0.0.2")],
        );
        assert_eq!(
            cache.resolve("example.test", IpVersion::V4),
            Some(v4("10.0.0.1"))
        );
        assert_eq!(cache.resolve("example.test", IpVersion::V6), Some(v6("::1")));
    }

    #[test]
    fn test_resolve_family_miss_on_cached_name() {
        let mut cache = LocalCache::new();
        cache.add_records("example.test".to_string(), vec![v4("10.0.0.1")]);
        // Cached, but no address of the requested family.
        assert_eq!(cache.resolve("example.test", IpVersion::V6), None);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let mut cache = LocalCache::new();
        cache.add_records(
            "example.test".to_string(),
            vec![v4("10.0.0.1"), v4("10.0.0.2")],
        );
        for _ in 0..10 {
            assert_eq!(
                cache.resolve("example.test", IpVersion::V4),
                Some(v4("10.0.0.1"))
            );
        }
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let mut cache = LocalCache::new();
        cache.add_records("Example.Test".to_string(), vec![v4("10.0.0.1")]);
        assert_eq!(cache.resolve("example.test", IpVersion::V4), None);
        assert!(cache.resolve("Example.Test", IpVersion::V4).is_some());
    }

    #[test]
    fn test_empty_address_list_not_stored() {
        let mut cache = LocalCache::new();
        cache.add_records("example.test".to_string(), vec![]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_duplicate_insertion_keeps_earlier_entry() {
        let mut cache = LocalCache::new();
        cache.add_records("example.test".to_string(), vec![v4("10.0.0.1")]);
        cache.add_records("example.test".to_string(), vec![v4("192.168.0.9")]);
        assert_eq!(
            cache.resolve("example.test", IpVersion::V4),
            Some(v4("10.0.0.1"))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_outdated_records_counts_removals() {
        let mut cache = LocalCache::new();
        cache.add_records("a.test".to_string(), vec![v4("10.0.0.1")]);
        cache.add_records("b.test".to_string(), vec![v4("10.0.0.2")]);
        // Fresh entries survive a TTL-bounded sweep.
        assert_eq!(cache.remove_outdated_records(TTL), 0);
        assert_eq!(cache.len(), 2);
        // With a zero TTL everything is outdated.
        assert_eq!(cache.remove_outdated_records(Duration::ZERO), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_second_sweep_removes_nothing() {
        let mut cache = LocalCache::new();
        cache.add_records("a.test".to_string(), vec![v4("10.0.0.1")]);
        assert_eq!(cache.remove_outdated_records(Duration::ZERO), 1);
        assert_eq!(cache.remove_outdated_records(Duration::ZERO), 0);
    }

    #[test]
    fn test_clear_empties_cache() {
        let mut cache = LocalCache::new();
        cache.add_records("a.test".to_string(), vec![v4("10.0.0.1")]);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.resolve("a.test", IpVersion::V4), None);
    }

    #[test]
    fn test_resolve_address_from_list_empty() {
        assert_eq!(resolve_address_from_list(&[], IpVersion::V4), None);
    }
}
