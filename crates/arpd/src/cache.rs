//! Neighbor map, aging thresholds and the bulk iteration order

use crate::config::AgingConfig;
use crate::types::{IfIndex, NeighborEntry};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

/// Tick thresholds of the aging state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgingPolicy {
    pub timeout_secs: u32,
    pub granularity_secs: u32,
    /// Ticks in a full timeout
    pub full: u32,
    pub min_retain: u32,
    pub retry: u32,
}

impl AgingPolicy {
    pub fn from_config(config: &AgingConfig) -> Self {
        Self {
            timeout_secs: config.timeout_secs,
            granularity_secs: config.granularity_secs.max(1),
            full: config.full_timeout_counter(),
            min_retain: config.min_retain_count,
            retry: config.retry_count,
        }
    }

    /// Same thresholds with a different timeout
    pub fn with_timeout(self, timeout_secs: u32) -> Self {
        Self {
            timeout_secs,
            full: timeout_secs / self.granularity_secs,
            ..self
        }
    }

    /// Counter that leaves room for the retry window
    pub fn is_usable_full(&self, full: u32) -> bool {
        full > self.min_retain + self.retry
    }

    #[inline]
    pub fn is_expired(&self, counter: u32) -> bool {
        counter <= self.min_retain
    }

    /// Final `retry` ticks before expiry
    #[inline]
    pub fn in_retry_window(&self, counter: u32) -> bool {
        counter > self.min_retain && counter <= self.min_retain + self.retry
    }

    fn one_minute_mark(&self) -> u32 {
        60 / self.granularity_secs
    }

    fn thirty_second_mark(&self) -> u32 {
        30 / self.granularity_secs
    }

    /// Whether a freshly decremented counter calls for a request
    pub fn should_probe(&self, counter: u32) -> bool {
        if self.in_retry_window(counter) {
            return true;
        }
        if self.is_expired(counter) {
            return false;
        }
        counter == self.full / 2
            || counter == self.full / 4
            || counter == self.one_minute_mark()
            || counter == self.thirty_second_mark()
    }

    /// Counter for entries reloaded from persistence
    pub fn reload_counter(&self) -> u32 {
        self.min_retain + self.retry + 1
    }

    pub fn remaining_secs(&self, counter: u32) -> u64 {
        counter as u64 * self.granularity_secs as u64
    }
}

/// Neighbor entries keyed by address, plus the bulk snapshot order
#[derive(Debug, Default)]
pub struct NeighborCache {
    entries: HashMap<Ipv4Addr, NeighborEntry>,
    order: Vec<Ipv4Addr>,
    ordered: HashSet<Ipv4Addr>,
}

impl NeighborCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<&NeighborEntry> {
        self.entries.get(ip)
    }

    pub fn get_mut(&mut self, ip: &Ipv4Addr) -> Option<&mut NeighborEntry> {
        self.entries.get_mut(ip)
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        self.entries.contains_key(ip)
    }

    /// Inserts or replaces; new addresses are appended to the bulk order
    pub fn insert(&mut self, entry: NeighborEntry) -> bool {
        let ip = entry.ip;
        let is_new = self.entries.insert(ip, entry).is_none();
        if is_new && self.ordered.insert(ip) {
            self.order.push(ip);
        }
        is_new
    }

    /// Removes the entry; its slot in the bulk order stays until the next rebuild
    pub fn remove(&mut self, ip: &Ipv4Addr) -> Option<NeighborEntry> {
        self.entries.remove(ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut NeighborEntry> {
        self.entries.values_mut()
    }

    /// Addresses in ascending order
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        let mut ips: Vec<Ipv4Addr> = self.entries.keys().copied().collect();
        ips.sort();
        ips
    }

    /// Addresses of entries on one L3 interface
    pub fn addresses_on(&self, l3_if_index: IfIndex) -> Vec<Ipv4Addr> {
        let mut ips: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|e| e.l3_if_index == l3_if_index)
            .map(|e| e.ip)
            .collect();
        ips.sort();
        ips
    }

    /// Addresses of entries learned on one port
    pub fn addresses_on_port(&self, port: IfIndex) -> Vec<Ipv4Addr> {
        let mut ips: Vec<Ipv4Addr> = self
            .entries
            .values()
            .filter(|e| e.port == Some(port))
            .map(|e| e.ip)
            .collect();
        ips.sort();
        ips
    }

    /// Recomputes the bulk order from the live map
    pub fn rebuild_order(&mut self) {
        self.order = self.addresses();
        self.ordered = self.order.iter().copied().collect();
    }

    pub fn order_len(&self) -> usize {
        self.order.len()
    }

    /// Entries at bulk positions `[from, from + count)` and the next index
    /// (0 once the order is exhausted)
    pub fn page(&self, from: usize, count: usize) -> (Vec<&NeighborEntry>, usize) {
        let end = from.saturating_add(count);
        let entries = self
            .order
            .iter()
            .skip(from)
            .take(count)
            .filter_map(|ip| self.entries.get(ip))
            .collect();
        let next = if end < self.order.len() { end } else { 0 };
        (entries, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NeighborMac, NeighborOwner};
    use pretty_assertions::assert_eq;

    fn entry(last: u8) -> NeighborEntry {
        NeighborEntry {
            ip: Ipv4Addr::new(10, 0, 0, last),
            mac: NeighborMac::Unresolved,
            port: Some(1),
            vlan: None,
            l3_if_index: 1,
            aging_counter: 10,
            last_resolved_at: None,
            owner: NeighborOwner::PassivelyLearned,
            persisted: false,
        }
    }

    fn policy() -> AgingPolicy {
        AgingPolicy::from_config(&AgingConfig::default())
    }

    #[test]
    fn test_probe_thresholds() {
        let policy = policy();
        assert_eq!(policy.full, 600);
        assert!(policy.should_probe(300));
        assert!(policy.should_probe(150));
        assert!(policy.should_probe(60));
        assert!(policy.should_probe(30));
        assert!(!policy.should_probe(299));
        assert!(!policy.should_probe(7));
        for c in 2..=6 {
            assert!(policy.should_probe(c), "counter {}", c);
        }
        assert!(!policy.should_probe(1));
        assert!(policy.is_expired(1));
        assert_eq!(policy.reload_counter(), 7);
    }

    #[test]
    fn test_policy_granularity_scaling() {
        let config = AgingConfig {
            granularity_secs: 10,
            ..AgingConfig::default()
        };
        let policy = AgingPolicy::from_config(&config);
        assert_eq!(policy.full, 60);
        assert!(policy.should_probe(30));
        assert!(policy.should_probe(15));
        assert!(policy.should_probe(3));
        assert_eq!(policy.remaining_secs(6), 60);
        assert_eq!(policy.with_timeout(1200).full, 120);
    }

    #[test]
    fn test_insert_appends_order_once() {
        let mut cache = NeighborCache::new();
        assert!(cache.insert(entry(2)));
        assert!(cache.insert(entry(1)));
        assert!(!cache.insert(entry(2)));
        assert_eq!(cache.order_len(), 2);

        cache.remove(&Ipv4Addr::new(10, 0, 0, 2));
        cache.insert(entry(2));
        assert_eq!(cache.order_len(), 2);

        cache.rebuild_order();
        let (page, next) = cache.page(0, 10);
        assert_eq!(next, 0);
        assert_eq!(
            page.iter().map(|e| e.ip).collect::<Vec<_>>(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn test_pages_cover_every_entry_once() {
        let mut cache = NeighborCache::new();
        for i in 1..=25 {
            cache.insert(entry(i));
        }
        cache.rebuild_order();

        let mut seen = Vec::new();
        let mut from = 0;
        loop {
            let (page, next) = cache.page(from, 7);
            seen.extend(page.iter().map(|e| e.ip));
            if next == 0 {
                break;
            }
            from = next;
        }
        assert_eq!(seen, cache.addresses());
    }

    #[test]
    fn test_page_skips_removed() {
        let mut cache = NeighborCache::new();
        for i in 1..=4 {
            cache.insert(entry(i));
        }
        cache.remove(&Ipv4Addr::new(10, 0, 0, 2));
        let (page, next) = cache.page(0, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(next, 3);
        let (page, next) = cache.page(3, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(next, 0);
    }

    #[test]
    fn test_addresses_on_interface() {
        let mut cache = NeighborCache::new();
        cache.insert(entry(1));
        let mut other = entry(2);
        other.l3_if_index = 100;
        other.port = Some(3);
        cache.insert(other);
        assert_eq!(cache.addresses_on(100), vec![Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(cache.addresses_on_port(1), vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }
}
