//! Route table with a per-switch destination cache.
//!
//! Lookups are longest-prefix match over the switch's routes. Results are
//! cached per destination address in a bounded, per-switch cache; the oldest
//! binding is evicted first. Every switch has its own section, so route
//! changes on one switch never block lookups on another.
//!
//! A route change drops every cached binding of that switch whose destination
//! lies inside the changed network before the change becomes visible, and
//! bumps the switch's generation so a lookup that raced the change cannot
//! re-insert its stale result.

use crate::ids::SwitchId;
use dashmap::DashMap;
use parking_lot::RwLock;
use sdnc_types::{IpAddress, IpPrefix};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cached bindings kept per switch unless configured otherwise.
pub const DEFAULT_ROUTE_CACHE_CAPACITY: usize = 4096;

/// Next hop for a destination network, as seen from one switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub destination_network: IpPrefix,
    pub next_hop_switch: SwitchId,
    pub egress_port: u32,
}

impl RouteEntry {
    pub fn new(destination_network: IpPrefix, next_hop_switch: SwitchId, egress_port: u32) -> Self {
        Self {
            destination_network,
            next_hop_switch,
            egress_port,
        }
    }
}

/// Resolved forwarding binding for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub network: IpPrefix,
    pub egress_port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidated: u64,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct SwitchRoutes {
    routes: BTreeMap<IpPrefix, RouteEntry>,
    cache: HashMap<IpAddress, Binding>,
    /// Insertion order of `cache`, oldest first.
    order: VecDeque<IpAddress>,
    generation: u64,
}

impl SwitchRoutes {
    fn longest_match(&self, dest: &IpAddress) -> Option<Binding> {
        self.routes
            .values()
            .filter(|r| r.destination_network.contains(dest))
            .max_by_key(|r| r.destination_network.prefix_len())
            .map(|r| Binding {
                network: r.destination_network,
                egress_port: r.egress_port,
            })
    }

    fn invalidate(&mut self, network: &IpPrefix) -> usize {
        let before = self.cache.len();
        self.cache.retain(|dest, _| !network.contains(dest));
        let cache = &self.cache;
        self.order.retain(|dest| cache.contains_key(dest));
        self.generation += 1;
        before - self.cache.len()
    }

    /// Caches `binding`, evicting the oldest entries beyond `capacity`.
    /// Returns the number evicted.
    fn remember(&mut self, dest: IpAddress, binding: Binding, capacity: usize) -> usize {
        if capacity == 0 || self.cache.insert(dest, binding).is_some() {
            return 0;
        }
        self.order.push_back(dest);
        let mut evicted = 0;
        while self.cache.len() > capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[derive(Debug)]
pub struct RouteTable {
    switches: DashMap<SwitchId, Arc<RwLock<SwitchRoutes>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidated: AtomicU64,
    evicted: AtomicU64,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_cache_capacity(DEFAULT_ROUTE_CACHE_CAPACITY)
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table caching at most `capacity` bindings per switch; 0 disables
    /// the cache.
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            switches: DashMap::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn cache_capacity(&self) -> usize {
        self.capacity
    }

    fn slot(&self, switch_id: SwitchId) -> Arc<RwLock<SwitchRoutes>> {
        self.switches.entry(switch_id).or_default().value().clone()
    }

    fn existing(&self, switch_id: SwitchId) -> Option<Arc<RwLock<SwitchRoutes>>> {
        self.switches.get(&switch_id).map(|s| s.value().clone())
    }

    fn count_invalidated(&self, dropped: usize) {
        self.invalidated.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Adds a route on `switch_id`, replacing any route for the same network.
    pub fn add_route(&self, switch_id: SwitchId, route: RouteEntry) -> Option<RouteEntry> {
        let slot = self.slot(switch_id);
        let mut state = slot.write();
        let previous = state.routes.insert(route.destination_network, route);
        let dropped = state.invalidate(&route.destination_network);
        self.count_invalidated(dropped);
        previous
    }

    pub fn remove_route(&self, switch_id: SwitchId, network: &IpPrefix) -> Option<RouteEntry> {
        let slot = self.existing(switch_id)?;
        let mut state = slot.write();
        let removed = state.routes.remove(network)?;
        let dropped = state.invalidate(network);
        self.count_invalidated(dropped);
        Some(removed)
    }

    /// Routes of a switch, ordered by network.
    pub fn routes(&self, switch_id: SwitchId) -> Vec<RouteEntry> {
        self.existing(switch_id)
            .map(|slot| slot.read().routes.values().copied().collect())
            .unwrap_or_default()
    }

    /// Drops cached bindings of `switch_id` whose destination lies in
    /// `network`.
    pub fn invalidate(&self, switch_id: SwitchId, network: &IpPrefix) {
        if let Some(slot) = self.existing(switch_id) {
            let dropped = slot.write().invalidate(network);
            self.count_invalidated(dropped);
        }
    }

    /// Resolves `dest` as seen from `switch_id`, via the cache when possible.
    pub fn resolve(&self, switch_id: SwitchId, dest: &IpAddress) -> Option<Binding> {
        let slot = self.existing(switch_id)?;
        let (binding, generation) = {
            let state = slot.read();
            if let Some(hit) = state.cache.get(dest) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(*hit);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            (state.longest_match(dest)?, state.generation)
        };

        let mut state = slot.write();
        if state.generation == generation {
            let evicted = state.remember(*dest, binding, self.capacity);
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        Some(binding)
    }

    pub fn cached(&self, switch_id: SwitchId, dest: &IpAddress) -> Option<Binding> {
        self.existing(switch_id)?.read().cache.get(dest).copied()
    }

    /// Number of cached bindings on a switch.
    pub fn cached_len(&self, switch_id: SwitchId) -> usize {
        self.existing(switch_id)
            .map(|slot| slot.read().cache.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> RouteStats {
        RouteStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const S1: SwitchId = SwitchId::new(1);
    const S2: SwitchId = SwitchId::new(2);

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    fn net(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    fn route(network: &str, port: u32) -> RouteEntry {
        RouteEntry::new(net(network), S2, port)
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::new();
        table.add_route(S1, route("0.0.0.0/0", 1));
        table.add_route(S1, route("10.0.0.0/8", 2));
        table.add_route(S1, route("10.1.0.0/16", 3));

        assert_eq!(table.resolve(S1, &ip("10.1.2.3")).unwrap().egress_port, 3);
        assert_eq!(table.resolve(S1, &ip("10.2.0.1")).unwrap().egress_port, 2);
        assert_eq!(table.resolve(S1, &ip("192.168.0.1")).unwrap().egress_port, 1);
        assert_eq!(table.resolve(S1, &ip("2001:db8::1")), None);
        assert_eq!(table.resolve(S2, &ip("10.1.2.3")), None);
    }

    #[test]
    fn test_cache_populated_and_hit() {
        let table = RouteTable::new();
        table.add_route(S1, route("10.0.0.0/8", 2));

        table.resolve(S1, &ip("10.0.0.1"));
        assert_eq!(
            table.cached(S1, &ip("10.0.0.1")),
            Some(Binding {
                network: net("10.0.0.0/8"),
                egress_port: 2
            })
        );
        table.resolve(S1, &ip("10.0.0.1"));
        assert_eq!(table.stats().cache_hits, 1);
        assert_eq!(table.stats().cache_misses, 1);
    }

    #[test]
    fn test_more_specific_route_invalidates() {
        let table = RouteTable::new();
        table.add_route(S1, route("10.0.0.0/8", 2));
        assert_eq!(table.resolve(S1, &ip("10.1.0.1")).unwrap().egress_port, 2);
        assert_eq!(table.resolve(S1, &ip("10.2.0.1")).unwrap().egress_port, 2);

        table.add_route(S1, route("10.1.0.0/16", 7));
        assert_eq!(table.cached(S1, &ip("10.1.0.1")), None);
        // Bindings outside the changed network survive.
        assert!(table.cached(S1, &ip("10.2.0.1")).is_some());
        assert_eq!(table.resolve(S1, &ip("10.1.0.1")).unwrap().egress_port, 7);
    }

    #[test]
    fn test_remove_route() {
        let table = RouteTable::new();
        table.add_route(S1, route("10.0.0.0/8", 2));
        table.resolve(S1, &ip("10.0.0.1"));

        assert!(table.remove_route(S1, &net("10.0.0.0/8")).is_some());
        assert_eq!(table.resolve(S1, &ip("10.0.0.1")), None);
        assert!(table.remove_route(S1, &net("10.0.0.0/8")).is_none());
        assert!(table.routes(S1).is_empty());
    }

    #[test]
    fn test_invalidation_is_per_switch() {
        let table = RouteTable::new();
        table.add_route(S1, route("10.0.0.0/8", 2));
        table.add_route(S2, route("10.0.0.0/8", 4));
        table.resolve(S1, &ip("10.0.0.1"));
        table.resolve(S2, &ip("10.0.0.1"));

        table.invalidate(S1, &net("10.0.0.0/24"));
        assert_eq!(table.cached(S1, &ip("10.0.0.1")), None);
        assert!(table.cached(S2, &ip("10.0.0.1")).is_some());
    }

    #[test]
    fn test_cache_is_bounded_per_switch() {
        let table = RouteTable::with_cache_capacity(16);
        table.add_route(S1, route("10.0.0.0/8", 2));

        for i in 0..500u32 {
            let dest = ip(&format!("10.0.{}.{}", i / 256, i % 256));
            assert_eq!(table.resolve(S1, &dest).unwrap().egress_port, 2);
        }
        assert_eq!(table.cached_len(S1), 16);
        assert_eq!(table.stats().evicted, 500 - 16);

        // Newest bindings are kept, oldest evicted.
        assert!(table.cached(S1, &ip("10.0.1.243")).is_some());
        assert!(table.cached(S1, &ip("10.0.0.0")).is_none());

        // Invalidation keeps the eviction order consistent.
        table.invalidate(S1, &net("10.0.0.0/8"));
        assert_eq!(table.cached_len(S1), 0);
        table.resolve(S1, &ip("10.9.9.9"));
        assert_eq!(table.cached_len(S1), 1);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let table = RouteTable::with_cache_capacity(0);
        table.add_route(S1, route("10.0.0.0/8", 2));
        assert_eq!(table.resolve(S1, &ip("10.0.0.1")).unwrap().egress_port, 2);
        assert_eq!(table.cached_len(S1), 0);
    }
}
