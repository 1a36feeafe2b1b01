//! Address-resolution cache (IP → link address).

use parking_lot::RwLock;
use sdnc_types::{IpAddress, MacAddress};
use std::collections::HashMap;
use tokio::time::Instant;

/// How a binding entered the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArpSource {
    /// Configured by an operator; never overwritten by learning.
    Static,
    /// Learned from the sender fields of observed ARP traffic.
    Learned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac: MacAddress,
    pub source: ArpSource,
    pub updated_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArpStats {
    pub entries_added: u64,
    pub entries_updated: u64,
    pub entries_removed: u64,
}

#[derive(Debug, Default)]
struct ArpState {
    entries: HashMap<IpAddress, ArpEntry>,
    stats: ArpStats,
}

impl ArpState {
    fn upsert(&mut self, ip: IpAddress, mac: MacAddress, source: ArpSource) {
        let entry = ArpEntry {
            mac,
            source,
            updated_at: Instant::now(),
        };
        if self.entries.insert(ip, entry).is_some() {
            self.stats.entries_updated = self.stats.entries_updated.saturating_add(1);
        } else {
            self.stats.entries_added = self.stats.entries_added.saturating_add(1);
        }
    }
}

#[derive(Debug, Default)]
pub struct ArpTable {
    state: RwLock<ArpState>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a static binding.
    pub fn insert_static(&self, ip: IpAddress, mac: MacAddress) {
        self.state.write().upsert(ip, mac, ArpSource::Static);
    }

    /// Records a learned binding. Returns false if a static binding for
    /// `ip` exists, or `mac` is not a unicast address.
    pub fn learn(&self, ip: IpAddress, mac: MacAddress) -> bool {
        if mac.is_multicast() || mac.is_zero() {
            return false;
        }
        // Static check and insert under one write guard, so a concurrent
        // insert_static cannot be overwritten.
        let mut state = self.state.write();
        if matches!(state.entries.get(&ip), Some(e) if e.source == ArpSource::Static) {
            return false;
        }
        state.upsert(ip, mac, ArpSource::Learned);
        true
    }

    pub fn forget(&self, ip: &IpAddress) -> Option<ArpEntry> {
        let mut state = self.state.write();
        let entry = state.entries.remove(ip)?;
        state.stats.entries_removed = state.stats.entries_removed.saturating_add(1);
        Some(entry)
    }

    pub fn resolve(&self, ip: &IpAddress) -> Option<MacAddress> {
        self.state.read().entries.get(ip).map(|e| e.mac)
    }

    pub fn get(&self, ip: &IpAddress) -> Option<ArpEntry> {
        self.state.read().entries.get(ip).copied()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    pub fn stats(&self) -> ArpStats {
        self.state.read().stats.clone()
    }
}
