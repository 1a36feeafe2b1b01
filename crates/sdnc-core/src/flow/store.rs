//! Per-switch flow table storage.
//!
//! A [`FlowTable`] is the authoritative record of what should be installed on
//! one switch. Entries are ordered by `(table_id, priority desc, insertion)`,
//! which is also the switch's evaluation order. The table is only mutated by
//! the flow rule manager while it holds the switch's exclusive section.

use super::types::{FlowMatch, FlowRule, RuleKey};
use crate::classify::ClassifiedPacket;
use crate::ids::RuleHandle;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// Delivery state of a stored rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Handed to the transport, not yet acknowledged.
    Pending,
    Confirmed,
    /// Not acknowledged (failure, timeout or disconnect); safe to resend.
    Unconfirmed,
}

/// Who asked for the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOrigin {
    Admin,
    PacketIn,
}

/// A stored rule with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEntry {
    pub handle: RuleHandle,
    pub rule: FlowRule,
    /// Effective priority (the rule's own, or the configured default).
    pub priority: u16,
    pub origin: RuleOrigin,
    pub sync: SyncState,
    pub installed_at: Instant,
    pub last_hit: Instant,
    pub packet_count: u64,
    pub byte_count: u64,
    seq: u64,
}

impl FlowEntry {
    /// True once the hard timeout has elapsed since installation, or the
    /// idle timeout since the last hit.
    pub fn is_expired(&self, now: Instant) -> bool {
        let hard = self
            .rule
            .hard_timeout
            .is_some_and(|t| now.saturating_duration_since(self.installed_at) >= t);
        let idle = self
            .rule
            .idle_timeout
            .is_some_and(|t| now.saturating_duration_since(self.last_hit) >= t);
        hard || idle
    }
}

type OrderKey = (u8, Reverse<u16>, u64);

fn order_key(entry: &FlowEntry) -> OrderKey {
    (entry.rule.table_id, Reverse(entry.priority), entry.seq)
}

#[derive(Debug, Default)]
pub struct FlowTable {
    entries: HashMap<RuleHandle, FlowEntry>,
    order: BTreeMap<OrderKey, RuleHandle>,
    keys: HashMap<RuleKey, RuleHandle>,
    next_seq: u64,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handle: RuleHandle) -> Option<&FlowEntry> {
        self.entries.get(&handle)
    }

    pub(crate) fn get_mut(&mut self, handle: RuleHandle) -> Option<&mut FlowEntry> {
        self.entries.get_mut(&handle)
    }

    /// Handle of the active rule with the same identity, if any.
    pub fn conflict(&self, rule: &FlowRule, priority: u16) -> Option<RuleHandle> {
        self.keys.get(&RuleKey::new(rule, priority)).copied()
    }

    /// Whether any rule in `table_id` has this match, at any priority.
    pub fn exists(&self, flow_match: &FlowMatch, table_id: u8) -> bool {
        let canonical = flow_match.canonical();
        self.entries()
            .any(|e| e.rule.table_id == table_id && e.rule.flow_match.canonical() == canonical)
    }

    /// Inserts a new entry at the end of its priority band.
    ///
    /// Returns the existing handle if an identical rule is already active;
    /// the table is left untouched in that case.
    pub(crate) fn insert(
        &mut self,
        handle: RuleHandle,
        rule: FlowRule,
        priority: u16,
        origin: RuleOrigin,
        now: Instant,
    ) -> Result<(), RuleHandle> {
        let key = RuleKey::new(&rule, priority);
        if let Some(existing) = self.keys.get(&key) {
            return Err(*existing);
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = FlowEntry {
            handle,
            rule,
            priority,
            origin,
            sync: SyncState::Pending,
            installed_at: now,
            last_hit: now,
            packet_count: 0,
            byte_count: 0,
            seq,
        };
        self.order.insert(order_key(&entry), handle);
        self.keys.insert(key, handle);
        self.entries.insert(handle, entry);
        Ok(())
    }

    /// Replaces the rule behind `handle`, keeping its insertion slot.
    ///
    /// Returns the previous rule and priority, `None` if the handle is unknown.
    /// The caller must have checked the new identity for conflicts.
    pub(crate) fn replace(
        &mut self,
        handle: RuleHandle,
        rule: FlowRule,
        priority: u16,
        now: Instant,
    ) -> Option<(FlowRule, u16)> {
        let entry = self.entries.get_mut(&handle)?;

        self.order.remove(&order_key(entry));
        self.keys.remove(&RuleKey::new(&entry.rule, entry.priority));

        let old_rule = std::mem::replace(&mut entry.rule, rule);
        let old_priority = std::mem::replace(&mut entry.priority, priority);
        entry.sync = SyncState::Pending;
        entry.installed_at = now;
        entry.last_hit = now;
        entry.packet_count = 0;
        entry.byte_count = 0;

        self.order.insert(order_key(entry), handle);
        self.keys.insert(RuleKey::new(&entry.rule, entry.priority), handle);
        Some((old_rule, old_priority))
    }

    pub(crate) fn remove(&mut self, handle: RuleHandle) -> Option<FlowEntry> {
        let entry = self.entries.remove(&handle)?;
        self.order.remove(&order_key(&entry));
        self.keys.remove(&RuleKey::new(&entry.rule, entry.priority));
        Some(entry)
    }

    /// Entries in evaluation order.
    pub fn entries(&self) -> impl Iterator<Item = &FlowEntry> {
        self.order.values().filter_map(|h| self.entries.get(h))
    }

    /// First entry of `table_id` whose match accepts `packet`.
    pub fn lookup(&self, table_id: u8, packet: &ClassifiedPacket) -> Option<&FlowEntry> {
        let start = (table_id, Reverse(u16::MAX), 0);
        let end = (table_id, Reverse(0), u64::MAX);
        self.order
            .range(start..=end)
            .filter_map(|(_, h)| self.entries.get(h))
            .find(|e| e.rule.flow_match.matches(packet))
    }

    pub(crate) fn mark_all(&mut self, state: SyncState) {
        for entry in self.entries.values_mut() {
            entry.sync = state;
        }
    }
}
