//! Identifiers for switches, installed rules and QoS policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier of a managed switch (its datapath id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchId(u64);

impl SwitchId {
    pub const fn new(dpid: u64) -> Self {
        SwitchId(dpid)
    }

    pub const fn dpid(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for SwitchId {
    fn from(dpid: u64) -> Self {
        SwitchId(dpid)
    }
}

/// Opaque handle to one installed flow rule.
///
/// Two structurally equal rules installed at different times carry different
/// handles; modify and remove always address a rule by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleHandle(u64);

impl RuleHandle {
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule-{}", self.0)
    }
}

/// Opaque handle to one QoS policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyHandle(u64);

impl PolicyHandle {
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PolicyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "policy-{}", self.0)
    }
}

/// Monotonic handle source. Handles are never reused.
#[derive(Debug)]
pub(crate) struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_rule(&self) -> RuleHandle {
        RuleHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_policy(&self) -> PolicyHandle {
        PolicyHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
