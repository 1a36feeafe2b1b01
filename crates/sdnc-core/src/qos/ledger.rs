//! Per-port bandwidth accounting, in Mbps.

use super::types::PriorityTier;
use std::collections::BTreeMap;

/// Usage recorded against one switch port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortUsage {
    by_tier: [f64; 4],
    /// Traffic admitted without a governing policy, and collector samples.
    unclassified: f64,
}

impl PortUsage {
    pub fn total(&self) -> f64 {
        self.by_tier.iter().sum::<f64>() + self.unclassified
    }

    pub fn tier(&self, tier: PriorityTier) -> f64 {
        self.by_tier[tier.index()]
    }

    pub fn unclassified(&self) -> f64 {
        self.unclassified
    }

    /// Combined usage of the tiers that outrank `low`.
    pub fn contention(&self) -> f64 {
        self.tier(PriorityTier::Critical) + self.tier(PriorityTier::High) + self.tier(PriorityTier::Medium)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BandwidthLedger {
    ports: BTreeMap<u32, PortUsage>,
}

impl BandwidthLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self, port: u32) -> Option<&PortUsage> {
        self.ports.get(&port)
    }

    /// Adds `mbps` to `port` under `tier`, or the unclassified bucket.
    pub fn charge(&mut self, port: u32, tier: Option<PriorityTier>, mbps: f64) {
        let usage = self.ports.entry(port).or_default();
        match tier {
            Some(t) => usage.by_tier[t.index()] += mbps,
            None => usage.unclassified += mbps,
        }
    }

    /// Takes back a charge made by [`charge`](Self::charge). Usage never
    /// drops below zero, since a sample may have replaced the charge.
    pub fn refund(&mut self, port: u32, tier: Option<PriorityTier>, mbps: f64) {
        let Some(usage) = self.ports.get_mut(&port) else {
            return;
        };
        let bucket = match tier {
            Some(t) => &mut usage.by_tier[t.index()],
            None => &mut usage.unclassified,
        };
        *bucket = (*bucket - mbps).max(0.0);
    }

    /// Replaces the port's usage with an externally measured sample.
    pub fn overwrite(&mut self, port: u32, mbps: f64) {
        self.ports.insert(
            port,
            PortUsage {
                by_tier: [0.0; 4],
                unclassified: mbps,
            },
        );
    }

    pub fn totals(&self) -> BTreeMap<u32, f64> {
        self.ports.iter().map(|(port, u)| (*port, u.total())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_charge_by_tier() {
        let mut ledger = BandwidthLedger::new();
        ledger.charge(2, Some(PriorityTier::High), 10.0);
        ledger.charge(2, Some(PriorityTier::Low), 5.0);
        ledger.charge(2, None, 1.0);

        let usage = ledger.port(2).unwrap();
        assert_eq!(usage.total(), 16.0);
        assert_eq!(usage.contention(), 10.0);
        assert_eq!(usage.tier(PriorityTier::Low), 5.0);
        assert_eq!(usage.unclassified(), 1.0);
    }

    #[test]
    fn test_overwrite_resets_breakdown() {
        let mut ledger = BandwidthLedger::new();
        ledger.charge(2, Some(PriorityTier::Critical), 30.0);
        ledger.overwrite(2, 12.5);

        let usage = ledger.port(2).unwrap();
        assert_eq!(usage.total(), 12.5);
        assert_eq!(usage.contention(), 0.0);
        assert_eq!(ledger.totals().get(&2), Some(&12.5));
        assert!(ledger.port(3).is_none());
    }

    #[test]
    fn test_refund_clamps_at_zero() {
        let mut ledger = BandwidthLedger::new();
        ledger.charge(2, Some(PriorityTier::High), 10.0);
        ledger.charge(2, None, 4.0);

        ledger.refund(2, Some(PriorityTier::High), 3.0);
        assert_eq!(ledger.port(2).unwrap().tier(PriorityTier::High), 7.0);

        ledger.overwrite(2, 1.0);
        ledger.refund(2, None, 4.0);
        assert_eq!(ledger.port(2).unwrap().total(), 0.0);

        ledger.refund(9, None, 1.0);
        assert!(ledger.port(9).is_none());
    }
}
