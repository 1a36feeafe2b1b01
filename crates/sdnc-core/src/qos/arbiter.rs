//! QoS admission.
//!
//! For a forwarding decision, the arbiter finds the highest-tier policy on
//! the switch whose selector matches the packet and admits or throttles it
//! against the egress port's ledger. The decision and the ledger charge
//! happen under the switch's lock, so a fixed ledger state always yields the
//! same outcome and nothing is admitted without being recorded.

use super::ledger::{BandwidthLedger, PortUsage};
use super::types::{PriorityTier, QosPolicy};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::classify::ClassifiedPacket;
use crate::error::{DropReason, Dropped, QosError, ValidationError};
use crate::ids::{HandleAllocator, PolicyHandle, SwitchId};
use crate::policy::ForwardingDecision;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const SOURCE: &str = "QosArbiter";

/// Converts a frame length to the Mbps charged for it.
pub fn frame_mbps(frame_len: usize) -> f64 {
    frame_len as f64 * 8.0 / 1_000_000.0
}

/// A decision that passed admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmittedAction {
    pub decision: ForwardingDecision,
    /// Governing policy, `None` when default-admitted.
    pub policy: Option<PolicyHandle>,
    pub tier: Option<PriorityTier>,
    pub charged_mbps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QosStats {
    pub admitted: u64,
    pub throttled: u64,
    pub default_admitted: u64,
    pub policies_added: u64,
    pub policies_removed: u64,
    pub policies_modified: u64,
    /// Admissions whose charge was taken back.
    pub released: u64,
}

#[derive(Debug, Default)]
struct SwitchQos {
    policies: BTreeMap<PolicyHandle, QosPolicy>,
    ledger: BandwidthLedger,
}

impl SwitchQos {
    /// Fails if a policy other than `skip` shares `policy`'s tier and has an
    /// overlapping selector.
    fn check_unambiguous(&self, policy: &QosPolicy, skip: Option<PolicyHandle>) -> Result<(), ValidationError> {
        match self.policies.iter().find(|(h, p)| {
            Some(**h) != skip
                && p.priority_tier == policy.priority_tier
                && p.selector.overlaps(&policy.selector)
        }) {
            Some((existing, _)) => Err(ValidationError::AmbiguousSelector { existing: *existing }),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct QosArbiter {
    switches: DashMap<SwitchId, Arc<Mutex<SwitchQos>>>,
    handles: HandleAllocator,
    low_tier_threshold_mbps: Option<f64>,
    stats: Mutex<QosStats>,
}

impl QosArbiter {
    /// `low_tier_threshold_mbps` unset means low-tier traffic is never
    /// throttled for contention.
    pub fn new(low_tier_threshold_mbps: Option<f64>) -> Self {
        Self {
            switches: DashMap::new(),
            handles: HandleAllocator::new(),
            low_tier_threshold_mbps,
            stats: Mutex::new(QosStats::default()),
        }
    }

    fn slot(&self, switch_id: SwitchId) -> Arc<Mutex<SwitchQos>> {
        self.switches.entry(switch_id).or_default().value().clone()
    }

    fn existing(&self, switch_id: SwitchId) -> Option<Arc<Mutex<SwitchQos>>> {
        self.switches.get(&switch_id).map(|s| s.value().clone())
    }

    pub fn stats(&self) -> QosStats {
        self.stats.lock().clone()
    }

    /// Adds a policy. Rejected if another policy of the same tier on the
    /// switch has an overlapping selector.
    pub fn add_policy(&self, switch_id: SwitchId, policy: QosPolicy) -> Result<PolicyHandle, QosError> {
        let slot = self.slot(switch_id);
        let mut state = slot.lock();

        if let Err(e) = policy.validate().and_then(|()| state.check_unambiguous(&policy, None)) {
            audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, SOURCE, "add_policy")
                .with_object_id(switch_id.to_string())
                .with_object_type("qos_policy")
                .with_error(e.to_string()));
            return Err(e.into());
        }

        let handle = self.handles.next_policy();
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, SOURCE, "add_policy")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(handle.to_string())
            .with_object_type("qos_policy")
            .with_details(serde_json::json!({
                "switch": switch_id.to_string(),
                "tier": policy.priority_tier.to_string(),
                "ceiling_mbps": policy.bandwidth_ceiling_mbps,
            })));
        state.policies.insert(handle, policy);
        self.stats.lock().policies_added += 1;
        Ok(handle)
    }

    /// Replaces the policy behind `handle`, keeping the handle. The new
    /// policy must not overlap another policy of its tier.
    pub fn modify_policy(
        &self,
        switch_id: SwitchId,
        handle: PolicyHandle,
        policy: QosPolicy,
    ) -> Result<QosPolicy, QosError> {
        let slot = self.existing(switch_id).ok_or(QosError::NotFound(handle))?;
        let mut state = slot.lock();
        if !state.policies.contains_key(&handle) {
            return Err(QosError::NotFound(handle));
        }

        if let Err(e) = policy
            .validate()
            .and_then(|()| state.check_unambiguous(&policy, Some(handle)))
        {
            audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, SOURCE, "modify_policy")
                .with_object_id(handle.to_string())
                .with_object_type("qos_policy")
                .with_error(e.to_string()));
            return Err(e.into());
        }

        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, SOURCE, "modify_policy")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(handle.to_string())
            .with_object_type("qos_policy")
            .with_details(serde_json::json!({
                "switch": switch_id.to_string(),
                "tier": policy.priority_tier.to_string(),
                "ceiling_mbps": policy.bandwidth_ceiling_mbps,
            })));
        let previous = state.policies.insert(handle, policy);
        self.stats.lock().policies_modified += 1;
        previous.ok_or(QosError::NotFound(handle))
    }

    pub fn remove_policy(&self, switch_id: SwitchId, handle: PolicyHandle) -> Result<QosPolicy, QosError> {
        let removed = self
            .existing(switch_id)
            .and_then(|slot| slot.lock().policies.remove(&handle));
        match removed {
            Some(policy) => {
                self.stats.lock().policies_removed += 1;
                audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, SOURCE, "remove_policy")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(handle.to_string())
                    .with_object_type("qos_policy"));
                Ok(policy)
            }
            None => Err(QosError::NotFound(handle)),
        }
    }

    pub fn policies(&self, switch_id: SwitchId) -> Vec<(PolicyHandle, QosPolicy)> {
        self.existing(switch_id)
            .map(|slot| {
                slot.lock()
                    .policies
                    .iter()
                    .map(|(h, p)| (*h, p.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Admits or throttles `decision` for `packet`. Only forwarding decisions
    /// consume bandwidth; every other decision passes through unchanged.
    pub fn admit(
        &self,
        packet: &ClassifiedPacket,
        decision: ForwardingDecision,
    ) -> Result<AdmittedAction, Dropped> {
        let ForwardingDecision::Forward { egress_port, .. } = decision else {
            return Ok(AdmittedAction {
                decision,
                policy: None,
                tier: None,
                charged_mbps: 0.0,
            });
        };

        let switch_id = packet.source_switch;
        let mbps = frame_mbps(packet.frame_len);
        let slot = self.slot(switch_id);
        let mut state = slot.lock();

        let governing = state
            .policies
            .iter()
            .filter(|(_, p)| p.selector.matches(packet, egress_port))
            .max_by_key(|(_, p)| p.priority_tier)
            .map(|(h, p)| (*h, p.priority_tier, p.bandwidth_ceiling_mbps));

        let Some((handle, tier, ceiling)) = governing else {
            state.ledger.charge(egress_port, None, mbps);
            self.stats.lock().default_admitted += 1;
            return Ok(AdmittedAction {
                decision,
                policy: None,
                tier: None,
                charged_mbps: mbps,
            });
        };

        let usage = state.ledger.port(egress_port).cloned().unwrap_or_default();
        if !self.allows(tier, ceiling, &usage) {
            self.stats.lock().throttled += 1;
            debug!(
                switch = %switch_id,
                port = egress_port,
                policy = %handle,
                %tier,
                usage_mbps = usage.total(),
                "throttled"
            );
            return Err(Dropped::new(DropReason::QosThrottled));
        }

        state.ledger.charge(egress_port, Some(tier), mbps);
        self.stats.lock().admitted += 1;
        Ok(AdmittedAction {
            decision,
            policy: Some(handle),
            tier: Some(tier),
            charged_mbps: mbps,
        })
    }

    /// Takes back the charge of an admission whose forwarding never
    /// happened.
    pub fn release(&self, switch_id: SwitchId, admitted: &AdmittedAction) {
        let ForwardingDecision::Forward { egress_port, .. } = admitted.decision else {
            return;
        };
        if admitted.charged_mbps <= 0.0 {
            return;
        }
        if let Some(slot) = self.existing(switch_id) {
            slot.lock()
                .ledger
                .refund(egress_port, admitted.tier, admitted.charged_mbps);
            self.stats.lock().released += 1;
        }
    }

    fn allows(&self, tier: PriorityTier, ceiling: Option<f64>, usage: &PortUsage) -> bool {
        match tier {
            PriorityTier::Critical | PriorityTier::High => true,
            PriorityTier::Medium => ceiling.map_or(true, |c| usage.total() < c),
            PriorityTier::Low => self
                .low_tier_threshold_mbps
                .map_or(true, |threshold| usage.contention() <= threshold),
        }
    }

    /// Current usage per port of a switch, in Mbps.
    pub fn bandwidth_usage(&self, switch_id: SwitchId) -> BTreeMap<u32, f64> {
        self.existing(switch_id)
            .map(|slot| slot.lock().ledger.totals())
            .unwrap_or_default()
    }

    pub fn port_usage(&self, switch_id: SwitchId, port: u32) -> Option<PortUsage> {
        self.existing(switch_id)?.lock().ledger.port(port).cloned()
    }

    /// Replaces a port's usage with a sample from the statistics collector.
    /// Negative and non-finite samples are rejected.
    pub fn record_port_usage(&self, switch_id: SwitchId, port: u32, mbps: f64) -> Result<(), QosError> {
        if !mbps.is_finite() || mbps < 0.0 {
            return Err(ValidationError::InvalidUsage(mbps).into());
        }
        self.slot(switch_id).lock().ledger.overwrite(port, mbps);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, testing};
    use crate::qos::types::{PortRange, TrafficSelector};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    const S1: SwitchId = SwitchId::new(1);

    fn packet(dst_port: u16) -> ClassifiedPacket {
        classify(
            S1,
            1,
            &testing::ipv4_udp(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(172, 16, 0, 1), 4000, dst_port, 100),
        )
        .unwrap()
    }

    fn forward(port: u32) -> ForwardingDecision {
        ForwardingDecision::Forward {
            egress_port: port,
            network: None,
        }
    }

    #[test]
    fn test_default_admit_records_unclassified() {
        let arbiter = QosArbiter::new(None);
        let pkt = packet(80);
        let admitted = arbiter.admit(&pkt, forward(2)).unwrap();

        assert_eq!(admitted.policy, None);
        assert_eq!(admitted.charged_mbps, frame_mbps(pkt.frame_len));
        assert_eq!(
            arbiter.port_usage(S1, 2).unwrap().unclassified(),
            frame_mbps(pkt.frame_len)
        );
        assert_eq!(arbiter.stats().default_admitted, 1);
    }

    #[test]
    fn test_non_forward_passes_through() {
        let arbiter = QosArbiter::new(Some(0.0));
        let drop = ForwardingDecision::Drop {
            reason: DropReason::NoRoute,
        };
        let admitted = arbiter.admit(&packet(80), drop).unwrap();
        assert_eq!(admitted.decision, drop);
        assert!(arbiter.bandwidth_usage(S1).is_empty());
    }

    #[test]
    fn test_ambiguous_policies_rejected() {
        let arbiter = QosArbiter::new(None);
        let first = arbiter
            .add_policy(
                S1,
                QosPolicy::new(
                    PriorityTier::Medium,
                    TrafficSelector::any().with_dest_ports(PortRange::new(80, 90)),
                ),
            )
            .unwrap();

        let err = arbiter
            .add_policy(
                S1,
                QosPolicy::new(
                    PriorityTier::Medium,
                    TrafficSelector::any().with_dest_ports(PortRange::single(85)),
                ),
            )
            .unwrap_err();
        assert_eq!(
            err,
            QosError::Validation(ValidationError::AmbiguousSelector { existing: first })
        );

        // Same selector at another tier, or on another switch, is fine.
        assert!(arbiter
            .add_policy(
                S1,
                QosPolicy::new(
                    PriorityTier::High,
                    TrafficSelector::any().with_dest_ports(PortRange::single(85)),
                ),
            )
            .is_ok());
        assert!(arbiter
            .add_policy(
                SwitchId::new(2),
                QosPolicy::new(
                    PriorityTier::Medium,
                    TrafficSelector::any().with_dest_ports(PortRange::single(85)),
                ),
            )
            .is_ok());
    }

    #[test]
    fn test_highest_tier_governs() {
        let arbiter = QosArbiter::new(None);
        arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Medium, TrafficSelector::any()).with_ceiling(1.0))
            .unwrap();
        let high = arbiter
            .add_policy(
                S1,
                QosPolicy::new(
                    PriorityTier::High,
                    TrafficSelector::any().with_dest_ports(PortRange::single(5060)),
                ),
            )
            .unwrap();
        arbiter.record_port_usage(S1, 2, 100.0).unwrap();

        let admitted = arbiter.admit(&packet(5060), forward(2)).unwrap();
        assert_eq!(admitted.policy, Some(high));
        assert_eq!(admitted.tier, Some(PriorityTier::High));

        assert_eq!(
            arbiter.admit(&packet(80), forward(2)),
            Err(Dropped::new(DropReason::QosThrottled))
        );
    }

    #[test]
    fn test_medium_ceiling() {
        let arbiter = QosArbiter::new(None);
        arbiter
            .add_policy(
                S1,
                QosPolicy::new(PriorityTier::Medium, TrafficSelector::any().with_egress_port(2))
                    .with_ceiling(50.0),
            )
            .unwrap();

        arbiter.record_port_usage(S1, 2, 49.0).unwrap();
        assert!(arbiter.admit(&packet(80), forward(2)).is_ok());
        assert!(arbiter.bandwidth_usage(S1)[&2] > 49.0);

        arbiter.record_port_usage(S1, 2, 50.0).unwrap();
        assert_eq!(
            arbiter.admit(&packet(80), forward(2)),
            Err(Dropped::new(DropReason::QosThrottled))
        );
        assert_eq!(arbiter.bandwidth_usage(S1)[&2], 50.0);
        assert_eq!(arbiter.stats().throttled, 1);
    }

    #[test]
    fn test_low_tier_contention() {
        let arbiter = QosArbiter::new(Some(20.0));
        arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Low, TrafficSelector::any().with_dest_ports(PortRange::single(80))))
            .unwrap();
        arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Critical, TrafficSelector::any().with_dest_ports(PortRange::single(22))))
            .unwrap();

        // Unclassified traffic does not count as contention.
        arbiter.record_port_usage(S1, 2, 500.0).unwrap();
        assert!(arbiter.admit(&packet(80), forward(2)).is_ok());

        // Push critical usage above the threshold.
        let big = classify(
            S1,
            1,
            &testing::ipv4_udp(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(172, 16, 0, 1), 4000, 22, 1400),
        )
        .unwrap();
        while arbiter.port_usage(S1, 2).unwrap().contention() <= 20.0 {
            arbiter.admit(&big, forward(2)).unwrap();
        }
        assert_eq!(
            arbiter.admit(&packet(80), forward(2)),
            Err(Dropped::new(DropReason::QosThrottled))
        );
    }

    #[test]
    fn test_low_tier_without_threshold_always_admitted() {
        let arbiter = QosArbiter::new(None);
        arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Low, TrafficSelector::any()))
            .unwrap();
        arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Critical, TrafficSelector::any().with_egress_port(9)))
            .unwrap();
        arbiter.record_port_usage(S1, 2, 10_000.0).unwrap();
        assert!(arbiter.admit(&packet(80), forward(2)).is_ok());
    }

    #[test]
    fn test_admit_is_deterministic_for_fixed_ledger() {
        let arbiter = QosArbiter::new(None);
        arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Medium, TrafficSelector::any()).with_ceiling(10.0))
            .unwrap();
        for usage in [0.0, 9.99, 10.0, 11.0] {
            arbiter.record_port_usage(S1, 2, usage).unwrap();
            let first = arbiter.admit(&packet(80), forward(2)).is_ok();
            arbiter.record_port_usage(S1, 2, usage).unwrap();
            let second = arbiter.admit(&packet(80), forward(2)).is_ok();
            assert_eq!(first, second);
            assert_eq!(first, usage < 10.0);
        }
    }

    #[test]
    fn test_remove_policy() {
        let arbiter = QosArbiter::new(None);
        let handle = arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::High, TrafficSelector::any()))
            .unwrap();
        assert!(arbiter.remove_policy(S1, handle).is_ok());
        assert_eq!(arbiter.remove_policy(S1, handle), Err(QosError::NotFound(handle)));
        assert!(arbiter.policies(S1).is_empty());
    }

    #[test]
    fn test_release_refunds_charge() {
        let arbiter = QosArbiter::new(None);
        let high = arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::High, TrafficSelector::any().with_dest_ports(PortRange::single(22))))
            .unwrap();

        let default = arbiter.admit(&packet(80), forward(2)).unwrap();
        let governed = arbiter.admit(&packet(22), forward(2)).unwrap();
        assert_eq!(governed.policy, Some(high));
        assert!(arbiter.bandwidth_usage(S1)[&2] > 0.0);

        arbiter.release(S1, &default);
        arbiter.release(S1, &governed);
        assert_eq!(arbiter.bandwidth_usage(S1)[&2], 0.0);
        assert_eq!(arbiter.stats().released, 2);

        // Non-forwarding admissions carry no charge.
        let drop = arbiter
            .admit(&packet(80), ForwardingDecision::Drop { reason: DropReason::NoRoute })
            .unwrap();
        arbiter.release(S1, &drop);
        assert_eq!(arbiter.stats().released, 2);
    }

    #[test]
    fn test_modify_policy_keeps_handle() {
        let arbiter = QosArbiter::new(None);
        let web = arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Medium, TrafficSelector::any().with_dest_ports(PortRange::single(80))))
            .unwrap();
        let other = arbiter
            .add_policy(S1, QosPolicy::new(PriorityTier::Medium, TrafficSelector::any().with_dest_ports(PortRange::single(443))))
            .unwrap();

        // Replacing a policy's own selector is not an overlap with itself.
        let previous = arbiter
            .modify_policy(
                S1,
                web,
                QosPolicy::new(PriorityTier::Medium, TrafficSelector::any().with_dest_ports(PortRange::new(80, 90)))
                    .with_ceiling(5.0),
            )
            .unwrap();
        assert_eq!(previous.bandwidth_ceiling_mbps, None);
        let policies = arbiter.policies(S1);
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].0, web);
        assert_eq!(policies[0].1.bandwidth_ceiling_mbps, Some(5.0));

        assert_eq!(
            arbiter.modify_policy(
                S1,
                web,
                QosPolicy::new(PriorityTier::Medium, TrafficSelector::any().with_dest_ports(PortRange::new(400, 500))),
            ),
            Err(QosError::Validation(ValidationError::AmbiguousSelector { existing: other }))
        );
        assert!(matches!(
            arbiter.modify_policy(
                S1,
                web,
                QosPolicy::new(PriorityTier::Medium, TrafficSelector::any()).with_ceiling(-1.0),
            ),
            Err(QosError::Validation(ValidationError::InvalidCeiling(_)))
        ));

        arbiter.remove_policy(S1, other).unwrap();
        assert_eq!(
            arbiter.modify_policy(S1, other, QosPolicy::new(PriorityTier::Low, TrafficSelector::any())),
            Err(QosError::NotFound(other))
        );
        assert_eq!(arbiter.stats().policies_modified, 1);
    }

    #[test]
    fn test_rejects_bad_usage_samples() {
        let arbiter = QosArbiter::new(None);
        arbiter.record_port_usage(S1, 2, 12.0).unwrap();
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -1.0] {
            assert!(matches!(
                arbiter.record_port_usage(S1, 2, bad),
                Err(QosError::Validation(ValidationError::InvalidUsage(_)))
            ));
        }
        assert_eq!(arbiter.bandwidth_usage(S1)[&2], 12.0);
    }
}
