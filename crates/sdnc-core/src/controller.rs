//! Controller facade.
//!
//! The `Controller` owns the flow rule manager, the policy evaluator and the
//! QoS arbiter, and runs the packet-in pipeline:
//!
//! classify -> table 0 security lookup -> evaluate -> admit -> install.
//!
//! Administrative calls are delegated to the owning component. Route and rule
//! removals invalidate the route cache for the affected destination before
//! they return. A route change also retires the pipeline-installed rules
//! under the changed network, so the next packet-in installs a rule for the
//! new next hop.

use crate::classify::{classify, ClassifiedPacket};
use crate::config::{ControllerConfig, DefaultAction};
use crate::error::{DropReason, FlowError, QosError};
use crate::flow::{
    Action, ControlAction, FlowEntry, FlowMatch, FlowRule, FlowRuleManager, FlowStats, LinkState,
    MatchField, Matcher, RuleOrigin,
};
use crate::ids::{PolicyHandle, RuleHandle, SwitchId};
use crate::policy::{ArpStats, ForwardingDecision, PolicyEvaluator, RouteEntry, RouteStats};
use crate::qos::{PortUsage, QosArbiter, QosPolicy, QosStats};
use crate::transport::Transport;
use parking_lot::Mutex;
use sdnc_types::{IpAddress, IpPrefix, MacAddress};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// End result of one packet-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ForwardingOutcome {
    /// Forwarded out of `egress_port`. `rule` is the flow rule now steering
    /// this traffic on the switch, if one was installed or already present.
    Forwarded {
        egress_port: u32,
        rule: Option<RuleHandle>,
    },
    /// ARP target resolved from the address-resolution cache.
    Resolved { link_addr: MacAddress },
    Dropped { reason: DropReason },
}

impl ForwardingOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, ForwardingOutcome::Forwarded { .. })
    }

    fn dropped(reason: DropReason) -> Self {
        ForwardingOutcome::Dropped { reason }
    }
}

impl fmt::Display for ForwardingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingOutcome::Forwarded { egress_port, .. } => write!(f, "forwarded({})", egress_port),
            ForwardingOutcome::Resolved { link_addr } => write!(f, "resolved({})", link_addr),
            ForwardingOutcome::Dropped { reason } => write!(f, "dropped({})", reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub packets_in: u64,
    pub forwarded: u64,
    pub resolved: u64,
    pub dropped: BTreeMap<String, u64>,
}

/// Snapshot of every component's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStats {
    pub pipeline: PipelineStats,
    pub flows: FlowStats,
    pub qos: QosStats,
    pub routes: RouteStats,
    pub arp: ArpStats,
}

pub struct Controller {
    config: ControllerConfig,
    flows: FlowRuleManager,
    evaluator: PolicyEvaluator,
    qos: QosArbiter,
    pipeline: Mutex<PipelineStats>,
}

impl Controller {
    pub fn new(config: ControllerConfig, transport: Arc<dyn Transport>) -> Self {
        let flows = FlowRuleManager::new(&config, transport);
        let qos = QosArbiter::new(config.low_tier_contention_threshold_mbps);
        let evaluator = PolicyEvaluator::with_route_cache_capacity(config.route_cache_capacity);
        Self {
            config,
            flows,
            evaluator,
            qos,
            pipeline: Mutex::new(PipelineStats::default()),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn flows(&self) -> &FlowRuleManager {
        &self.flows
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    pub fn qos(&self) -> &QosArbiter {
        &self.qos
    }

    /// Runs the full decision pipeline for a frame received on `in_port` of
    /// `switch_id`. Never fails: every problem degrades to a drop reason for
    /// this packet only.
    #[instrument(skip(self, frame), fields(switch = %switch_id, len = frame.len()))]
    pub async fn on_packet_in(&self, switch_id: SwitchId, in_port: u32, frame: &[u8]) -> ForwardingOutcome {
        let outcome = self.run_pipeline(switch_id, in_port, frame).await;
        let mut stats = self.pipeline.lock();
        stats.packets_in += 1;
        match outcome {
            ForwardingOutcome::Forwarded { .. } => stats.forwarded += 1,
            ForwardingOutcome::Resolved { .. } => stats.resolved += 1,
            ForwardingOutcome::Dropped { reason } => {
                *stats.dropped.entry(reason.to_string()).or_default() += 1;
            }
        }
        debug!(%outcome, "packet-in handled");
        outcome
    }

    async fn run_pipeline(&self, switch_id: SwitchId, in_port: u32, frame: &[u8]) -> ForwardingOutcome {
        let packet = match classify(switch_id, in_port, frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(switch = %switch_id, in_port, error = %e, "malformed packet dropped");
                return ForwardingOutcome::dropped(DropReason::Malformed);
            }
        };

        if self.config.learn_arp_senders {
            if let Some(arp) = &packet.arp {
                self.evaluator.arp().learn(arp.sender_ip, arp.sender_mac);
            }
        }

        if let Some(entry) = self.flows.lookup(switch_id, &packet, 0).await {
            if entry.rule.is_drop() {
                debug!(switch = %switch_id, rule = %entry.handle, "matched drop rule");
                return ForwardingOutcome::dropped(DropReason::PolicyDrop);
            }
        }

        let decision = match self.evaluator.evaluate(&packet) {
            ForwardingDecision::NoDecision => match self.config.default_action {
                DefaultAction::Drop => return ForwardingOutcome::dropped(DropReason::PolicyDrop),
                DefaultAction::Forward(port) => ForwardingDecision::Forward {
                    egress_port: port,
                    network: None,
                },
            },
            ForwardingDecision::Resolve { link_addr } => {
                return ForwardingOutcome::Resolved { link_addr };
            }
            ForwardingDecision::Drop { reason } => return ForwardingOutcome::dropped(reason),
            forward @ ForwardingDecision::Forward { .. } => forward,
        };

        if !self.flows.accepts_installs(switch_id).await {
            return ForwardingOutcome::dropped(DropReason::TransportUnavailable);
        }

        let admitted = match self.qos.admit(&packet, decision) {
            Ok(a) => a,
            Err(dropped) => return ForwardingOutcome::dropped(dropped.reason),
        };

        let ForwardingDecision::Forward { egress_port, network } = admitted.decision else {
            return ForwardingOutcome::dropped(DropReason::PolicyDrop);
        };
        let Some(network) = network else {
            return ForwardingOutcome::Forwarded {
                egress_port,
                rule: None,
            };
        };

        let result = match self.install_forward(switch_id, network, egress_port).await {
            Err(FlowError::Conflict { existing }) => self
                .refresh_forward(switch_id, existing, network, egress_port)
                .await
                .map(|()| existing),
            other => other,
        };
        match result {
            Ok(handle) => ForwardingOutcome::Forwarded {
                egress_port,
                rule: Some(handle),
            },
            Err(e) => {
                warn!(switch = %switch_id, %network, error = %e, "packet-triggered install failed");
                self.qos.release(switch_id, &admitted);
                ForwardingOutcome::dropped(DropReason::TransportUnavailable)
            }
        }
    }

    fn forward_rule(&self, network: IpPrefix, egress_port: u32) -> FlowRule {
        let mut rule = FlowRule::new(FlowMatch::new().with(MatchField::DstAddr, Matcher::Prefix(network)))
            .with_action(Action::output(egress_port))
            .with_priority(self.config.packet_in_priority);
        if let Some(idle) = self.config.packet_in_idle_timeout() {
            rule = rule.with_idle_timeout(idle);
        }
        rule
    }

    async fn install_forward(
        &self,
        switch_id: SwitchId,
        network: IpPrefix,
        egress_port: u32,
    ) -> Result<RuleHandle, FlowError> {
        self.flows
            .add_rule_with_origin(switch_id, self.forward_rule(network, egress_port), RuleOrigin::PacketIn)
            .await
    }

    /// Points an already installed pipeline rule at `egress_port` when it
    /// steers elsewhere. Operator rules are left alone.
    async fn refresh_forward(
        &self,
        switch_id: SwitchId,
        handle: RuleHandle,
        network: IpPrefix,
        egress_port: u32,
    ) -> Result<(), FlowError> {
        let Some(entry) = self.flows.rule(switch_id, handle).await else {
            return Ok(());
        };
        if entry.origin != RuleOrigin::PacketIn || entry.rule.actions == [Action::output(egress_port)] {
            return Ok(());
        }
        debug!(switch = %switch_id, rule = %handle, egress_port, "repointing stale forward rule");
        self.flows
            .modify_rule(switch_id, handle, self.forward_rule(network, egress_port))
            .await
    }

    pub async fn add_rule(&self, switch_id: SwitchId, rule: FlowRule) -> Result<RuleHandle, FlowError> {
        self.flows.add_rule(switch_id, rule).await
    }

    pub async fn modify_rule(
        &self,
        switch_id: SwitchId,
        handle: RuleHandle,
        new_rule: FlowRule,
    ) -> Result<(), FlowError> {
        let previous = self.rule_destination(switch_id, handle).await;
        let result = self.flows.modify_rule(switch_id, handle, new_rule).await;
        if !matches!(result, Err(FlowError::NotFound(_)) | Err(FlowError::Validation(_))) {
            if let Some(network) = previous {
                self.evaluator.routes().invalidate(switch_id, &network);
            }
        }
        result
    }

    /// Removes a rule. Cached route bindings for the rule's destination are
    /// dropped whenever the store no longer holds it.
    pub async fn remove_rule(&self, switch_id: SwitchId, handle: RuleHandle) -> Result<(), FlowError> {
        let destination = self.rule_destination(switch_id, handle).await;
        let result = self.flows.remove_rule(switch_id, handle).await;
        if !matches!(result, Err(FlowError::NotFound(_))) {
            if let Some(network) = destination {
                self.evaluator.routes().invalidate(switch_id, &network);
            }
        }
        result
    }

    async fn rule_destination(&self, switch_id: SwitchId, handle: RuleHandle) -> Option<IpPrefix> {
        self.flows
            .rule(switch_id, handle)
            .await
            .and_then(|e| e.rule.flow_match.destination())
    }

    /// Expires timed-out rules and drops cached bindings for their
    /// destinations.
    pub async fn expire_rules(&self, switch_id: SwitchId, now: Instant) -> Vec<RuleHandle> {
        let before = self.flows.rules(switch_id).await;
        let expired = self.flows.expire_rules(switch_id, now).await;
        for entry in before.iter().filter(|e| expired.contains(&e.handle)) {
            if let Some(network) = entry.rule.flow_match.destination() {
                self.evaluator.routes().invalidate(switch_id, &network);
            }
        }
        expired
    }

    /// Removes every rule of a switch and drops cached bindings for their
    /// destinations.
    pub async fn clear_rules(&self, switch_id: SwitchId) -> Result<usize, FlowError> {
        let before = self.flows.rules(switch_id).await;
        let result = self.flows.clear_rules(switch_id).await;
        for network in before.iter().filter_map(|e| e.rule.flow_match.destination()) {
            self.evaluator.routes().invalidate(switch_id, &network);
        }
        result
    }

    pub async fn record_flow_stats(
        &self,
        switch_id: SwitchId,
        handle: RuleHandle,
        packets: u64,
        bytes: u64,
    ) -> Result<(), FlowError> {
        self.flows
            .record_flow_stats(switch_id, handle, packets, bytes, Instant::now())
            .await
    }

    pub async fn switch_connected(&self, switch_id: SwitchId) -> Result<usize, FlowError> {
        self.flows.switch_connected(switch_id).await
    }

    pub async fn switch_disconnected(&self, switch_id: SwitchId) {
        self.flows.switch_disconnected(switch_id).await
    }

    pub async fn resync(&self, switch_id: SwitchId) -> Result<usize, FlowError> {
        self.flows.resync(switch_id).await
    }

    pub async fn unconfirmed_actions(&self, switch_id: SwitchId) -> Vec<ControlAction> {
        self.flows.unconfirmed_actions(switch_id).await
    }

    pub async fn link_state(&self, switch_id: SwitchId) -> Option<LinkState> {
        self.flows.link_state(switch_id).await
    }

    pub async fn rules(&self, switch_id: SwitchId) -> Vec<FlowEntry> {
        self.flows.rules(switch_id).await
    }

    pub async fn exists(&self, switch_id: SwitchId, flow_match: &FlowMatch, table_id: u8) -> bool {
        self.flows.exists(switch_id, flow_match, table_id).await
    }

    /// First rule of `table_id` that accepts `packet`, in evaluation order.
    pub async fn lookup(&self, packet: &ClassifiedPacket, table_id: u8) -> Option<FlowEntry> {
        self.flows.lookup(packet.source_switch, packet, table_id).await
    }

    pub fn add_qos_policy(&self, switch_id: SwitchId, policy: QosPolicy) -> Result<PolicyHandle, QosError> {
        self.qos.add_policy(switch_id, policy)
    }

    pub fn modify_qos_policy(
        &self,
        switch_id: SwitchId,
        handle: PolicyHandle,
        policy: QosPolicy,
    ) -> Result<QosPolicy, QosError> {
        self.qos.modify_policy(switch_id, handle, policy)
    }

    pub fn remove_qos_policy(&self, switch_id: SwitchId, handle: PolicyHandle) -> Result<QosPolicy, QosError> {
        self.qos.remove_policy(switch_id, handle)
    }

    /// Current usage per port of a switch, in Mbps.
    pub fn bandwidth_usage(&self, switch_id: SwitchId) -> BTreeMap<u32, f64> {
        self.qos.bandwidth_usage(switch_id)
    }

    pub fn port_usage(&self, switch_id: SwitchId, port: u32) -> Option<PortUsage> {
        self.qos.port_usage(switch_id, port)
    }

    pub fn record_port_usage(&self, switch_id: SwitchId, port: u32, mbps: f64) -> Result<(), QosError> {
        self.qos.record_port_usage(switch_id, port, mbps)
    }

    pub fn add_static_arp(&self, ip: IpAddress, mac: MacAddress) {
        self.evaluator.arp().insert_static(ip, mac)
    }

    pub fn learn_arp(&self, ip: IpAddress, mac: MacAddress) -> bool {
        self.evaluator.arp().learn(ip, mac)
    }

    pub fn forget_arp(&self, ip: &IpAddress) -> bool {
        self.evaluator.arp().forget(ip).is_some()
    }

    /// Adds or replaces a route. Pipeline-installed rules whose destination
    /// overlaps the route's network are removed.
    #[instrument(skip(self, route), fields(switch = %switch_id, network = %route.destination_network))]
    pub async fn add_route(&self, switch_id: SwitchId, route: RouteEntry) -> Option<RouteEntry> {
        let previous = self.evaluator.routes().add_route(switch_id, route);
        self.retire_forward_rules(switch_id, &route.destination_network).await;
        previous
    }

    #[instrument(skip(self), fields(switch = %switch_id))]
    pub async fn remove_route(&self, switch_id: SwitchId, network: &IpPrefix) -> Option<RouteEntry> {
        let removed = self.evaluator.routes().remove_route(switch_id, network)?;
        self.retire_forward_rules(switch_id, network).await;
        Some(removed)
    }

    /// Removes pipeline-installed rules whose destination overlaps `network`.
    async fn retire_forward_rules(&self, switch_id: SwitchId, network: &IpPrefix) {
        let stale: Vec<RuleHandle> = self
            .flows
            .rules(switch_id)
            .await
            .into_iter()
            .filter(|e| e.origin == RuleOrigin::PacketIn)
            .filter(|e| e.rule.flow_match.destination().map_or(false, |d| d.overlaps(network)))
            .map(|e| e.handle)
            .collect();
        for handle in stale {
            match self.remove_rule(switch_id, handle).await {
                Ok(()) | Err(FlowError::NotFound(_)) => {}
                Err(e) => {
                    warn!(switch = %switch_id, rule = %handle, error = %e, "stale forward rule removal not acknowledged")
                }
            }
        }
    }

    pub fn routes(&self, switch_id: SwitchId) -> Vec<RouteEntry> {
        self.evaluator.routes().routes(switch_id)
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            pipeline: self.pipeline.lock().clone(),
            flows: self.flows.stats(),
            qos: self.qos.stats(),
            routes: self.evaluator.routes().stats(),
            arp: self.evaluator.arp().stats(),
        }
    }

    /// Idle timeout applied to pipeline-installed rules.
    pub fn packet_in_idle_timeout(&self) -> Option<Duration> {
        self.config.packet_in_idle_timeout()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("flows", &self.flows)
            .field("qos", &self.qos)
            .finish()
    }
}
