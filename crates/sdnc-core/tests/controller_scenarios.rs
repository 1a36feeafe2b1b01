//! End-to-end tests for the controller core
//!
//! These drive the public API against a recording transport that stands in
//! for the switch connection.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use sdnc_core::classify::{classify, testing};
use sdnc_core::flow::{Action, ActionKind, ControlAction, FlowMatch, FlowRule, SyncState};
use sdnc_core::policy::{ForwardingDecision, RouteEntry};
use sdnc_core::qos::{frame_mbps, PriorityTier, QosPolicy, TrafficSelector};
use sdnc_core::{
    Ack, Controller, ControllerConfig, DropReason, FlowError, ForwardingOutcome, SwitchId,
    Transport, TransportError,
};
use sdnc_types::IpAddress;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const S1: SwitchId = SwitchId::new(1);
const S2: SwitchId = SwitchId::new(2);

/// Records every control action in send order.
#[derive(Default)]
struct MockTransport {
    sent: parking_lot::Mutex<Vec<(SwitchId, ControlAction)>>,
    failing: AtomicBool,
    stalled: AtomicBool,
    remove_first: bool,
}

impl MockTransport {
    fn remove_first() -> Self {
        Self {
            remove_first: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<ControlAction> {
        self.sent.lock().iter().map(|(_, a)| a.clone()).collect()
    }

    fn kinds(&self) -> Vec<ActionKind> {
        self.sent.lock().iter().map(|(_, a)| a.kind).collect()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_control_action(
        &self,
        switch_id: &SwitchId,
        action: &ControlAction,
    ) -> Result<Ack, TransportError> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("table full".to_string()));
        }
        self.sent.lock().push((*switch_id, action.clone()));
        Ok(Ack)
    }

    fn requires_remove_before_install(&self) -> bool {
        self.remove_first
    }
}

fn setup() -> (Arc<Controller>, Arc<MockTransport>) {
    setup_with(MockTransport::default())
}

fn setup_with(transport: MockTransport) -> (Arc<Controller>, Arc<MockTransport>) {
    let transport = Arc::new(transport);
    let controller = Arc::new(Controller::new(ControllerConfig::default(), transport.clone()));
    (controller, transport)
}

fn forward_rule(dest: &str, port: u32, priority: u16) -> FlowRule {
    FlowRule::new(FlowMatch::parse([("destAddr", dest)]).unwrap())
        .with_action(Action::output(port))
        .with_priority(priority)
}

fn udp_to(dst: Ipv4Addr) -> Vec<u8> {
    testing::ipv4_udp(Ipv4Addr::new(10, 0, 0, 1), dst, 4000, 80, 512)
}

fn route(network: &str, switch_id: SwitchId, port: u32) -> RouteEntry {
    RouteEntry::new(network.parse().unwrap(), switch_id, port)
}

#[tokio::test]
async fn scenario_a_duplicate_add_is_a_conflict() {
    let (ctl, transport) = setup();

    let first = ctl.add_rule(S1, forward_rule("172.16.0.1", 2, 10)).await.unwrap();
    let err = ctl.add_rule(S1, forward_rule("172.16.0.1", 2, 10)).await.unwrap_err();

    assert!(matches!(err, FlowError::Conflict { existing } if existing == first));
    assert_eq!(ctl.rules(S1).await.len(), 1);
    assert_eq!(transport.kinds(), vec![ActionKind::Install]);
}

#[tokio::test]
async fn scenario_b_medium_tier_ceiling() {
    let (ctl, _) = setup();
    ctl.add_route(S1, route("172.16.0.0/16", S1, 2)).await;
    ctl.add_qos_policy(
        S1,
        QosPolicy::new(PriorityTier::Medium, TrafficSelector::any().with_egress_port(2)).with_ceiling(50.0),
    )
    .unwrap();

    let frame = udp_to(Ipv4Addr::new(172, 16, 0, 1));
    ctl.record_port_usage(S1, 2, 49.0).unwrap();
    assert!(ctl.on_packet_in(S1, 1, &frame).await.is_forwarded());
    assert!(ctl.bandwidth_usage(S1)[&2] >= 49.0 + frame_mbps(frame.len()));

    ctl.record_port_usage(S1, 2, 50.0).unwrap();
    assert_eq!(
        ctl.on_packet_in(S1, 1, &frame).await,
        ForwardingOutcome::Dropped {
            reason: DropReason::QosThrottled
        }
    );
    assert_eq!(ctl.bandwidth_usage(S1)[&2], 50.0);
}

#[tokio::test]
async fn scenario_c_modify_emits_single_install() {
    let (ctl, transport) = setup();
    let handle = ctl.add_rule(S1, forward_rule("172.16.0.1", 1, 10)).await.unwrap();
    transport.clear();

    ctl.modify_rule(S1, handle, forward_rule("172.16.0.1", 2, 10)).await.unwrap();

    assert_eq!(ctl.rules(S1).await.len(), 1);
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, ActionKind::Install);
    assert_eq!(sent[0].actions, Some(vec![Action::output(2)]));
}

#[tokio::test]
async fn scenario_c_remove_before_install_transport() {
    let (ctl, transport) = setup_with(MockTransport::remove_first());
    let handle = ctl.add_rule(S1, forward_rule("172.16.0.1", 1, 10)).await.unwrap();
    transport.clear();

    ctl.modify_rule(S1, handle, forward_rule("172.16.0.1", 2, 10)).await.unwrap();

    assert_eq!(transport.kinds(), vec![ActionKind::Remove, ActionKind::Install]);
    let sent = transport.sent();
    assert_eq!(sent[0].actions, None);
    assert_eq!(sent[1].actions, Some(vec![Action::output(2)]));
    assert_eq!(ctl.rules(S1).await.len(), 1);
}

#[tokio::test]
async fn scenario_d_unresolvable_arp_is_dropped() {
    let (ctl, transport) = setup();
    let frame = testing::arp_request(
        [0x02, 0, 0, 0, 0, 1],
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 99),
    );

    let packet = classify(S1, 1, &frame).unwrap();
    assert_eq!(
        ctl.evaluator().evaluate(&packet),
        ForwardingDecision::Drop {
            reason: DropReason::UnresolvedArp
        }
    );
    assert_eq!(
        ctl.on_packet_in(S1, 1, &frame).await,
        ForwardingOutcome::Dropped {
            reason: DropReason::UnresolvedArp
        }
    );
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn scenario_e_reconnect_resends_before_new_installs() {
    let (ctl, transport) = setup();
    ctl.add_route(S1, route("192.168.0.0/16", S1, 4)).await;
    let a = ctl.add_rule(S1, forward_rule("172.16.0.1", 1, 10)).await.unwrap();
    let b = ctl.add_rule(S1, forward_rule("172.16.0.2", 2, 10)).await.unwrap();
    transport.clear();

    ctl.switch_disconnected(S1).await;
    assert!(ctl
        .rules(S1)
        .await
        .iter()
        .all(|e| e.sync == SyncState::Unconfirmed));

    let (resent, outcome) = tokio::join!(ctl.switch_connected(S1), async {
        tokio::task::yield_now().await;
        ctl.on_packet_in(S1, 1, &udp_to(Ipv4Addr::new(192, 168, 1, 1))).await
    });

    assert_eq!(resent.unwrap(), 2);
    assert!(outcome.is_forwarded());

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|a| a.kind == ActionKind::Install));
    let resent_rules: Vec<_> = ctl
        .rules(S1)
        .await
        .into_iter()
        .filter(|e| e.handle == a || e.handle == b)
        .map(|e| e.rule.flow_match)
        .collect();
    assert_eq!(sent[0].flow_match, resent_rules[0]);
    assert_eq!(sent[1].flow_match, resent_rules[1]);
    assert_eq!(sent[2].flow_match, FlowMatch::parse([("destAddr", "192.168.0.0/16")]).unwrap());
    assert!(ctl.rules(S1).await.iter().all(|e| e.sync == SyncState::Confirmed));
}

#[tokio::test]
async fn route_change_is_visible_to_next_evaluation() {
    let (ctl, _) = setup();
    let packet = classify(S1, 1, &udp_to(Ipv4Addr::new(172, 16, 0, 1))).unwrap();
    let egress = |d: ForwardingDecision| match d {
        ForwardingDecision::Forward { egress_port, .. } => Some(egress_port),
        _ => None,
    };

    ctl.add_route(S1, route("172.16.0.0/16", S1, 2)).await;
    assert_eq!(egress(ctl.evaluator().evaluate(&packet)), Some(2));
    assert_eq!(egress(ctl.evaluator().evaluate(&packet)), Some(2));

    ctl.add_route(S1, route("172.16.0.0/24", S1, 3)).await;
    assert_eq!(egress(ctl.evaluator().evaluate(&packet)), Some(3));

    ctl.add_route(S1, route("172.16.0.0/24", S1, 5)).await;
    assert_eq!(egress(ctl.evaluator().evaluate(&packet)), Some(5));

    ctl.remove_route(S1, &"172.16.0.0/24".parse().unwrap()).await;
    assert_eq!(egress(ctl.evaluator().evaluate(&packet)), Some(2));

    ctl.remove_route(S1, &"172.16.0.0/16".parse().unwrap()).await;
    assert_eq!(
        ctl.evaluator().evaluate(&packet),
        ForwardingDecision::Drop {
            reason: DropReason::NoRoute
        }
    );
}

#[tokio::test]
async fn modify_keeps_position_among_equal_priority() {
    let (ctl, _) = setup();
    let handles = [
        ctl.add_rule(S1, forward_rule("10.0.0.1", 1, 50)).await.unwrap(),
        ctl.add_rule(S1, forward_rule("10.0.0.2", 1, 50)).await.unwrap(),
        ctl.add_rule(S1, forward_rule("10.0.0.3", 1, 50)).await.unwrap(),
    ];

    ctl.modify_rule(S1, handles[0], forward_rule("10.0.0.9", 7, 50))
        .await
        .unwrap();

    let order: Vec<_> = ctl.rules(S1).await.iter().map(|e| e.handle).collect();
    assert_eq!(order, handles.to_vec());
}

#[tokio::test]
async fn resync_is_idempotent() {
    let (ctl, transport) = setup();
    transport.failing.store(true, Ordering::SeqCst);
    let err = ctl.add_rule(S1, forward_rule("172.16.0.1", 2, 10)).await.unwrap_err();
    let FlowError::Transport { handle: Some(handle), .. } = err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(ctl.unconfirmed_actions(S1).await.len(), 1);

    transport.failing.store(false, Ordering::SeqCst);
    assert_eq!(ctl.resync(S1).await.unwrap(), 1);
    assert_eq!(ctl.resync(S1).await.unwrap(), 0);

    let rules = ctl.rules(S1).await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].handle, handle);
    assert_eq!(rules[0].sync, SyncState::Confirmed);
    assert_eq!(transport.kinds(), vec![ActionKind::Install]);
}

#[tokio::test(start_paused = true)]
async fn stalled_transport_times_out() {
    let (ctl, transport) = setup();
    transport.stalled.store(true, Ordering::SeqCst);

    let err = ctl.add_rule(S1, forward_rule("172.16.0.1", 2, 10)).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Transport {
            handle: Some(_),
            source: TransportError::Timeout(_)
        }
    ));
    assert_eq!(ctl.rules(S1).await[0].sync, SyncState::Unconfirmed);
}

#[tokio::test]
async fn switches_are_independent() {
    let (ctl, transport) = setup();
    ctl.add_route(S1, route("172.16.0.0/16", S1, 2)).await;
    ctl.switch_disconnected(S2).await;

    let frame = udp_to(Ipv4Addr::new(172, 16, 0, 1));
    assert!(ctl.on_packet_in(S1, 1, &frame).await.is_forwarded());
    assert_eq!(
        ctl.on_packet_in(S2, 1, &frame).await,
        ForwardingOutcome::Dropped {
            reason: DropReason::NoRoute
        }
    );

    ctl.add_rule(S2, forward_rule("172.16.0.1", 2, 10)).await.unwrap_err();
    assert_eq!(ctl.rules(S1).await.len(), 1);
    assert_eq!(ctl.rules(S2).await.len(), 1);
    assert!(transport.sent.lock().iter().all(|(s, _)| *s == S1));

    let dest = IpAddress::from(Ipv4Addr::new(172, 16, 0, 1));
    assert!(ctl.evaluator().routes().cached(S2, &dest).is_none());
}

#[tokio::test]
async fn admit_repeats_for_fixed_ledger() {
    let (ctl, _) = setup();
    ctl.add_qos_policy(S1, QosPolicy::new(PriorityTier::Medium, TrafficSelector::any()).with_ceiling(20.0))
        .unwrap();
    let packet = classify(S1, 1, &udp_to(Ipv4Addr::new(172, 16, 0, 1))).unwrap();
    let decision = ForwardingDecision::Forward {
        egress_port: 2,
        network: None,
    };

    for usage in [0.0, 19.0, 20.0, 35.0] {
        let outcomes: Vec<bool> = (0..3)
            .map(|_| {
                ctl.record_port_usage(S1, 2, usage).unwrap();
                ctl.qos().admit(&packet, decision).is_ok()
            })
            .collect();
        assert_eq!(outcomes, vec![usage < 20.0; 3]);
    }
}
