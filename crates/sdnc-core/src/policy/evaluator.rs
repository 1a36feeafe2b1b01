//! Forwarding decisions for classified packets.

use super::arp::ArpTable;
use super::routes::RouteTable;
use crate::classify::ClassifiedPacket;
use crate::error::DropReason;
use sdnc_types::{IpPrefix, MacAddress};
use std::fmt;
use tracing::trace;

/// Candidate action for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingDecision {
    /// Forward out of `egress_port`. `network` is the route the decision was
    /// derived from, if any.
    Forward {
        egress_port: u32,
        network: Option<IpPrefix>,
    },
    /// ARP target resolved to a link address.
    Resolve { link_addr: MacAddress },
    Drop { reason: DropReason },
    /// No policy applies; the caller's default action decides.
    NoDecision,
}

impl fmt::Display for ForwardingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingDecision::Forward { egress_port, .. } => write!(f, "forward({})", egress_port),
            ForwardingDecision::Resolve { link_addr } => write!(f, "resolve({})", link_addr),
            ForwardingDecision::Drop { reason } => write!(f, "drop({})", reason),
            ForwardingDecision::NoDecision => write!(f, "no-decision"),
        }
    }
}

/// Maps a classified packet to a forwarding decision using the address
/// resolution cache and the route table. Holds no other state.
#[derive(Debug, Default)]
pub struct PolicyEvaluator {
    arp: ArpTable,
    routes: RouteTable,
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An evaluator whose route cache holds at most `capacity` bindings per
    /// switch.
    pub fn with_route_cache_capacity(capacity: usize) -> Self {
        Self {
            arp: ArpTable::default(),
            routes: RouteTable::with_cache_capacity(capacity),
        }
    }

    pub fn arp(&self) -> &ArpTable {
        &self.arp
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn evaluate(&self, packet: &ClassifiedPacket) -> ForwardingDecision {
        let decision = if packet.is_arp() {
            self.evaluate_arp(packet)
        } else if packet.is_ip() {
            self.evaluate_ip(packet)
        } else {
            ForwardingDecision::NoDecision
        };
        trace!(switch = %packet.source_switch, %decision, "evaluated");
        decision
    }

    fn evaluate_arp(&self, packet: &ClassifiedPacket) -> ForwardingDecision {
        match packet.dest_addr.and_then(|ip| self.arp.resolve(&ip)) {
            Some(link_addr) => ForwardingDecision::Resolve { link_addr },
            None => ForwardingDecision::Drop {
                reason: DropReason::UnresolvedArp,
            },
        }
    }

    fn evaluate_ip(&self, packet: &ClassifiedPacket) -> ForwardingDecision {
        let Some(dest) = packet.dest_addr else {
            return ForwardingDecision::NoDecision;
        };
        match self.routes.resolve(packet.source_switch, &dest) {
            Some(binding) => ForwardingDecision::Forward {
                egress_port: binding.egress_port,
                network: Some(binding.network),
            },
            None => ForwardingDecision::Drop {
                reason: DropReason::NoRoute,
            },
        }
    }
}
