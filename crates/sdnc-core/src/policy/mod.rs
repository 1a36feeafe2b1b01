//! Forwarding policy: address resolution, routes and the evaluator.

mod arp;
mod evaluator;
mod routes;

pub use arp::{ArpEntry, ArpSource, ArpStats, ArpTable};
pub use evaluator::{ForwardingDecision, PolicyEvaluator};
pub use routes::{Binding, RouteEntry, RouteStats, RouteTable, DEFAULT_ROUTE_CACHE_CAPACITY};
