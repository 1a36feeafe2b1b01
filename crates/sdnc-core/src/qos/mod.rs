//! QoS admission: policies, bandwidth ledger and the arbiter.

mod arbiter;
mod ledger;
mod types;

pub use arbiter::{frame_mbps, AdmittedAction, QosArbiter, QosStats};
pub use ledger::{BandwidthLedger, PortUsage};
pub use types::{PortRange, PriorityTier, QosPolicy, TrafficSelector};
