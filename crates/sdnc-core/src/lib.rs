//! SDN controller core.
//!
//! Decides what happens to packets seen at switches and keeps each switch's
//! authoritative flow table, emitting the install/remove actions that realize
//! those decisions on the hardware.
//!
//! # Architecture
//!
//! ```text
//! frame ──> [classify] ──> [PolicyEvaluator] ──> [QosArbiter] ──> [FlowRuleManager] ──> [encode] ──> Transport
//!                               │    │                │                   │
//!                          ArpTable  RouteTable  BandwidthLedger      FlowTable (per switch)
//! ```
//!
//! # Key Components
//!
//! - [`Controller`]: packet-in pipeline and administrative API
//! - [`flow::FlowRuleManager`]: the only writer of per-switch flow tables
//! - [`policy::PolicyEvaluator`]: address resolution and longest-prefix routing
//! - [`qos::QosArbiter`]: tiered admission against per-port bandwidth usage
//! - [`transport::Transport`]: seam to whatever speaks the switch protocol

pub mod audit;
pub mod classify;
pub mod config;
pub mod controller;
pub mod error;
pub mod flow;
pub mod ids;
pub mod policy;
pub mod qos;
pub mod transport;

pub use classify::{classify, ClassifiedPacket, TransportProtocol};
pub use config::{ControllerConfig, DefaultAction};
pub use controller::{Controller, ControllerStats, ForwardingOutcome, PipelineStats};
pub use error::{
    ConfigError, DropReason, Dropped, FlowError, MalformedPacketError, QosError, TransportError,
    ValidationError,
};
pub use ids::{PolicyHandle, RuleHandle, SwitchId};
pub use transport::{Ack, Transport};
