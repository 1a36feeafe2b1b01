//! Error types for the controller core.

use crate::flow::MatchField;
use crate::ids::{PolicyHandle, RuleHandle, SwitchId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A rule or policy was malformed. Caller's fault, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("match must contain at least one field")]
    EmptyMatch,

    #[error("rule must contain at least one action")]
    EmptyActions,

    #[error("unknown match field: {0}")]
    UnknownField(String),

    #[error("invalid value {value:?} for field {field}")]
    InvalidValue { field: MatchField, value: String },

    #[error("matcher not applicable to field {field}: {reason}")]
    MatcherKind { field: MatchField, reason: String },

    #[error("invalid range {min}-{max} for field {field}")]
    InvalidRange { field: MatchField, min: u64, max: u64 },

    #[error("priority {priority} outside [{min}, {max}]")]
    PriorityOutOfRange { priority: u16, min: u16, max: u16 },

    #[error("table id {table_id} exceeds maximum {max}")]
    TableIdOutOfRange { table_id: u8, max: u8 },

    #[error("invalid output port {0}")]
    InvalidPort(u32),

    #[error("drop must be the only action")]
    DropNotAlone,

    #[error("field {0} cannot be rewritten")]
    FieldNotRewritable(MatchField),

    #[error("invalid bandwidth ceiling {0}")]
    InvalidCeiling(f64),

    #[error("invalid usage sample {0}")]
    InvalidUsage(f64),

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("selector overlaps {existing} at the same tier")]
    AmbiguousSelector { existing: PolicyHandle },
}

/// Failure reported by the transport collaborator, or a send that was never
/// acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("switch {0} is disconnected")]
    Disconnected(SwitchId),

    #[error("switch rejected action: {0}")]
    Rejected(String),

    #[error("switch unreachable: {0}")]
    Unreachable(String),
}

/// Errors from the flow rule manager.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("identical active rule already installed as {existing}")]
    Conflict { existing: RuleHandle },

    #[error("rule not found: {0}")]
    NotFound(RuleHandle),

    /// The store was updated but the switch never acknowledged. When `handle`
    /// is set the rule is kept as unconfirmed so it can be resent.
    #[error("transport failure: {source}")]
    Transport {
        handle: Option<RuleHandle>,
        #[source]
        source: TransportError,
    },

    /// One half of a remove-then-install sequence failed; the switch needs a
    /// resync before it can be trusted again.
    #[error("switch {switch} inconsistent after {handle}: {source}")]
    Inconsistent {
        switch: SwitchId,
        handle: RuleHandle,
        #[source]
        source: TransportError,
    },
}

impl FlowError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, FlowError::Conflict { .. })
    }
}

/// Errors from the QoS arbiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QosError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("policy not found: {0}")]
    NotFound(PolicyHandle),
}

/// The classifier could not extract the fields it needs from a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPacketError {
    #[error("{layer} header truncated: need {needed} bytes, have {available}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid {layer} header: {reason}")]
    InvalidHeader { layer: &'static str, reason: String },
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a packet was intentionally not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    NoRoute,
    UnresolvedArp,
    QosThrottled,
    PolicyDrop,
    TransportUnavailable,
    Malformed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::NoRoute => "no-route",
            DropReason::UnresolvedArp => "unresolved-arp",
            DropReason::QosThrottled => "qos-throttled",
            DropReason::PolicyDrop => "policy-drop",
            DropReason::TransportUnavailable => "transport-unavailable",
            DropReason::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

/// A valid non-forwarding outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dropped: {reason}")]
pub struct Dropped {
    pub reason: DropReason,
}

impl Dropped {
    pub const fn new(reason: DropReason) -> Self {
        Self { reason }
    }
}
