//! Control action encoding.
//!
//! Pure mapping from a flow table mutation to the protocol-neutral record the
//! transport collaborator accepts. No I/O happens here.

use super::types::{Action, FlowMatch, FlowRule};
use crate::ids::SwitchId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Install,
    Remove,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Install => write!(f, "Install"),
            ActionKind::Remove => write!(f, "Remove"),
        }
    }
}

/// Instruction to install or remove one flow entry on a switch.
///
/// Serialized as `{switchId, tableId, kind, match, actions?, priority}`;
/// `actions` is present exactly when `kind` is `Install`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAction {
    pub switch_id: SwitchId,
    pub table_id: u8,
    pub kind: ActionKind,
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    pub priority: u16,
}

/// A flow table change to be realised on a switch.
#[derive(Debug, Clone, Copy)]
pub enum Mutation<'a> {
    /// Add or replace; both are an install on the wire.
    Install { rule: &'a FlowRule, priority: u16 },
    Remove { rule: &'a FlowRule, priority: u16 },
}

pub fn encode(switch_id: SwitchId, mutation: Mutation<'_>) -> ControlAction {
    match mutation {
        Mutation::Install { rule, priority } => ControlAction {
            switch_id,
            table_id: rule.table_id,
            kind: ActionKind::Install,
            flow_match: rule.flow_match.clone(),
            actions: Some(rule.actions.clone()),
            priority,
        },
        Mutation::Remove { rule, priority } => ControlAction {
            switch_id,
            table_id: rule.table_id,
            kind: ActionKind::Remove,
            flow_match: rule.flow_match.clone(),
            actions: None,
            priority,
        },
    }
}
