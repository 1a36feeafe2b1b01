//! Flow table state: rule model, per-switch store, manager and encoder.

mod encoder;
mod manager;
mod store;
mod types;

pub use encoder::{encode, ActionKind, ControlAction, Mutation};
pub use manager::{FlowRuleManager, FlowStats, LinkState};
pub use store::{FlowEntry, FlowTable, RuleOrigin, SyncState};
pub use types::{
    Action, FlowMatch, FlowRule, MatchField, MatchValue, Matcher, DEFAULT_PRIORITY, MAX_PORT,
};
