//! Flow rule manager: the only writer of switch flow tables.
//!
//! Every operation on a switch runs under that switch's exclusive section
//! (an owned async mutex per switch); different switches never contend.
//!
//! Cancellation: dropping an operation's future while it waits for the
//! section leaves nothing changed. Once the store has been updated, the
//! guard and the transport send move onto a spawned task, so the mutation and
//! its acknowledgement bookkeeping complete even if the caller goes away.

use super::encoder::{encode, ControlAction, Mutation};
use super::store::{FlowEntry, FlowTable, RuleOrigin, SyncState};
use super::types::{FlowMatch, FlowRule};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::classify::ClassifiedPacket;
use crate::config::{ControllerConfig, RuleLimits};
use crate::error::{FlowError, TransportError};
use crate::ids::{HandleAllocator, RuleHandle, SwitchId};
use crate::transport::{send_with_timeout, Transport};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const SOURCE: &str = "FlowRuleManager";

/// Connection state of a switch as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    #[default]
    Connected,
    Disconnected,
    /// Unconfirmed rules are being resent; holds the switch's section.
    Reconciling,
    /// A sequence failed half way or reconciliation failed. Packet-triggered
    /// installs are refused until a successful resync.
    NeedsResync,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Reconciling => write!(f, "reconciling"),
            LinkState::NeedsResync => write!(f, "needs_resync"),
        }
    }
}

#[derive(Debug, Default)]
struct SwitchTable {
    table: FlowTable,
    link: LinkState,
    /// Removals the switch never acknowledged; resent before installs.
    pending_removals: Vec<ControlAction>,
}

impl SwitchTable {
    fn drop_pending_removal(&mut self, action: &ControlAction) {
        let canonical = action.flow_match.canonical();
        self.pending_removals.retain(|r| {
            r.table_id != action.table_id
                || r.priority != action.priority
                || r.flow_match.canonical() != canonical
        });
    }

    fn mark(&mut self, handle: RuleHandle, state: SyncState) {
        if let Some(entry) = self.table.get_mut(handle) {
            entry.sync = state;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub rules_added: u64,
    pub rules_modified: u64,
    pub rules_removed: u64,
    pub rules_expired: u64,
    pub conflicts: u64,
    pub transport_failures: u64,
    pub reconciliations: u64,
}

struct Inner {
    limits: RuleLimits,
    default_priority: u16,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    switches: DashMap<SwitchId, Arc<Mutex<SwitchTable>>>,
    handles: HandleAllocator,
    stats: parking_lot::Mutex<FlowStats>,
}

impl Inner {
    async fn send(&self, switch_id: &SwitchId, action: &ControlAction) -> Result<(), TransportError> {
        let result = send_with_timeout(self.transport.as_ref(), switch_id, action, self.timeout).await;
        match &result {
            Ok(_) => debug!(switch = %switch_id, kind = %action.kind, "control action acknowledged"),
            Err(e) => {
                self.stats.lock().transport_failures += 1;
                warn!(switch = %switch_id, kind = %action.kind, error = %e, "control action not acknowledged");
            }
        }
        result.map(|_| ())
    }

    async fn deliver_install(
        self: Arc<Self>,
        mut guard: OwnedMutexGuard<SwitchTable>,
        switch_id: SwitchId,
        handle: RuleHandle,
        action: ControlAction,
    ) -> Result<RuleHandle, FlowError> {
        match self.send(&switch_id, &action).await {
            Ok(()) => {
                guard.mark(handle, SyncState::Confirmed);
                audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, SOURCE, "add_rule")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(handle.to_string())
                    .with_object_type("flow_rule")
                    .with_details(serde_json::json!({
                        "switch": switch_id.to_string(),
                        "table_id": action.table_id,
                        "priority": action.priority,
                    })));
                Ok(handle)
            }
            Err(source) => {
                guard.mark(handle, SyncState::Unconfirmed);
                audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, SOURCE, "add_rule")
                    .with_object_id(handle.to_string())
                    .with_object_type("flow_rule")
                    .with_error(source.to_string()));
                Err(FlowError::Transport {
                    handle: Some(handle),
                    source,
                })
            }
        }
    }

    async fn deliver_modify(
        self: Arc<Self>,
        mut guard: OwnedMutexGuard<SwitchTable>,
        switch_id: SwitchId,
        handle: RuleHandle,
        install: ControlAction,
        remove_old: Option<ControlAction>,
        remove_first: bool,
    ) -> Result<(), FlowError> {
        if remove_first {
            // remove-then-install: either half failing leaves the switch in an
            // unknown state.
            let steps = remove_old.iter().chain(std::iter::once(&install));
            for step in steps {
                if let Err(source) = self.send(&switch_id, step).await {
                    guard.mark(handle, SyncState::Unconfirmed);
                    guard.link = LinkState::NeedsResync;
                    if let Some(old) = &remove_old {
                        guard.pending_removals.push(old.clone());
                    }
                    audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, SOURCE, "modify_rule")
                        .with_object_id(handle.to_string())
                        .with_object_type("flow_rule")
                        .with_error(format!("{} step failed: {}", step.kind, source)));
                    return Err(FlowError::Inconsistent {
                        switch: switch_id,
                        handle,
                        source,
                    });
                }
            }
            guard.mark(handle, SyncState::Confirmed);
        } else {
            if let Err(source) = self.send(&switch_id, &install).await {
                guard.mark(handle, SyncState::Unconfirmed);
                if let Some(old) = remove_old {
                    guard.pending_removals.push(old);
                }
                audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, SOURCE, "modify_rule")
                    .with_object_id(handle.to_string())
                    .with_object_type("flow_rule")
                    .with_error(source.to_string()));
                return Err(FlowError::Transport {
                    handle: Some(handle),
                    source,
                });
            }
            guard.mark(handle, SyncState::Confirmed);

            // The replacement has a new identity, so the old entry has to go
            // too. It is removed only after the new one is in place.
            if let Some(old) = remove_old {
                if let Err(source) = self.send(&switch_id, &old).await {
                    guard.pending_removals.push(old);
                    return Err(FlowError::Transport {
                        handle: Some(handle),
                        source,
                    });
                }
            }
        }

        audit_log!(AuditRecord::new(AuditCategory::ResourceModify, SOURCE, "modify_rule")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(handle.to_string())
            .with_object_type("flow_rule"));
        Ok(())
    }

    async fn deliver_removals(
        self: Arc<Self>,
        mut guard: OwnedMutexGuard<SwitchTable>,
        switch_id: SwitchId,
        actions: Vec<ControlAction>,
    ) -> Result<(), FlowError> {
        let mut first_error = None;
        for action in actions {
            if let Err(source) = self.send(&switch_id, &action).await {
                guard.pending_removals.push(action);
                first_error.get_or_insert(source);
            }
        }
        match first_error {
            None => Ok(()),
            Some(source) => Err(FlowError::Transport {
                handle: None,
                source,
            }),
        }
    }

    /// Resends unacknowledged removals, then an install for every rule that
    /// is not confirmed.
    async fn reconcile(
        self: Arc<Self>,
        mut guard: OwnedMutexGuard<SwitchTable>,
        switch_id: SwitchId,
    ) -> Result<usize, FlowError> {
        guard.link = LinkState::Reconciling;
        let mut sent = 0;

        let removals = std::mem::take(&mut guard.pending_removals);
        for (i, action) in removals.iter().enumerate() {
            if let Err(source) = self.send(&switch_id, action).await {
                guard.pending_removals.extend(removals[i..].iter().cloned());
                return Err(self.reconcile_failed(&mut guard, switch_id, source));
            }
            sent += 1;
        }

        let installs: Vec<(RuleHandle, ControlAction)> = guard
            .table
            .entries()
            .filter(|e| e.sync != SyncState::Confirmed)
            .map(|e| {
                let action = encode(
                    switch_id,
                    Mutation::Install {
                        rule: &e.rule,
                        priority: e.priority,
                    },
                );
                (e.handle, action)
            })
            .collect();

        for (handle, action) in installs {
            if let Err(source) = self.send(&switch_id, &action).await {
                return Err(self.reconcile_failed(&mut guard, switch_id, source));
            }
            guard.mark(handle, SyncState::Confirmed);
            sent += 1;
        }

        guard.link = LinkState::Connected;
        self.stats.lock().reconciliations += 1;
        info!(switch = %switch_id, resent = sent, "switch reconciled");
        audit_log!(AuditRecord::new(AuditCategory::SwitchLifecycle, SOURCE, "reconcile")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(switch_id.to_string())
            .with_object_type("switch")
            .with_details(serde_json::json!({ "resent": sent })));
        Ok(sent)
    }

    fn reconcile_failed(
        &self,
        guard: &mut SwitchTable,
        switch_id: SwitchId,
        source: TransportError,
    ) -> FlowError {
        guard.link = LinkState::NeedsResync;
        audit_log!(AuditRecord::new(AuditCategory::SwitchLifecycle, SOURCE, "reconcile")
            .with_object_id(switch_id.to_string())
            .with_object_type("switch")
            .with_error(source.to_string()));
        FlowError::Transport {
            handle: None,
            source,
        }
    }
}

async fn join<T>(task: JoinHandle<Result<T, FlowError>>) -> Result<T, FlowError> {
    task.await.unwrap_or_else(|e| {
        Err(FlowError::Transport {
            handle: None,
            source: TransportError::Unreachable(format!("send task failed: {}", e)),
        })
    })
}

/// Applies add/modify/remove to per-switch flow tables and emits the
/// matching control actions.
#[derive(Clone)]
pub struct FlowRuleManager {
    inner: Arc<Inner>,
}

impl FlowRuleManager {
    pub fn new(config: &ControllerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits: config.rule_limits(),
                default_priority: config.default_priority,
                timeout: config.transport_timeout(),
                transport,
                switches: DashMap::new(),
                handles: HandleAllocator::new(),
                stats: parking_lot::Mutex::new(FlowStats::default()),
            }),
        }
    }

    /// Section for `switch_id`, created on first use.
    fn slot(&self, switch_id: SwitchId) -> Arc<Mutex<SwitchTable>> {
        self.inner.switches.entry(switch_id).or_default().value().clone()
    }

    fn existing(&self, switch_id: SwitchId) -> Option<Arc<Mutex<SwitchTable>>> {
        self.inner.switches.get(&switch_id).map(|s| s.value().clone())
    }

    pub fn stats(&self) -> FlowStats {
        self.inner.stats.lock().clone()
    }

    /// Validates and installs a rule, returning its handle.
    #[instrument(skip(self, rule), fields(switch = %switch_id))]
    pub async fn add_rule(&self, switch_id: SwitchId, rule: FlowRule) -> Result<RuleHandle, FlowError> {
        self.add_rule_with_origin(switch_id, rule, RuleOrigin::Admin).await
    }

    pub(crate) async fn add_rule_with_origin(
        &self,
        switch_id: SwitchId,
        rule: FlowRule,
        origin: RuleOrigin,
    ) -> Result<RuleHandle, FlowError> {
        let priority = match rule.validate(&self.inner.limits, self.inner.default_priority) {
            Ok(p) => p,
            Err(e) => {
                audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, SOURCE, "add_rule")
                    .with_object_type("flow_rule")
                    .with_object_id(switch_id.to_string())
                    .with_error(e.to_string()));
                return Err(e.into());
            }
        };

        let mut guard = self.slot(switch_id).lock_owned().await;

        if origin == RuleOrigin::PacketIn && guard.link != LinkState::Connected {
            return Err(FlowError::Transport {
                handle: None,
                source: TransportError::Disconnected(switch_id),
            });
        }

        let handle = self.inner.handles.next_rule();
        let action = encode(
            switch_id,
            Mutation::Install {
                rule: &rule,
                priority,
            },
        );
        if let Err(existing) = guard.table.insert(handle, rule, priority, origin, Instant::now()) {
            self.inner.stats.lock().conflicts += 1;
            debug!(switch = %switch_id, existing = %existing, "duplicate rule rejected");
            audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, SOURCE, "add_rule")
                .with_outcome(AuditOutcome::Denied)
                .with_object_id(existing.to_string())
                .with_object_type("flow_rule")
                .with_error("identical active rule exists"));
            return Err(FlowError::Conflict { existing });
        }
        guard.drop_pending_removal(&action);
        self.inner.stats.lock().rules_added += 1;

        if guard.link == LinkState::Disconnected {
            guard.mark(handle, SyncState::Unconfirmed);
            return Err(FlowError::Transport {
                handle: Some(handle),
                source: TransportError::Disconnected(switch_id),
            });
        }

        let inner = self.inner.clone();
        join(tokio::spawn(inner.deliver_install(guard, switch_id, handle, action))).await
    }

    /// Replaces the rule behind `handle` in place. Its position among rules
    /// of equal priority is kept.
    #[instrument(skip(self, new_rule), fields(switch = %switch_id, handle = %handle))]
    pub async fn modify_rule(
        &self,
        switch_id: SwitchId,
        handle: RuleHandle,
        new_rule: FlowRule,
    ) -> Result<(), FlowError> {
        let priority = new_rule.validate(&self.inner.limits, self.inner.default_priority)?;

        let slot = self.existing(switch_id).ok_or(FlowError::NotFound(handle))?;
        let mut guard = slot.lock_owned().await;

        if guard.table.get(handle).is_none() {
            return Err(FlowError::NotFound(handle));
        }
        let same_identity = match guard.table.conflict(&new_rule, priority) {
            Some(existing) if existing == handle => true,
            Some(existing) => {
                self.inner.stats.lock().conflicts += 1;
                return Err(FlowError::Conflict { existing });
            }
            None => false,
        };

        let install = encode(
            switch_id,
            Mutation::Install {
                rule: &new_rule,
                priority,
            },
        );
        let (old_rule, old_priority) = guard
            .table
            .replace(handle, new_rule, priority, Instant::now())
            .ok_or(FlowError::NotFound(handle))?;
        guard.drop_pending_removal(&install);
        self.inner.stats.lock().rules_modified += 1;

        let remove_first = self.inner.transport.requires_remove_before_install();
        let remove_old = (remove_first || !same_identity).then(|| {
            encode(
                switch_id,
                Mutation::Remove {
                    rule: &old_rule,
                    priority: old_priority,
                },
            )
        });

        if guard.link == LinkState::Disconnected {
            guard.mark(handle, SyncState::Unconfirmed);
            if let Some(old) = remove_old.filter(|_| !same_identity) {
                guard.pending_removals.push(old);
            }
            return Err(FlowError::Transport {
                handle: Some(handle),
                source: TransportError::Disconnected(switch_id),
            });
        }

        let inner = self.inner.clone();
        join(tokio::spawn(inner.deliver_modify(
            guard,
            switch_id,
            handle,
            install,
            remove_old,
            remove_first,
        )))
        .await
    }

    /// Removes the rule behind `handle` and emits its removal.
    ///
    /// The store is updated even when the switch does not acknowledge; the
    /// removal is then kept for the next resync.
    #[instrument(skip(self), fields(switch = %switch_id, handle = %handle))]
    pub async fn remove_rule(&self, switch_id: SwitchId, handle: RuleHandle) -> Result<(), FlowError> {
        let slot = self.existing(switch_id).ok_or(FlowError::NotFound(handle))?;
        let mut guard = slot.lock_owned().await;

        let entry = guard.table.remove(handle).ok_or(FlowError::NotFound(handle))?;
        self.inner.stats.lock().rules_removed += 1;
        let action = encode(
            switch_id,
            Mutation::Remove {
                rule: &entry.rule,
                priority: entry.priority,
            },
        );
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, SOURCE, "remove_rule")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(handle.to_string())
            .with_object_type("flow_rule"));

        if guard.link == LinkState::Disconnected {
            guard.pending_removals.push(action);
            return Err(FlowError::Transport {
                handle: None,
                source: TransportError::Disconnected(switch_id),
            });
        }

        let inner = self.inner.clone();
        join(tokio::spawn(inner.deliver_removals(guard, switch_id, vec![action]))).await
    }

    /// Removes every rule whose hard or idle timeout has elapsed at `now`,
    /// emitting one removal per rule in evaluation order.
    #[instrument(skip(self, now), fields(switch = %switch_id))]
    pub async fn expire_rules(&self, switch_id: SwitchId, now: Instant) -> Vec<RuleHandle> {
        let Some(slot) = self.existing(switch_id) else {
            return Vec::new();
        };
        let mut guard = slot.lock_owned().await;

        let expired: Vec<RuleHandle> = guard
            .table
            .entries()
            .filter(|e| e.is_expired(now))
            .map(|e| e.handle)
            .collect();
        if expired.is_empty() {
            return expired;
        }

        let mut actions = Vec::with_capacity(expired.len());
        for handle in &expired {
            if let Some(entry) = guard.table.remove(*handle) {
                actions.push(encode(
                    switch_id,
                    Mutation::Remove {
                        rule: &entry.rule,
                        priority: entry.priority,
                    },
                ));
                audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, SOURCE, "expire_rule")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(handle.to_string())
                    .with_object_type("flow_rule"));
            }
        }
        self.inner.stats.lock().rules_expired += expired.len() as u64;
        debug!(switch = %switch_id, count = expired.len(), "rules expired");

        if guard.link == LinkState::Disconnected {
            guard.pending_removals.extend(actions);
            return expired;
        }

        let inner = self.inner.clone();
        if let Err(e) = join(tokio::spawn(inner.deliver_removals(guard, switch_id, actions))).await {
            warn!(switch = %switch_id, error = %e, "expiry removals not acknowledged");
        }
        expired
    }

    /// Removes every rule of the switch, emitting one removal per rule in
    /// evaluation order. Returns the number of rules removed. As with
    /// [`remove_rule`](Self::remove_rule), the store is cleared even when the
    /// switch does not acknowledge.
    #[instrument(skip(self), fields(switch = %switch_id))]
    pub async fn clear_rules(&self, switch_id: SwitchId) -> Result<usize, FlowError> {
        let Some(slot) = self.existing(switch_id) else {
            return Ok(0);
        };
        let mut guard = slot.lock_owned().await;

        let handles: Vec<RuleHandle> = guard.table.entries().map(|e| e.handle).collect();
        let mut actions = Vec::with_capacity(handles.len());
        for handle in &handles {
            if let Some(entry) = guard.table.remove(*handle) {
                actions.push(encode(
                    switch_id,
                    Mutation::Remove {
                        rule: &entry.rule,
                        priority: entry.priority,
                    },
                ));
            }
        }
        let cleared = actions.len();
        if cleared == 0 {
            return Ok(0);
        }
        self.inner.stats.lock().rules_removed += cleared as u64;
        info!(switch = %switch_id, count = cleared, "flow table cleared");
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, SOURCE, "clear_rules")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(switch_id.to_string())
            .with_object_type("switch")
            .with_details(serde_json::json!({ "removed": cleared })));

        if guard.link == LinkState::Disconnected {
            guard.pending_removals.extend(actions);
            return Err(FlowError::Transport {
                handle: None,
                source: TransportError::Disconnected(switch_id),
            });
        }

        let inner = self.inner.clone();
        join(tokio::spawn(inner.deliver_removals(guard, switch_id, actions))).await?;
        Ok(cleared)
    }

    /// Updates the cumulative counters reported by the switch for a rule.
    /// A growing packet count refreshes the rule's idle timer.
    pub async fn record_flow_stats(
        &self,
        switch_id: SwitchId,
        handle: RuleHandle,
        packets: u64,
        bytes: u64,
        now: Instant,
    ) -> Result<(), FlowError> {
        let slot = self.existing(switch_id).ok_or(FlowError::NotFound(handle))?;
        let mut guard = slot.lock().await;
        let entry = guard.table.get_mut(handle).ok_or(FlowError::NotFound(handle))?;
        if packets > entry.packet_count {
            entry.last_hit = now;
        }
        entry.packet_count = packets;
        entry.byte_count = bytes;
        Ok(())
    }

    /// Marks every rule of the switch unconfirmed; nothing is deleted.
    #[instrument(skip(self), fields(switch = %switch_id))]
    pub async fn switch_disconnected(&self, switch_id: SwitchId) {
        let slot = self.slot(switch_id);
        let mut guard = slot.lock().await;
        guard.link = LinkState::Disconnected;
        guard.table.mark_all(SyncState::Unconfirmed);
        info!(switch = %switch_id, rules = guard.table.len(), "switch disconnected");
        audit_log!(AuditRecord::new(AuditCategory::SwitchLifecycle, SOURCE, "switch_disconnected")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(switch_id.to_string())
            .with_object_type("switch"));
    }

    /// Reconciles the switch: every unconfirmed rule is resent before any
    /// other operation on the switch can proceed. Returns the number of
    /// actions resent.
    #[instrument(skip(self), fields(switch = %switch_id))]
    pub async fn switch_connected(&self, switch_id: SwitchId) -> Result<usize, FlowError> {
        let guard = self.slot(switch_id).lock_owned().await;
        info!(switch = %switch_id, "switch connected");
        let inner = self.inner.clone();
        join(tokio::spawn(inner.reconcile(guard, switch_id))).await
    }

    /// Resends all unacknowledged actions of a connected switch.
    #[instrument(skip(self), fields(switch = %switch_id))]
    pub async fn resync(&self, switch_id: SwitchId) -> Result<usize, FlowError> {
        let Some(slot) = self.existing(switch_id) else {
            return Ok(0);
        };
        let guard = slot.lock_owned().await;
        if guard.link == LinkState::Disconnected {
            return Err(FlowError::Transport {
                handle: None,
                source: TransportError::Disconnected(switch_id),
            });
        }
        let inner = self.inner.clone();
        join(tokio::spawn(inner.reconcile(guard, switch_id))).await
    }

    /// Actions an external retrier may resend: pending removals followed by
    /// installs for unconfirmed rules. Resending any of them is idempotent.
    pub async fn unconfirmed_actions(&self, switch_id: SwitchId) -> Vec<ControlAction> {
        let Some(slot) = self.existing(switch_id) else {
            return Vec::new();
        };
        let guard = slot.lock().await;
        let installs = guard
            .table
            .entries()
            .filter(|e| e.sync == SyncState::Unconfirmed)
            .map(|e| {
                encode(
                    switch_id,
                    Mutation::Install {
                        rule: &e.rule,
                        priority: e.priority,
                    },
                )
            });
        guard.pending_removals.iter().cloned().chain(installs).collect()
    }

    pub async fn link_state(&self, switch_id: SwitchId) -> Option<LinkState> {
        let slot = self.existing(switch_id)?;
        let guard = slot.lock().await;
        Some(guard.link)
    }

    /// Whether packet-triggered installs are currently accepted.
    pub async fn accepts_installs(&self, switch_id: SwitchId) -> bool {
        matches!(
            self.link_state(switch_id).await,
            None | Some(LinkState::Connected)
        )
    }

    /// Snapshot of the switch's rules in evaluation order.
    pub async fn rules(&self, switch_id: SwitchId) -> Vec<FlowEntry> {
        let Some(slot) = self.existing(switch_id) else {
            return Vec::new();
        };
        let guard = slot.lock().await;
        guard.table.entries().cloned().collect()
    }

    pub async fn rule(&self, switch_id: SwitchId, handle: RuleHandle) -> Option<FlowEntry> {
        let slot = self.existing(switch_id)?;
        let guard = slot.lock().await;
        guard.table.get(handle).cloned()
    }

    pub async fn exists(&self, switch_id: SwitchId, flow_match: &FlowMatch, table_id: u8) -> bool {
        let Some(slot) = self.existing(switch_id) else {
            return false;
        };
        let guard = slot.lock().await;
        guard.table.exists(flow_match, table_id)
    }

    /// First rule of `table_id`, in evaluation order, that accepts `packet`.
    pub async fn lookup(
        &self,
        switch_id: SwitchId,
        packet: &ClassifiedPacket,
        table_id: u8,
    ) -> Option<FlowEntry> {
        let slot = self.existing(switch_id)?;
        let guard = slot.lock().await;
        guard.table.lookup(table_id, packet).cloned()
    }
}

impl fmt::Debug for FlowRuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRuleManager")
            .field("switches", &self.inner.switches.len())
            .field("stats", &self.stats())
            .finish()
    }
}
