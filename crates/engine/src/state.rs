//! The shared operational snapshot. One instance per process, mutated only
//! through the command dispatcher, read by everyone else via `snapshot`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ActiveMode, AlertId, AlertRecord, MessageId, SupervisorId},
    protocol::{AlertNote, BroadcastMessage, PriorityOverride, StateSnapshot},
};

#[derive(Debug)]
pub struct SyncState {
    alerts: Vec<AlertRecord>,
    acknowledged_alert_ids: BTreeSet<AlertId>,
    priority_overrides: BTreeMap<AlertId, PriorityOverride>,
    notes: BTreeMap<AlertId, AlertNote>,
    broadcast_messages: Vec<BroadcastMessage>,
    active_mode: ActiveMode,
    last_updated_at: DateTime<Utc>,
}

/// What `replace_alerts` swept out along with the old list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacedAlerts {
    pub removed_overrides: usize,
    pub removed_notes: usize,
}

impl SyncState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            alerts: Vec::new(),
            acknowledged_alert_ids: BTreeSet::new(),
            priority_overrides: BTreeMap::new(),
            notes: BTreeMap::new(),
            broadcast_messages: Vec::new(),
            active_mode: ActiveMode::default(),
            last_updated_at: now,
        }
    }

    /// Idempotent insert. Returns whether the id was newly acknowledged;
    /// a duplicate acknowledge leaves the state completely untouched.
    /// A `reason` on a first acknowledge is recorded as the alert's note.
    pub fn acknowledge(
        &mut self,
        alert_id: AlertId,
        author: SupervisorId,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.acknowledged_alert_ids.insert(alert_id.clone()) {
            return false;
        }
        if let Some(reason) = reason {
            self.notes.insert(
                alert_id,
                AlertNote {
                    text: reason.to_owned(),
                    author_id: author,
                    timestamp: now,
                },
            );
        }
        self.last_updated_at = now;
        true
    }

    /// Last write wins; the stored record's own timestamp becomes the
    /// state's `last_updated_at`.
    pub fn set_priority(&mut self, alert_id: AlertId, record: PriorityOverride) {
        self.last_updated_at = record.timestamp;
        self.priority_overrides.insert(alert_id, record);
    }

    /// Last write wins: a second note replaces, never appends.
    pub fn set_note(&mut self, alert_id: AlertId, note: AlertNote) {
        self.last_updated_at = note.timestamp;
        self.notes.insert(alert_id, note);
    }

    pub fn push_message(&mut self, message: BroadcastMessage) {
        self.last_updated_at = message.created_at;
        self.broadcast_messages.push(message);
    }

    /// Removes by id. The returned message is the sole license to emit a
    /// `message_removed` event, which keeps expiry and `clear_message`
    /// from double-announcing the same removal.
    pub fn remove_message(
        &mut self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> Option<BroadcastMessage> {
        let index = self.broadcast_messages.iter().position(|m| m.id == id)?;
        self.last_updated_at = now;
        Some(self.broadcast_messages.remove(index))
    }

    pub fn set_mode(&mut self, mode: ActiveMode, now: DateTime<Utc>) {
        self.active_mode = mode;
        self.last_updated_at = now;
    }

    pub fn active_mode(&self) -> ActiveMode {
        self.active_mode
    }

    /// Wholesale replacement, never a merge. Overrides and notes for alert
    /// ids absent from the new list are garbage-collected; acknowledgements
    /// are append-only and survive list refreshes.
    pub fn replace_alerts(
        &mut self,
        alerts: Vec<AlertRecord>,
        now: DateTime<Utc>,
    ) -> ReplacedAlerts {
        let keep: BTreeSet<&AlertId> = alerts.iter().map(|a| &a.id).collect();
        let overrides_before = self.priority_overrides.len();
        let notes_before = self.notes.len();
        self.priority_overrides.retain(|id, _| keep.contains(id));
        self.notes.retain(|id, _| keep.contains(id));
        let swept = ReplacedAlerts {
            removed_overrides: overrides_before - self.priority_overrides.len(),
            removed_notes: notes_before - self.notes.len(),
        };
        self.alerts = alerts;
        self.last_updated_at = now;
        swept
    }

    /// Consistent point-in-time copy.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            alerts: self.alerts.clone(),
            acknowledged_alerts: self.acknowledged_alert_ids.iter().cloned().collect(),
            priority_overrides: self.priority_overrides.clone(),
            notes: self.notes.clone(),
            broadcast_messages: self.broadcast_messages.clone(),
            active_mode: self.active_mode,
            last_updated_at: self.last_updated_at,
        }
    }
}
