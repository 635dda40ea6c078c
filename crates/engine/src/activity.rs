use chrono::{DateTime, Utc};
use shared::domain::{ActiveMode, AlertId, AlertPriority, SupervisorId};
use tracing::info;

/// Supervisor actions worth an audit trail.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEntry {
    AlertAcknowledged {
        alert_id: AlertId,
        supervisor_id: SupervisorId,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    PriorityUpdated {
        alert_id: AlertId,
        priority: AlertPriority,
        supervisor_id: SupervisorId,
        at: DateTime<Utc>,
    },
    NoteAdded {
        alert_id: AlertId,
        supervisor_id: SupervisorId,
        at: DateTime<Utc>,
    },
    ModeChanged {
        mode: ActiveMode,
        supervisor_id: SupervisorId,
        at: DateTime<Utc>,
    },
}

/// Audit sink. Recording is fire-and-forget: implementations must not
/// block, and nothing they do can fail the synchronization path.
pub trait ActivityLog: Send + Sync {
    fn record(&self, entry: ActivityEntry);
}

/// Emits each entry as a structured tracing event.
#[derive(Debug, Default)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, entry: ActivityEntry) {
        match entry {
            ActivityEntry::AlertAcknowledged {
                alert_id,
                supervisor_id,
                ..
            } => {
                info!(alert = %alert_id, supervisor = %supervisor_id, "alert acknowledged");
            }
            ActivityEntry::PriorityUpdated {
                alert_id,
                priority,
                supervisor_id,
                ..
            } => {
                info!(
                    alert = %alert_id,
                    priority = ?priority,
                    supervisor = %supervisor_id,
                    "priority overridden"
                );
            }
            ActivityEntry::NoteAdded {
                alert_id,
                supervisor_id,
                ..
            } => {
                info!(alert = %alert_id, supervisor = %supervisor_id, "note added");
            }
            ActivityEntry::ModeChanged {
                mode,
                supervisor_id,
                ..
            } => {
                info!(mode = ?mode, supervisor = %supervisor_id, "display mode changed");
            }
        }
    }
}
