//! JSON wire protocol. Every frame is a single object with a mandatory
//! `type` tag (snake_case) and its payload fields inline (camelCase).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ActiveMode, AlertId, AlertPriority, AlertRecord, ClientRole, ConnectionId, MessageId,
        MessageSeverity, SupervisorId, SupervisorIdentity,
    },
    error::{CommandError, ErrorCode},
};

/// Commands sent by controllers, displays, and not-yet-authenticated
/// connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    Auth {
        role: ClientRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AcknowledgeAlert {
        alert_id: AlertId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UpdatePriority {
        alert_id: AlertId,
        priority: AlertPriority,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    AddNote { alert_id: AlertId, text: String },
    BroadcastMessage {
        text: String,
        severity: MessageSeverity,
        /// Milliseconds until the message auto-expires.
        duration: u64,
    },
    SetMode { mode: ActiveMode },
    UpdateAlerts { alerts: Vec<AlertRecord> },
    #[serde(rename_all = "camelCase")]
    ClearMessage { message_id: MessageId },
    RequestState,
    Ping,
}

impl ClientCommand {
    /// Tag string as it appears on the wire, for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Auth { .. } => "auth",
            ClientCommand::AcknowledgeAlert { .. } => "acknowledge_alert",
            ClientCommand::UpdatePriority { .. } => "update_priority",
            ClientCommand::AddNote { .. } => "add_note",
            ClientCommand::BroadcastMessage { .. } => "broadcast_message",
            ClientCommand::SetMode { .. } => "set_mode",
            ClientCommand::UpdateAlerts { .. } => "update_alerts",
            ClientCommand::ClearMessage { .. } => "clear_message",
            ClientCommand::RequestState => "request_state",
            ClientCommand::Ping => "ping",
        }
    }
}

/// Supervisor-set priority, overriding whatever the pipeline classified.
/// Last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityOverride {
    pub priority: AlertPriority,
    pub reason: String,
    pub author_id: SupervisorId,
    pub timestamp: DateTime<Utc>,
}

/// Free-text annotation on an alert. One note per alert; replaced, never
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNote {
    pub text: String,
    pub author_id: SupervisorId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub id: MessageId,
    pub text: String,
    pub severity: MessageSeverity,
    pub author_id: SupervisorId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Consistent point-in-time copy of the synchronized state, pushed after
/// auth and on `request_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub alerts: Vec<AlertRecord>,
    pub acknowledged_alerts: Vec<AlertId>,
    pub priority_overrides: BTreeMap<AlertId, PriorityOverride>,
    pub notes: BTreeMap<AlertId, AlertNote>,
    pub broadcast_messages: Vec<BroadcastMessage>,
    pub active_mode: ActiveMode,
    pub last_updated_at: DateTime<Utc>,
}

/// Events pushed by the engine. Presence events go to the opposite role;
/// most mutations fan out to every authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Welcome {
        connection_id: ConnectionId,
        server_time: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        role: ClientRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supervisor: Option<SupervisorIdentity>,
        connected_displays: usize,
        connected_supervisors: usize,
    },
    AuthFailed { reason: String },
    StateUpdate { state: StateSnapshot },
    #[serde(rename_all = "camelCase")]
    DisplayConnected { display_count: usize },
    #[serde(rename_all = "camelCase")]
    DisplayDisconnected { display_count: usize },
    #[serde(rename_all = "camelCase")]
    SupervisorConnected {
        supervisor_id: SupervisorId,
        name: String,
        supervisor_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    SupervisorDisconnected {
        supervisor_id: SupervisorId,
        supervisor_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    AlertAcknowledged {
        alert_id: AlertId,
        supervisor_id: SupervisorId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        acknowledged_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PriorityUpdated {
        alert_id: AlertId,
        priority: AlertPriority,
        reason: String,
        supervisor_id: SupervisorId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    NoteAdded {
        alert_id: AlertId,
        text: String,
        supervisor_id: SupervisorId,
        timestamp: DateTime<Utc>,
    },
    CustomMessage { message: BroadcastMessage },
    #[serde(rename_all = "camelCase")]
    MessageRemoved { message_id: MessageId },
    AlertsUpdated { alerts: Vec<AlertRecord> },
    #[serde(rename_all = "camelCase")]
    ModeChanged {
        mode: ActiveMode,
        supervisor_id: SupervisorId,
    },
    Error { code: ErrorCode, message: String },
    Pong,
}

impl From<&CommandError> for ServerEvent {
    fn from(err: &CommandError) -> Self {
        ServerEvent::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
