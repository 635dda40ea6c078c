//! Decode, authorize, apply, notify. Every inbound frame funnels through
//! here, and the state write lock is held only for the apply step, so the
//! single-writer discipline holds no matter how many sockets are live.

use chrono::Utc;
use shared::{
    domain::{
        AlertId, AlertPriority, AlertRecord, ClientRole, ConnectionId, MessageId, MessageSeverity,
        SupervisorIdentity,
    },
    error::CommandError,
    protocol::{AlertNote, BroadcastMessage, ClientCommand, PriorityOverride, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::{
    activity::ActivityEntry,
    fanout,
    registry::{DeliveryScope, RoleAssignment},
    SyncEngine,
};

pub(crate) async fn handle_message(engine: &SyncEngine, conn: ConnectionId, raw: &str) {
    engine.registry.touch(conn).await;

    let command: ClientCommand = match serde_json::from_str(raw) {
        Ok(command) => command,
        Err(err) => {
            debug!(connection = %conn, error = %err, "rejecting undecodable frame");
            let err = CommandError::MalformedMessage(err.to_string());
            fanout::send_to(&engine.registry, conn, &ServerEvent::from(&err)).await;
            return;
        }
    };

    let name = command.name();
    let outcome = match command {
        ClientCommand::Auth { role, session_id } => {
            authenticate(engine, conn, role, session_id).await;
            Ok(())
        }
        ClientCommand::AcknowledgeAlert { alert_id, reason } => {
            acknowledge_alert(engine, conn, alert_id, reason).await
        }
        ClientCommand::UpdatePriority {
            alert_id,
            priority,
            reason,
        } => update_priority(engine, conn, alert_id, priority, reason).await,
        ClientCommand::AddNote { alert_id, text } => add_note(engine, conn, alert_id, text).await,
        ClientCommand::BroadcastMessage {
            text,
            severity,
            duration,
        } => broadcast_message(engine, conn, text, severity, duration).await,
        ClientCommand::SetMode { mode } => set_mode(engine, conn, mode).await,
        ClientCommand::UpdateAlerts { alerts } => update_alerts(engine, conn, alerts).await,
        ClientCommand::ClearMessage { message_id } => clear_message(engine, conn, message_id).await,
        ClientCommand::RequestState => {
            let state = engine.snapshot().await;
            fanout::send_to(&engine.registry, conn, &ServerEvent::StateUpdate { state }).await;
            Ok(())
        }
        ClientCommand::Ping => {
            fanout::send_to(&engine.registry, conn, &ServerEvent::Pong).await;
            Ok(())
        }
    };

    if let Err(err) = outcome {
        debug!(connection = %conn, command = name, code = ?err.code(), "command rejected");
        fanout::send_to(&engine.registry, conn, &ServerEvent::from(&err)).await;
    }
}

/// Auth handshake for both roles. Controllers go through the session
/// validator; displays only declare themselves. A failed validation gets
/// `auth_failed` and a server-side close, with no retry from this side.
async fn authenticate(
    engine: &SyncEngine,
    conn: ConnectionId,
    role: ClientRole,
    session_id: Option<String>,
) {
    let identity = match role {
        ClientRole::Controller => {
            let Some(session_id) = session_id else {
                reject_auth(engine, conn, "controller auth requires a sessionId").await;
                return;
            };
            match engine.validator.validate(&session_id).await {
                Ok(Some(identity)) => Some(identity),
                Ok(None) => {
                    reject_auth(engine, conn, "invalid or expired session").await;
                    return;
                }
                Err(err) => {
                    warn!(connection = %conn, error = %err, "session validator unreachable");
                    reject_auth(engine, conn, "session validation unavailable").await;
                    return;
                }
            }
        }
        ClientRole::Display => None,
    };

    let assignment = engine.registry.set_role(conn, role, identity.clone()).await;
    let RoleAssignment::Updated {
        previous_role,
        previous_identity,
    } = assignment
    else {
        // Evicted while the validator ran; nobody left to answer.
        return;
    };

    let connected_displays = engine.registry.count_role(ClientRole::Display).await;
    let connected_supervisors = engine.registry.count_role(ClientRole::Controller).await;
    fanout::send_to(
        &engine.registry,
        conn,
        &ServerEvent::AuthSuccess {
            role,
            supervisor: identity.clone(),
            connected_displays,
            connected_supervisors,
        },
    )
    .await;
    let state = engine.snapshot().await;
    fanout::send_to(&engine.registry, conn, &ServerEvent::StateUpdate { state }).await;

    // Presence fans out only on a genuine role transition. A re-auth in
    // the same role (reconnection, identity refresh) stays quiet.
    if previous_role != Some(role) {
        if let Some(previous_role) = previous_role {
            engine
                .announce_presence_loss(previous_role, previous_identity.as_ref())
                .await;
        }
        engine.announce_presence_gain(role, identity.as_ref()).await;
    }

    info!(connection = %conn, role = %role, "authenticated");
}

async fn reject_auth(engine: &SyncEngine, conn: ConnectionId, reason: &str) {
    info!(connection = %conn, reason, "auth rejected");
    fanout::send_to(
        &engine.registry,
        conn,
        &ServerEvent::AuthFailed {
            reason: reason.to_owned(),
        },
    )
    .await;
    engine.close_connection(conn).await;
}

async fn acknowledge_alert(
    engine: &SyncEngine,
    conn: ConnectionId,
    alert_id: AlertId,
    reason: Option<String>,
) -> Result<(), CommandError> {
    let supervisor = require_controller(engine, conn, "acknowledge_alert").await?;
    let now = Utc::now();

    let newly = engine.state.write().await.acknowledge(
        alert_id.clone(),
        supervisor.id.clone(),
        reason.as_deref(),
        now,
    );
    if !newly {
        // Idempotent repeat; nothing changed, nothing to announce.
        return Ok(());
    }

    fanout::broadcast(
        &engine.registry,
        DeliveryScope::All,
        &ServerEvent::AlertAcknowledged {
            alert_id: alert_id.clone(),
            supervisor_id: supervisor.id.clone(),
            reason: reason.clone(),
            acknowledged_at: now,
        },
    )
    .await;
    engine.activity.record(ActivityEntry::AlertAcknowledged {
        alert_id,
        supervisor_id: supervisor.id,
        reason,
        at: now,
    });
    Ok(())
}

async fn update_priority(
    engine: &SyncEngine,
    conn: ConnectionId,
    alert_id: AlertId,
    priority: AlertPriority,
    reason: String,
) -> Result<(), CommandError> {
    let supervisor = require_controller(engine, conn, "update_priority").await?;
    let now = Utc::now();

    engine.state.write().await.set_priority(
        alert_id.clone(),
        PriorityOverride {
            priority,
            reason: reason.clone(),
            author_id: supervisor.id.clone(),
            timestamp: now,
        },
    );

    fanout::broadcast(
        &engine.registry,
        DeliveryScope::All,
        &ServerEvent::PriorityUpdated {
            alert_id: alert_id.clone(),
            priority,
            reason,
            supervisor_id: supervisor.id.clone(),
            timestamp: now,
        },
    )
    .await;
    engine.activity.record(ActivityEntry::PriorityUpdated {
        alert_id,
        priority,
        supervisor_id: supervisor.id,
        at: now,
    });
    Ok(())
}

async fn add_note(
    engine: &SyncEngine,
    conn: ConnectionId,
    alert_id: AlertId,
    text: String,
) -> Result<(), CommandError> {
    let supervisor = require_controller(engine, conn, "add_note").await?;
    if text.trim().is_empty() {
        return Err(CommandError::Validation("note text must not be empty".into()));
    }
    let now = Utc::now();

    engine.state.write().await.set_note(
        alert_id.clone(),
        AlertNote {
            text: text.clone(),
            author_id: supervisor.id.clone(),
            timestamp: now,
        },
    );

    fanout::broadcast(
        &engine.registry,
        DeliveryScope::All,
        &ServerEvent::NoteAdded {
            alert_id: alert_id.clone(),
            text,
            supervisor_id: supervisor.id.clone(),
            timestamp: now,
        },
    )
    .await;
    engine.activity.record(ActivityEntry::NoteAdded {
        alert_id,
        supervisor_id: supervisor.id,
        at: now,
    });
    Ok(())
}

async fn broadcast_message(
    engine: &SyncEngine,
    conn: ConnectionId,
    text: String,
    severity: MessageSeverity,
    duration_ms: u64,
) -> Result<(), CommandError> {
    let supervisor = require_controller(engine, conn, "broadcast_message").await?;
    if text.trim().is_empty() {
        return Err(CommandError::Validation(
            "message text must not be empty".into(),
        ));
    }
    let now = Utc::now();

    let message = BroadcastMessage {
        id: MessageId::new(),
        text,
        severity,
        author_id: supervisor.id,
        created_at: now,
        expires_at: now + chrono::Duration::milliseconds(duration_ms as i64),
    };
    engine.state.write().await.push_message(message.clone());
    engine
        .schedule_expiry(message.id, std::time::Duration::from_millis(duration_ms))
        .await;

    fanout::broadcast(
        &engine.registry,
        DeliveryScope::All,
        &ServerEvent::CustomMessage { message },
    )
    .await;
    Ok(())
}

async fn set_mode(
    engine: &SyncEngine,
    conn: ConnectionId,
    mode: shared::domain::ActiveMode,
) -> Result<(), CommandError> {
    let supervisor = require_controller(engine, conn, "set_mode").await?;
    let now = Utc::now();

    engine.state.write().await.set_mode(mode, now);

    fanout::broadcast(
        &engine.registry,
        DeliveryScope::All,
        &ServerEvent::ModeChanged {
            mode,
            supervisor_id: supervisor.id.clone(),
        },
    )
    .await;
    engine.activity.record(ActivityEntry::ModeChanged {
        mode,
        supervisor_id: supervisor.id,
        at: now,
    });
    Ok(())
}

async fn update_alerts(
    engine: &SyncEngine,
    conn: ConnectionId,
    alerts: Vec<AlertRecord>,
) -> Result<(), CommandError> {
    require_controller(engine, conn, "update_alerts").await?;
    let now = Utc::now();

    let swept = engine.state.write().await.replace_alerts(alerts.clone(), now);
    if swept.removed_overrides > 0 || swept.removed_notes > 0 {
        debug!(
            overrides = swept.removed_overrides,
            notes = swept.removed_notes,
            "swept annotations for withdrawn alerts"
        );
    }

    fanout::broadcast(
        &engine.registry,
        DeliveryScope::Role(ClientRole::Display),
        &ServerEvent::AlertsUpdated { alerts },
    )
    .await;
    Ok(())
}

async fn clear_message(
    engine: &SyncEngine,
    conn: ConnectionId,
    message_id: MessageId,
) -> Result<(), CommandError> {
    require_controller(engine, conn, "clear_message").await?;
    // An id that is already gone is a benign race with expiry, not an
    // error; whoever removed it first has announced it.
    engine.clear_message(message_id, Utc::now()).await;
    Ok(())
}

async fn require_controller(
    engine: &SyncEngine,
    conn: ConnectionId,
    command: &str,
) -> Result<SupervisorIdentity, CommandError> {
    let profile = engine
        .registry
        .profile(conn)
        .await
        .ok_or_else(|| CommandError::Internal("connection is not registered".into()))?;
    match profile.role {
        Some(ClientRole::Controller) => profile.identity.ok_or_else(|| {
            CommandError::Internal("controller connection has no identity".into())
        }),
        Some(ClientRole::Display) => Err(CommandError::AuthorizationViolation(format!(
            "{command} requires the controller role"
        ))),
        None => Err(CommandError::AuthenticationRequired(format!(
            "{command} requires authentication as a controller"
        ))),
    }
}
