use std::sync::Mutex;

use shared::domain::{AlertId, AlertPriority, SupervisorId};

use super::*;

#[derive(Default)]
struct RecordingActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl ActivityLog for RecordingActivityLog {
    fn record(&self, entry: ActivityEntry) {
        self.entries.lock().expect("lock").push(entry);
    }
}

fn supervisor(id: &str, name: &str) -> SupervisorIdentity {
    SupervisorIdentity {
        id: id.into(),
        name: name.into(),
        permissions: vec!["triage".into()],
    }
}

fn test_engine() -> (Arc<SyncEngine>, Arc<RecordingActivityLog>) {
    let activity = Arc::new(RecordingActivityLog::default());
    let validator = StaticSessionValidator::new()
        .with_session("sess-alice", supervisor("S1", "Alice Rivera"))
        .with_session("sess-bruno", supervisor("S2", "Bruno Okafor"));
    let engine = SyncEngine::new(
        EngineConfig::default(),
        Arc::new(validator),
        activity.clone(),
    );
    (engine, activity)
}

struct TestClient {
    id: ConnectionId,
    rx: mpsc::Receiver<Outbound>,
}

impl TestClient {
    async fn attach(engine: &Arc<SyncEngine>) -> Self {
        let (id, rx) = engine.attach().await;
        let mut client = Self { id, rx };
        let ServerEvent::Welcome { connection_id, .. } = client.next_event() else {
            panic!("expected welcome");
        };
        assert_eq!(connection_id, id);
        client
    }

    async fn send(&self, engine: &Arc<SyncEngine>, raw: &str) {
        engine.handle_message(self.id, raw).await;
    }

    /// Next frame already queued; dispatch delivers synchronously.
    fn next_event(&mut self) -> ServerEvent {
        match self.rx.try_recv().expect("event queued") {
            Outbound::Event(text) => serde_json::from_str(&text).expect("decode"),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    /// Waits for a frame produced by a background task (expiry timers).
    async fn recv_event(&mut self) -> ServerEvent {
        match self.rx.recv().await.expect("channel open") {
            Outbound::Event(text) => serde_json::from_str(&text).expect("decode"),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    fn drain_frames(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn assert_idle(&mut self) {
        assert!(self.rx.try_recv().is_err(), "expected no pending frames");
    }
}

async fn auth_controller(
    engine: &Arc<SyncEngine>,
    client: &mut TestClient,
    session: &str,
) -> ServerEvent {
    client
        .send(
            engine,
            &format!(r#"{{"type":"auth","role":"controller","sessionId":"{session}"}}"#),
        )
        .await;
    let auth = client.next_event();
    let ServerEvent::StateUpdate { .. } = client.next_event() else {
        panic!("expected snapshot push after auth");
    };
    auth
}

async fn auth_display(engine: &Arc<SyncEngine>, client: &mut TestClient) -> ServerEvent {
    client
        .send(engine, r#"{"type":"auth","role":"display"}"#)
        .await;
    let auth = client.next_event();
    let ServerEvent::StateUpdate { .. } = client.next_event() else {
        panic!("expected snapshot push after auth");
    };
    auth
}

#[tokio::test]
async fn controller_auth_reports_identity_and_counts() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;

    let auth = auth_controller(&engine, &mut controller, "sess-alice").await;
    let ServerEvent::AuthSuccess {
        role,
        supervisor,
        connected_displays,
        connected_supervisors,
    } = auth
    else {
        panic!("expected auth_success, got {auth:?}");
    };
    assert_eq!(role, ClientRole::Controller);
    assert_eq!(supervisor.expect("identity").id, SupervisorId::from("S1"));
    assert_eq!(connected_displays, 0);
    assert_eq!(connected_supervisors, 1);
}

#[tokio::test]
async fn display_auth_skips_validation_and_notifies_controllers() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;

    let mut display = TestClient::attach(&engine).await;
    let auth = auth_display(&engine, &mut display).await;
    let ServerEvent::AuthSuccess {
        role, supervisor, ..
    } = auth
    else {
        panic!("expected auth_success");
    };
    assert_eq!(role, ClientRole::Display);
    assert!(supervisor.is_none());

    assert_eq!(
        controller.next_event(),
        ServerEvent::DisplayConnected { display_count: 1 }
    );
    display.assert_idle();
}

#[tokio::test]
async fn invalid_session_gets_auth_failed_and_a_server_side_close() {
    let (engine, _) = test_engine();
    let mut client = TestClient::attach(&engine).await;

    client
        .send(
            &engine,
            r#"{"type":"auth","role":"controller","sessionId":"sess-stale"}"#,
        )
        .await;

    let ServerEvent::AuthFailed { reason } = client.next_event() else {
        panic!("expected auth_failed");
    };
    assert_eq!(reason, "invalid or expired session");
    assert!(matches!(
        client.rx.try_recv().expect("close frame"),
        Outbound::Close
    ));
}

#[tokio::test]
async fn controller_auth_without_session_id_is_rejected() {
    let (engine, _) = test_engine();
    let mut client = TestClient::attach(&engine).await;

    client
        .send(&engine, r#"{"type":"auth","role":"controller"}"#)
        .await;

    let ServerEvent::AuthFailed { reason } = client.next_event() else {
        panic!("expected auth_failed");
    };
    assert_eq!(reason, "controller auth requires a sessionId");
}

#[tokio::test]
async fn display_cannot_acknowledge_and_state_is_untouched() {
    let (engine, _) = test_engine();
    let mut display = TestClient::attach(&engine).await;
    auth_display(&engine, &mut display).await;

    let before = engine.snapshot().await;
    display
        .send(
            &engine,
            r#"{"type":"acknowledge_alert","alertId":"A1","reason":"resolved"}"#,
        )
        .await;

    let ServerEvent::Error { code, message } = display.next_event() else {
        panic!("expected error event");
    };
    assert_eq!(code, shared::error::ErrorCode::Forbidden);
    assert_eq!(message, "acknowledge_alert requires the controller role");
    assert_eq!(engine.snapshot().await, before);
}

#[tokio::test]
async fn unauthenticated_mutations_are_rejected() {
    let (engine, _) = test_engine();
    let mut client = TestClient::attach(&engine).await;

    let before = engine.snapshot().await;
    client
        .send(&engine, r#"{"type":"set_mode","mode":"emergency"}"#)
        .await;

    let ServerEvent::Error { code, .. } = client.next_event() else {
        panic!("expected error event");
    };
    assert_eq!(code, shared::error::ErrorCode::Unauthorized);
    assert_eq!(engine.snapshot().await, before);
}

#[tokio::test]
async fn request_state_and_ping_work_before_auth() {
    let (engine, _) = test_engine();
    let mut client = TestClient::attach(&engine).await;

    client.send(&engine, r#"{"type":"request_state"}"#).await;
    let ServerEvent::StateUpdate { .. } = client.next_event() else {
        panic!("expected snapshot reply");
    };

    client.send(&engine, r#"{"type":"ping"}"#).await;
    assert_eq!(client.next_event(), ServerEvent::Pong);
}

#[tokio::test]
async fn malformed_frames_report_an_error_without_closing() {
    let (engine, _) = test_engine();
    let mut client = TestClient::attach(&engine).await;

    client.send(&engine, "definitely not json").await;
    let ServerEvent::Error { code, .. } = client.next_event() else {
        panic!("expected error event");
    };
    assert_eq!(code, shared::error::ErrorCode::Malformed);

    client.send(&engine, r#"{"type":"open_the_gates"}"#).await;
    let ServerEvent::Error { code, .. } = client.next_event() else {
        panic!("expected error event");
    };
    assert_eq!(code, shared::error::ErrorCode::Malformed);

    // Still connected and serviceable.
    client.send(&engine, r#"{"type":"ping"}"#).await;
    assert_eq!(client.next_event(), ServerEvent::Pong);
}

#[tokio::test]
async fn acknowledge_fans_out_once_and_is_idempotent() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;
    let mut display = TestClient::attach(&engine).await;
    auth_display(&engine, &mut display).await;
    controller.next_event(); // display_connected

    let ack = r#"{"type":"acknowledge_alert","alertId":"A1","reason":"resolved"}"#;
    controller.send(&engine, ack).await;

    for client in [&mut controller, &mut display] {
        let ServerEvent::AlertAcknowledged {
            alert_id,
            supervisor_id,
            reason,
            ..
        } = client.next_event()
        else {
            panic!("expected alert_acknowledged");
        };
        assert_eq!(alert_id, AlertId::from("A1"));
        assert_eq!(supervisor_id, SupervisorId::from("S1"));
        assert_eq!(reason.as_deref(), Some("resolved"));
    }

    // The duplicate changes nothing and is not re-broadcast.
    controller.send(&engine, ack).await;
    controller.assert_idle();
    display.assert_idle();

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.acknowledged_alerts, vec![AlertId::from("A1")]);
}

#[tokio::test]
async fn priority_updates_are_last_write_wins_across_controllers() {
    let (engine, _) = test_engine();
    let mut alice = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut alice, "sess-alice").await;
    let mut bruno = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut bruno, "sess-bruno").await;

    alice
        .send(
            &engine,
            r#"{"type":"update_priority","alertId":"A1","priority":"high","reason":"school route"}"#,
        )
        .await;
    bruno
        .send(
            &engine,
            r#"{"type":"update_priority","alertId":"A1","priority":"low","reason":"already clearing"}"#,
        )
        .await;

    let snapshot = engine.snapshot().await;
    let stored = snapshot
        .priority_overrides
        .get(&AlertId::from("A1"))
        .expect("override");
    assert_eq!(stored.priority, AlertPriority::Low);
    assert_eq!(stored.author_id, SupervisorId::from("S2"));

    // Everyone observed both writes, in dispatch order.
    for client in [&mut alice, &mut bruno] {
        let ServerEvent::PriorityUpdated { priority, .. } = client.next_event() else {
            panic!("expected priority_updated");
        };
        assert_eq!(priority, AlertPriority::High);
        let ServerEvent::PriorityUpdated { priority, .. } = client.next_event() else {
            panic!("expected priority_updated");
        };
        assert_eq!(priority, AlertPriority::Low);
    }
}

#[tokio::test]
async fn update_alerts_reaches_displays_only_and_sweeps_stale_annotations() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;
    let mut display = TestClient::attach(&engine).await;
    auth_display(&engine, &mut display).await;
    controller.next_event(); // display_connected

    controller
        .send(
            &engine,
            r#"{"type":"update_alerts","alerts":[{"id":"A1","route":"12B"}]}"#,
        )
        .await;
    controller
        .send(
            &engine,
            r#"{"type":"update_priority","alertId":"A1","priority":"critical","reason":"junction blocked"}"#,
        )
        .await;
    // Second push withdraws A1; its override must go with it.
    controller
        .send(
            &engine,
            r#"{"type":"update_alerts","alerts":[{"id":"A2","route":"7"}]}"#,
        )
        .await;

    let ServerEvent::AlertsUpdated { alerts } = display.next_event() else {
        panic!("expected alerts_updated");
    };
    assert_eq!(alerts[0].id, AlertId::from("A1"));
    let ServerEvent::PriorityUpdated { .. } = display.next_event() else {
        panic!("expected priority_updated");
    };
    let ServerEvent::AlertsUpdated { alerts } = display.next_event() else {
        panic!("expected alerts_updated");
    };
    assert_eq!(alerts[0].id, AlertId::from("A2"));

    // The controller saw the priority broadcast but no alerts_updated.
    let ServerEvent::PriorityUpdated { .. } = controller.next_event() else {
        panic!("expected priority_updated");
    };
    controller.assert_idle();

    let snapshot = engine.snapshot().await;
    assert!(snapshot.priority_overrides.is_empty());
    assert_eq!(snapshot.alerts[0].id, AlertId::from("A2"));
}

#[tokio::test(start_paused = true)]
async fn broadcast_message_expires_with_a_single_removal_event() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;

    controller
        .send(
            &engine,
            r#"{"type":"broadcast_message","text":"diversion on line 4","severity":"warning","duration":60000}"#,
        )
        .await;

    let ServerEvent::CustomMessage { message } = controller.next_event() else {
        panic!("expected custom_message");
    };
    assert_eq!(engine.snapshot().await.broadcast_messages.len(), 1);

    // The paused clock fast-forwards to the expiry deadline.
    let ServerEvent::MessageRemoved { message_id } = controller.recv_event().await else {
        panic!("expected message_removed");
    };
    assert_eq!(message_id, message.id);
    assert!(engine.snapshot().await.broadcast_messages.is_empty());

    tokio::time::advance(Duration::from_secs(120)).await;
    tokio::task::yield_now().await;
    controller.assert_idle();
}

#[tokio::test(start_paused = true)]
async fn clear_message_cancels_expiry_and_never_double_announces() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;

    controller
        .send(
            &engine,
            r#"{"type":"broadcast_message","text":"hold all departures","severity":"critical","duration":60000}"#,
        )
        .await;
    let ServerEvent::CustomMessage { message } = controller.next_event() else {
        panic!("expected custom_message");
    };
    assert_eq!(engine.expiry.pending().await, 1);

    controller
        .send(
            &engine,
            &format!(r#"{{"type":"clear_message","messageId":"{}"}}"#, message.id),
        )
        .await;
    let ServerEvent::MessageRemoved { message_id } = controller.next_event() else {
        panic!("expected message_removed");
    };
    assert_eq!(message_id, message.id);
    assert_eq!(engine.expiry.pending().await, 0);

    // Clearing the same id again is a quiet no-op.
    controller
        .send(
            &engine,
            &format!(r#"{{"type":"clear_message","messageId":"{}"}}"#, message.id),
        )
        .await;
    controller.assert_idle();

    // Long past the original deadline, the cancelled timer stays silent.
    tokio::time::advance(Duration::from_secs(120)).await;
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    controller.assert_idle();
}

#[tokio::test(start_paused = true)]
async fn liveness_sweep_evicts_the_silent_and_pings_the_rest() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;
    let mut display = TestClient::attach(&engine).await;
    auth_display(&engine, &mut display).await;
    controller.next_event(); // display_connected

    tokio::time::advance(Duration::from_secs(45)).await;
    // The display keeps talking; the controller goes quiet.
    display.send(&engine, r#"{"type":"ping"}"#).await;
    assert_eq!(display.next_event(), ServerEvent::Pong);
    tokio::time::advance(Duration::from_secs(20)).await;

    engine.sweep_liveness(Instant::now()).await;

    // 65 seconds of silence: evicted with a bare close, no notice.
    let frames = controller.drain_frames();
    assert_eq!(frames.len(), 1);
    assert!(matches!(frames[0], Outbound::Close));
    assert_eq!(engine.connection_count().await, 1);

    // The healthy display got a probe plus the presence-loss event.
    let frames = display.drain_frames();
    assert!(frames.iter().any(|f| matches!(f, Outbound::Ping)));
    let lost = frames
        .iter()
        .find_map(|f| match f {
            Outbound::Event(text) => serde_json::from_str::<ServerEvent>(text).ok(),
            _ => None,
        })
        .expect("presence event");
    assert_eq!(
        lost,
        ServerEvent::SupervisorDisconnected {
            supervisor_id: SupervisorId::from("S1"),
            supervisor_count: 0,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn any_inbound_traffic_counts_as_liveness() {
    let (engine, _) = test_engine();
    let mut client = TestClient::attach(&engine).await;

    tokio::time::advance(Duration::from_secs(61)).await;
    // A pong frame arrives just in time.
    engine.touch(client.id).await;
    engine.sweep_liveness(Instant::now()).await;

    assert_eq!(engine.connection_count().await, 1);
    let frames = client.drain_frames();
    assert!(frames.iter().all(|f| matches!(f, Outbound::Ping)));
}

#[tokio::test]
async fn reauth_in_the_same_role_refreshes_identity_quietly() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;
    let mut display = TestClient::attach(&engine).await;
    auth_display(&engine, &mut display).await;
    controller.next_event(); // display_connected

    let auth = auth_controller(&engine, &mut controller, "sess-bruno").await;
    let ServerEvent::AuthSuccess { supervisor, .. } = auth else {
        panic!("expected auth_success");
    };
    assert_eq!(supervisor.expect("identity").id, SupervisorId::from("S2"));

    // No duplicate supervisor_connected for a same-role re-auth.
    display.assert_idle();
}

#[tokio::test]
async fn role_switch_announces_loss_then_gain() {
    let (engine, _) = test_engine();
    let mut alice = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut alice, "sess-alice").await;
    let mut switcher = TestClient::attach(&engine).await;
    auth_display(&engine, &mut switcher).await;
    alice.next_event(); // display_connected
    let mut wall = TestClient::attach(&engine).await;
    auth_display(&engine, &mut wall).await;
    alice.next_event(); // display_connected

    auth_controller(&engine, &mut switcher, "sess-bruno").await;

    assert_eq!(
        alice.next_event(),
        ServerEvent::DisplayDisconnected { display_count: 1 }
    );
    assert_eq!(
        wall.next_event(),
        ServerEvent::SupervisorConnected {
            supervisor_id: SupervisorId::from("S2"),
            name: "Bruno Okafor".into(),
            supervisor_count: 2,
        }
    );
}

#[tokio::test]
async fn detach_notifies_the_opposite_role_exactly_once() {
    let (engine, _) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;
    let mut display = TestClient::attach(&engine).await;
    auth_display(&engine, &mut display).await;
    controller.next_event(); // display_connected

    engine.detach(display.id).await;
    engine.detach(display.id).await;

    assert_eq!(
        controller.next_event(),
        ServerEvent::DisplayDisconnected { display_count: 0 }
    );
    controller.assert_idle();
}

#[tokio::test]
async fn activity_log_records_supervisor_actions() {
    let (engine, activity) = test_engine();
    let mut controller = TestClient::attach(&engine).await;
    auth_controller(&engine, &mut controller, "sess-alice").await;

    controller
        .send(&engine, r#"{"type":"acknowledge_alert","alertId":"A1"}"#)
        .await;
    controller
        .send(
            &engine,
            r#"{"type":"update_priority","alertId":"A1","priority":"high","reason":"vip route"}"#,
        )
        .await;
    controller
        .send(
            &engine,
            r#"{"type":"add_note","alertId":"A1","text":"depot notified"}"#,
        )
        .await;
    controller
        .send(&engine, r#"{"type":"set_mode","mode":"maintenance"}"#)
        .await;

    let entries = activity.entries.lock().expect("lock");
    assert_eq!(entries.len(), 4);
    assert!(matches!(entries[0], ActivityEntry::AlertAcknowledged { .. }));
    assert!(matches!(entries[1], ActivityEntry::PriorityUpdated { .. }));
    assert!(matches!(entries[2], ActivityEntry::NoteAdded { .. }));
    assert!(matches!(entries[3], ActivityEntry::ModeChanged { .. }));
}

#[tokio::test]
async fn full_control_room_scenario() {
    let (engine, _) = test_engine();

    // Supervisor S1 signs in to an empty room.
    let mut controller = TestClient::attach(&engine).await;
    let auth = auth_controller(&engine, &mut controller, "sess-alice").await;
    let ServerEvent::AuthSuccess {
        connected_displays, ..
    } = auth
    else {
        panic!("expected auth_success");
    };
    assert_eq!(connected_displays, 0);

    // A display wall comes online.
    let mut display = TestClient::attach(&engine).await;
    auth_display(&engine, &mut display).await;
    assert_eq!(
        controller.next_event(),
        ServerEvent::DisplayConnected { display_count: 1 }
    );

    // S1 acknowledges an alert; both sides observe it.
    controller
        .send(
            &engine,
            r#"{"type":"acknowledge_alert","alertId":"A1","reason":"resolved"}"#,
        )
        .await;
    for client in [&mut controller, &mut display] {
        let ServerEvent::AlertAcknowledged {
            alert_id,
            supervisor_id,
            ..
        } = client.next_event()
        else {
            panic!("expected alert_acknowledged");
        };
        assert_eq!(alert_id, AlertId::from("A1"));
        assert_eq!(supervisor_id, SupervisorId::from("S1"));
    }

    // Any client's snapshot now carries the acknowledgement.
    display.send(&engine, r#"{"type":"request_state"}"#).await;
    let ServerEvent::StateUpdate { state } = display.next_event() else {
        panic!("expected snapshot reply");
    };
    assert!(state.acknowledged_alerts.contains(&AlertId::from("A1")));
}
