use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{routing::get, Router};
use engine::{
    EngineConfig, SessionValidator, StaticSessionValidator, SyncEngine, TracingActivityLog,
};
use tracing::info;

mod config;
mod validator;
mod ws;

use config::{load_settings, parse_dev_sessions, Settings};
use validator::HttpSessionValidator;

#[derive(Clone)]
struct AppState {
    engine: Arc<SyncEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let engine = build_engine(&settings);
    let _liveness = engine.spawn_liveness_monitor();

    let app = build_router(AppState { engine });

    let addr: SocketAddr = settings.bind.parse()?;
    info!(%addr, "ops sync server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_engine(settings: &Settings) -> Arc<SyncEngine> {
    let validator: Arc<dyn SessionValidator> = match &settings.validator_url {
        Some(url) => {
            info!(validator = %url, "checking controller sessions over HTTP");
            Arc::new(HttpSessionValidator::new(url.clone()))
        }
        None => {
            let sessions = parse_dev_sessions(&settings.dev_sessions);
            info!(
                sessions = sessions.len(),
                "checking controller sessions against the static dev table"
            );
            let mut validator = StaticSessionValidator::new();
            for (session_id, identity) in sessions {
                validator.insert(session_id, identity);
            }
            Arc::new(validator)
        }
    };

    SyncEngine::new(
        EngineConfig {
            heartbeat_interval: Duration::from_secs(settings.heartbeat_secs),
            liveness_timeout: Duration::from_secs(settings.liveness_timeout_secs),
            outbound_queue_depth: settings.outbound_queue_depth,
        },
        validator,
        Arc::new(TracingActivityLog),
    )
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use shared::domain::SupervisorIdentity;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;

    use super::*;

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_engine() -> Arc<SyncEngine> {
        let validator = StaticSessionValidator::new().with_session(
            "sess-alice",
            SupervisorIdentity {
                id: "S1".into(),
                name: "Alice Rivera".into(),
                permissions: Vec::new(),
            },
        );
        SyncEngine::new(
            EngineConfig::default(),
            Arc::new(validator),
            Arc::new(TracingActivityLog),
        )
    }

    async fn start_server(engine: Arc<SyncEngine>) -> SocketAddr {
        let app = build_router(AppState { engine });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    async fn connect(addr: SocketAddr) -> Socket {
        let (socket, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        socket
    }

    async fn send_json(socket: &mut Socket, value: Value) {
        socket
            .send(Message::Text(value.to_string()))
            .await
            .expect("send");
    }

    async fn next_event(socket: &mut Socket) -> Value {
        loop {
            let frame = socket.next().await.expect("stream open").expect("frame");
            match frame {
                Message::Text(text) => return serde_json::from_str(&text).expect("event json"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Connects and authenticates, consuming the welcome, the auth reply,
    /// and the snapshot push.
    async fn auth(addr: SocketAddr, role: &str, session_id: Option<&str>) -> Socket {
        let mut socket = connect(addr).await;
        assert_eq!(next_event(&mut socket).await["type"], "welcome");

        let mut command = json!({ "type": "auth", "role": role });
        if let Some(session_id) = session_id {
            command["sessionId"] = json!(session_id);
        }
        send_json(&mut socket, command).await;

        assert_eq!(next_event(&mut socket).await["type"], "auth_success");
        assert_eq!(next_event(&mut socket).await["type"], "state_update");
        socket
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = build_router(AppState {
            engine: test_engine(),
        });
        let response = app
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn control_room_scenario_over_real_sockets() {
        let addr = start_server(test_engine()).await;

        // Controller first; its auth reply reports an empty floor.
        let mut controller = connect(addr).await;
        assert_eq!(next_event(&mut controller).await["type"], "welcome");
        send_json(
            &mut controller,
            json!({ "type": "auth", "role": "controller", "sessionId": "sess-alice" }),
        )
        .await;
        let auth_reply = next_event(&mut controller).await;
        assert_eq!(auth_reply["type"], "auth_success");
        assert_eq!(auth_reply["supervisor"]["name"], "Alice Rivera");
        assert_eq!(auth_reply["connectedDisplays"], 0);
        assert_eq!(next_event(&mut controller).await["type"], "state_update");

        // A display joining notifies the controller.
        let mut display = auth(addr, "display", None).await;
        let joined = next_event(&mut controller).await;
        assert_eq!(joined["type"], "display_connected");
        assert_eq!(joined["displayCount"], 1);

        // An acknowledgement fans out to both sides.
        send_json(
            &mut controller,
            json!({
                "type": "acknowledge_alert",
                "alertId": "A-17",
                "reason": "crew dispatched"
            }),
        )
        .await;
        let on_controller = next_event(&mut controller).await;
        let on_display = next_event(&mut display).await;
        for event in [&on_controller, &on_display] {
            assert_eq!(event["type"], "alert_acknowledged");
            assert_eq!(event["alertId"], "A-17");
            assert_eq!(event["supervisorId"], "S1");
            assert_eq!(event["reason"], "crew dispatched");
        }

        // A fresh snapshot carries the acknowledgement.
        send_json(&mut display, json!({ "type": "request_state" })).await;
        let update = next_event(&mut display).await;
        assert_eq!(update["type"], "state_update");
        assert_eq!(update["state"]["acknowledgedAlerts"], json!(["A-17"]));
    }

    #[tokio::test]
    async fn displays_cannot_acknowledge_alerts() {
        let engine = test_engine();
        let addr = start_server(engine.clone()).await;

        let mut display = auth(addr, "display", None).await;
        send_json(
            &mut display,
            json!({ "type": "acknowledge_alert", "alertId": "A-3" }),
        )
        .await;

        let error = next_event(&mut display).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "forbidden");
        assert!(engine.snapshot().await.acknowledged_alerts.is_empty());
    }
}
