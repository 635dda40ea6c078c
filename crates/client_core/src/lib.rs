//! Client-side sync driver for control-room consoles.
//!
//! [`ConsoleClient`] owns one supervised websocket connection to the sync
//! server: it authenticates as soon as the socket opens, forwards typed
//! commands, decodes server events onto a broadcast channel, and reconnects
//! with exponential backoff when the link drops.

use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use shared::{
    domain::{
        ActiveMode, AlertId, AlertPriority, AlertRecord, ClientRole, MessageId, MessageSeverity,
    },
    protocol::{ClientCommand, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub mod reconnect;
pub mod transport;

pub use reconnect::{ConnectionStatus, ReconnectPolicy};
pub use transport::{Connection, Transport, WsTransport};

/// Everything a console surface needs to render: connection status changes,
/// decoded server events, and client-side errors.
#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    Status(ConnectionStatus),
    Server(ServerEvent),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// http(s) base URL of the sync server.
    pub server_url: String,
    pub role: ClientRole,
    /// Required for the controller role; displays connect without one.
    pub session_id: Option<String>,
}

struct ClientState {
    status: ConnectionStatus,
    failures: u32,
    outbound: Option<mpsc::Sender<ClientCommand>>,
    driver: Option<JoinHandle<()>>,
}

pub struct ConsoleClient {
    config: ClientConfig,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ConsoleEvent>,
    // Handle to ourselves for the driver task; weak so drop still works.
    weak_self: Weak<ConsoleClient>,
}

impl ConsoleClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Self::with_transport(config, Arc::new(WsTransport))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new_cyclic(|weak_self| Self {
            config,
            policy: ReconnectPolicy::default(),
            transport,
            inner: Mutex::new(ClientState {
                status: ConnectionStatus::Idle,
                failures: 0,
                outbound: None,
                driver: None,
            }),
            events,
            weak_self: weak_self.clone(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.lock().await.status
    }

    /// Starts the connection driver. Errors if the URL is unusable or a
    /// driver is already running.
    pub async fn connect(&self) -> Result<()> {
        let url = transport::websocket_url(&self.config.server_url)?;
        let Some(client) = self.weak_self.upgrade() else {
            bail!("client is shutting down");
        };
        let mut guard = self.inner.lock().await;
        if guard.driver.as_ref().is_some_and(|task| !task.is_finished()) {
            bail!("already connected");
        }
        guard.failures = 0;
        guard.driver = Some(tokio::spawn(client.run(url)));
        Ok(())
    }

    /// Deliberate shutdown: stops the driver and disables the retry path.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.driver.take() {
            task.abort();
        }
        guard.outbound = None;
        guard.failures = 0;
        guard.status = ConnectionStatus::Idle;
        drop(guard);
        let _ = self.events.send(ConsoleEvent::Status(ConnectionStatus::Idle));
    }

    pub async fn acknowledge_alert(
        &self,
        alert_id: impl Into<AlertId>,
        reason: Option<String>,
    ) -> Result<()> {
        self.send_command(ClientCommand::AcknowledgeAlert {
            alert_id: alert_id.into(),
            reason,
        })
        .await
    }

    pub async fn update_priority(
        &self,
        alert_id: impl Into<AlertId>,
        priority: AlertPriority,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.send_command(ClientCommand::UpdatePriority {
            alert_id: alert_id.into(),
            priority,
            reason: reason.into(),
        })
        .await
    }

    pub async fn add_note(
        &self,
        alert_id: impl Into<AlertId>,
        text: impl Into<String>,
    ) -> Result<()> {
        self.send_command(ClientCommand::AddNote {
            alert_id: alert_id.into(),
            text: text.into(),
        })
        .await
    }

    pub async fn broadcast_message(
        &self,
        text: impl Into<String>,
        severity: MessageSeverity,
        duration_ms: u64,
    ) -> Result<()> {
        self.send_command(ClientCommand::BroadcastMessage {
            text: text.into(),
            severity,
            duration: duration_ms,
        })
        .await
    }

    pub async fn set_mode(&self, mode: ActiveMode) -> Result<()> {
        self.send_command(ClientCommand::SetMode { mode }).await
    }

    pub async fn update_alerts(&self, alerts: Vec<AlertRecord>) -> Result<()> {
        self.send_command(ClientCommand::UpdateAlerts { alerts })
            .await
    }

    pub async fn clear_message(&self, message_id: MessageId) -> Result<()> {
        self.send_command(ClientCommand::ClearMessage { message_id })
            .await
    }

    pub async fn request_state(&self) -> Result<()> {
        self.send_command(ClientCommand::RequestState).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send_command(ClientCommand::Ping).await
    }

    /// Commands are never queued across outages: the operator should know
    /// immediately that nothing went out.
    async fn send_command(&self, command: ClientCommand) -> Result<()> {
        let sender = {
            let guard = self.inner.lock().await;
            match (guard.status, guard.outbound.as_ref()) {
                (ConnectionStatus::Connected, Some(sender)) => sender.clone(),
                _ => return Err(anyhow!("not connected")),
            }
        };
        sender
            .send(command)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    async fn run(self: Arc<Self>, url: String) {
        loop {
            self.set_status(ConnectionStatus::Connecting).await;
            match self.transport.connect(&url).await {
                Ok(conn) => self.drive_connection(conn).await,
                Err(err) => {
                    let _ = self.events.send(ConsoleEvent::Error(format!("{err:#}")));
                }
            }
            let failures = {
                let mut guard = self.inner.lock().await;
                guard.outbound = None;
                guard.failures += 1;
                guard.failures
            };
            match self.policy.delay_for(failures) {
                Some(delay) => {
                    debug!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    self.set_status(ConnectionStatus::Backoff { attempt: failures })
                        .await;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(failures, "giving up on the sync server");
                    self.set_status(ConnectionStatus::GivingUp).await;
                    return;
                }
            }
        }
    }

    /// Pumps one live connection until it ends, for whatever reason. The
    /// caller does the failure bookkeeping.
    async fn drive_connection(&self, mut conn: Box<dyn Connection>) {
        let auth = ClientCommand::Auth {
            role: self.config.role,
            session_id: self.config.session_id.clone(),
        };
        let auth = match serde_json::to_string(&auth) {
            Ok(text) => text,
            Err(err) => {
                let _ = self
                    .events
                    .send(ConsoleEvent::Error(format!("failed to encode auth: {err}")));
                return;
            }
        };
        if let Err(err) = conn.send_text(auth).await {
            let _ = self.events.send(ConsoleEvent::Error(format!("{err:#}")));
            return;
        }

        let (tx, mut commands) = mpsc::channel::<ClientCommand>(32);
        self.inner.lock().await.outbound = Some(tx);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match serde_json::to_string(&command) {
                        Ok(text) => {
                            if let Err(err) = conn.send_text(text).await {
                                let _ = self.events.send(ConsoleEvent::Error(format!("{err:#}")));
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = self.events.send(ConsoleEvent::Error(format!(
                                "failed to encode command: {err}"
                            )));
                        }
                    }
                }
                frame = conn.recv_text() => {
                    match frame {
                        Some(Ok(text)) => self.handle_frame(&text).await,
                        Some(Err(err)) => {
                            let _ = self.events.send(ConsoleEvent::Error(err.to_string()));
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, raw: &str) {
        match serde_json::from_str::<ServerEvent>(raw) {
            Ok(event) => {
                if matches!(event, ServerEvent::AuthSuccess { .. }) {
                    {
                        let mut guard = self.inner.lock().await;
                        guard.failures = 0;
                        guard.status = ConnectionStatus::Connected;
                    }
                    let _ = self
                        .events
                        .send(ConsoleEvent::Status(ConnectionStatus::Connected));
                }
                let _ = self.events.send(ConsoleEvent::Server(event));
            }
            Err(err) => {
                let _ = self
                    .events
                    .send(ConsoleEvent::Error(format!("invalid server event: {err}")));
            }
        }
    }

    async fn set_status(&self, status: ConnectionStatus) {
        self.inner.lock().await.status = status;
        let _ = self.events.send(ConsoleEvent::Status(status));
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
