//! Real-time synchronization engine for the control-room dashboard.
//!
//! One `SyncEngine` per process owns the connection registry, the shared
//! operational state, the broadcast-message expiry timers, and the liveness
//! monitor. Sockets stay outside: the server attaches each accepted
//! connection, feeds inbound text frames to `handle_message`, and drains
//! the returned `Outbound` receiver into the socket.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientRole, ConnectionId, MessageId, SupervisorIdentity},
    protocol::{ServerEvent, StateSnapshot},
};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub mod activity;
mod dispatch;
mod expiry;
mod fanout;
pub mod registry;
pub mod session;
pub mod state;

pub use activity::{ActivityEntry, ActivityLog, TracingActivityLog};
pub use registry::{ConnectionRegistry, DeliveryScope, Outbound};
pub use session::{SessionValidator, StaticSessionValidator};

use expiry::ExpiryTimers;
use state::SyncState;

const HEARTBEAT_INTERVAL_SECS: u64 = 30;
const LIVENESS_TIMEOUT_SECS: u64 = 60;
const DEFAULT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the liveness monitor sweeps and pings.
    pub heartbeat_interval: Duration,
    /// Silence longer than this gets a connection evicted.
    pub liveness_timeout: Duration,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            liveness_timeout: Duration::from_secs(LIVENESS_TIMEOUT_SECS),
            outbound_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

pub struct SyncEngine {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) state: RwLock<SyncState>,
    pub(crate) expiry: ExpiryTimers,
    pub(crate) validator: Arc<dyn SessionValidator>,
    pub(crate) activity: Arc<dyn ActivityLog>,
    config: EngineConfig,
    // Handle to ourselves for the tasks we spawn (expiry timers, the
    // liveness monitor). Weak so the engine can still be dropped.
    weak_self: Weak<SyncEngine>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        validator: Arc<dyn SessionValidator>,
        activity: Arc<dyn ActivityLog>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry: ConnectionRegistry::new(),
            state: RwLock::new(SyncState::new(Utc::now())),
            expiry: ExpiryTimers::new(),
            validator,
            activity,
            config,
            weak_self: weak_self.clone(),
        })
    }

    /// Admits a newly accepted socket: registers it and queues its
    /// `welcome`. The returned receiver is the socket writer's frame
    /// source; dropping it is how a closed socket stops deliveries.
    pub async fn attach(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_depth);
        let id = self.registry.register(tx).await;
        fanout::send_to(
            &self.registry,
            id,
            &ServerEvent::Welcome {
                connection_id: id,
                server_time: Utc::now(),
            },
        )
        .await;
        info!(connection = %id, "connection attached");
        (id, rx)
    }

    /// Socket teardown. The registry hands the departed entry to exactly
    /// one caller, so the presence-loss notification fires exactly once
    /// however many paths race here.
    pub async fn detach(&self, id: ConnectionId) {
        let Some(departed) = self.registry.unregister(id).await else {
            return;
        };
        info!(connection = %id, role = ?departed.role, "connection detached");
        if let Some(role) = departed.role {
            self.announce_presence_loss(role, departed.identity.as_ref())
                .await;
        }
    }

    /// One inbound text frame from a connection.
    pub async fn handle_message(&self, id: ConnectionId, raw: &str) {
        dispatch::handle_message(self, id, raw).await;
    }

    /// Liveness evidence that is not a command (pong frames and the like).
    pub async fn touch(&self, id: ConnectionId) {
        self.registry.touch(id).await;
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Spawns the periodic liveness sweep. Abort the handle at shutdown.
    pub fn spawn_liveness_monitor(&self) -> JoinHandle<()> {
        let engine = self.weak_self.upgrade();
        tokio::spawn(async move {
            let Some(engine) = engine else {
                return;
            };
            let mut interval = tokio::time::interval(engine.config.heartbeat_interval);
            loop {
                interval.tick().await;
                engine.sweep_liveness(Instant::now()).await;
            }
        })
    }

    /// One liveness pass: evict connections silent past the timeout, ping
    /// the rest. Works off a snapshot so no lock spans the probing.
    pub async fn sweep_liveness(&self, now: Instant) {
        for (id, last_liveness) in self.registry.liveness_snapshot().await {
            let silent_for = now.saturating_duration_since(last_liveness);
            if silent_for > self.config.liveness_timeout {
                warn!(
                    connection = %id,
                    silent_secs = silent_for.as_secs(),
                    "evicting unresponsive connection"
                );
                // The peer is presumed unreachable: close the socket, no
                // protocol-level notice.
                let sender = self.registry.sender_of(id).await;
                let Some(departed) = self.registry.unregister(id).await else {
                    continue;
                };
                if let Some(sender) = sender {
                    fanout::deliver(id, &sender, Outbound::Close);
                }
                if let Some(role) = departed.role {
                    self.announce_presence_loss(role, departed.identity.as_ref())
                        .await;
                }
            } else if let Some(sender) = self.registry.sender_of(id).await {
                fanout::deliver(id, &sender, Outbound::Ping);
            }
        }
    }

    /// Queues a close frame for the connection's writer task.
    pub(crate) async fn close_connection(&self, id: ConnectionId) {
        if let Some(sender) = self.registry.sender_of(id).await {
            fanout::deliver(id, &sender, Outbound::Close);
        }
    }

    /// Arms the auto-expiry timer for a broadcast message.
    pub(crate) async fn schedule_expiry(&self, id: MessageId, after: Duration) {
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Hand off to a fresh task once the timer has fired: an abort
            // racing the deadline must not cancel the removal mid-flight.
            tokio::spawn(async move {
                engine.expire_message(id).await;
            });
        });
        self.expiry.schedule(id, task).await;
    }

    async fn expire_message(&self, id: MessageId) {
        self.expiry.forget(id).await;
        let removed = self.state.write().await.remove_message(id, Utc::now());
        if let Some(message) = removed {
            debug!(message = %message.id, "broadcast message expired");
            fanout::broadcast(
                &self.registry,
                DeliveryScope::All,
                &ServerEvent::MessageRemoved {
                    message_id: message.id,
                },
            )
            .await;
        }
    }

    /// Explicit removal. Cancels the expiry timer when it is still
    /// pending; `remove_message` decides who gets to announce the removal,
    /// so a clear racing the timer never double-announces.
    pub(crate) async fn clear_message(&self, id: MessageId, now: DateTime<Utc>) {
        self.expiry.cancel(id).await;
        let removed = self.state.write().await.remove_message(id, now);
        if let Some(message) = removed {
            debug!(message = %message.id, "broadcast message cleared");
            fanout::broadcast(
                &self.registry,
                DeliveryScope::All,
                &ServerEvent::MessageRemoved {
                    message_id: message.id,
                },
            )
            .await;
        }
    }

    pub(crate) async fn announce_presence_gain(
        &self,
        role: ClientRole,
        identity: Option<&SupervisorIdentity>,
    ) {
        match role {
            ClientRole::Display => {
                let display_count = self.registry.count_role(ClientRole::Display).await;
                fanout::broadcast(
                    &self.registry,
                    DeliveryScope::Role(ClientRole::Controller),
                    &ServerEvent::DisplayConnected { display_count },
                )
                .await;
            }
            ClientRole::Controller => {
                let Some(identity) = identity else {
                    return;
                };
                let supervisor_count = self.registry.count_role(ClientRole::Controller).await;
                fanout::broadcast(
                    &self.registry,
                    DeliveryScope::Role(ClientRole::Display),
                    &ServerEvent::SupervisorConnected {
                        supervisor_id: identity.id.clone(),
                        name: identity.name.clone(),
                        supervisor_count,
                    },
                )
                .await;
            }
        }
    }

    pub(crate) async fn announce_presence_loss(
        &self,
        role: ClientRole,
        identity: Option<&SupervisorIdentity>,
    ) {
        match role {
            ClientRole::Display => {
                let display_count = self.registry.count_role(ClientRole::Display).await;
                fanout::broadcast(
                    &self.registry,
                    DeliveryScope::Role(ClientRole::Controller),
                    &ServerEvent::DisplayDisconnected { display_count },
                )
                .await;
            }
            ClientRole::Controller => {
                let Some(identity) = identity else {
                    return;
                };
                let supervisor_count = self.registry.count_role(ClientRole::Controller).await;
                fanout::broadcast(
                    &self.registry,
                    DeliveryScope::Role(ClientRole::Display),
                    &ServerEvent::SupervisorDisconnected {
                        supervisor_id: identity.id.clone(),
                        supervisor_count,
                    },
                )
                .await;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
