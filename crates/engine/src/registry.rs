//! Connection bookkeeping: who is connected, with which role, how recently
//! they said anything, and the bounded queue their frames go out on.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::domain::{ClientRole, ConnectionId, SupervisorIdentity};
use tokio::{
    sync::{mpsc, RwLock},
    time::Instant,
};

/// Frame queued for a connection's socket writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-serialized event JSON, shared by every receiver of a fan-out.
    Event(Arc<str>),
    /// Protocol-level ping from the liveness monitor.
    Ping,
    /// Server-initiated shutdown; the writer sends a close frame and stops.
    Close,
}

#[derive(Debug, Clone)]
struct ConnectionEntry {
    role: Option<ClientRole>,
    identity: Option<SupervisorIdentity>,
    connected_at: DateTime<Utc>,
    last_liveness: Instant,
    sender: mpsc::Sender<Outbound>,
}

/// Role and identity of one connection, as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub role: Option<ClientRole>,
    pub identity: Option<SupervisorIdentity>,
}

/// Outcome of `set_role`. Carries what the connection was before so the
/// caller can tell a fresh auth from a re-auth from a role switch.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleAssignment {
    Updated {
        previous_role: Option<ClientRole>,
        previous_identity: Option<SupervisorIdentity>,
    },
    /// The connection is no longer registered (raced with an eviction).
    Gone,
}

/// What `unregister` tore down, returned to exactly one caller.
#[derive(Debug, Clone)]
pub struct Departed {
    pub role: Option<ClientRole>,
    pub identity: Option<SupervisorIdentity>,
    pub connected_at: DateTime<Utc>,
}

/// Which connections a fan-out reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryScope {
    All,
    Role(ClientRole),
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a connection as unauthenticated and hands back its id.
    pub async fn register(&self, sender: mpsc::Sender<Outbound>) -> ConnectionId {
        let id = ConnectionId::new();
        let entry = ConnectionEntry {
            role: None,
            identity: None,
            connected_at: Utc::now(),
            last_liveness: Instant::now(),
            sender,
        };
        self.connections.write().await.insert(id, entry);
        id
    }

    pub async fn set_role(
        &self,
        id: ConnectionId,
        role: ClientRole,
        identity: Option<SupervisorIdentity>,
    ) -> RoleAssignment {
        let mut connections = self.connections.write().await;
        match connections.get_mut(&id) {
            Some(entry) => {
                let previous_role = entry.role.replace(role);
                let previous_identity = std::mem::replace(&mut entry.identity, identity);
                RoleAssignment::Updated {
                    previous_role,
                    previous_identity,
                }
            }
            None => RoleAssignment::Gone,
        }
    }

    /// Idempotent: only the first call for an id gets the departed entry,
    /// so presence-loss notifications cannot fire twice.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Departed> {
        let entry = self.connections.write().await.remove(&id)?;
        Some(Departed {
            role: entry.role,
            identity: entry.identity,
            connected_at: entry.connected_at,
        })
    }

    /// Any inbound traffic counts as liveness evidence.
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.last_liveness = Instant::now();
        }
    }

    pub async fn profile(&self, id: ConnectionId) -> Option<ConnectionProfile> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|entry| ConnectionProfile {
                role: entry.role,
                identity: entry.identity.clone(),
            })
    }

    pub async fn list_by_role(&self, role: ClientRole) -> Vec<ConnectionId> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.role == Some(role))
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn count_role(&self, role: ClientRole) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| entry.role == Some(role))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn sender_of(&self, id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|entry| entry.sender.clone())
    }

    /// Cloned senders for a fan-out. Taken under a short read lock so no
    /// lock is held while anything is delivered.
    pub async fn senders(
        &self,
        scope: DeliveryScope,
    ) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, entry)| match scope {
                DeliveryScope::All => true,
                DeliveryScope::Role(role) => entry.role == Some(role),
            })
            .map(|(id, entry)| (*id, entry.sender.clone()))
            .collect()
    }

    /// Snapshot for the liveness sweep; probing happens with no lock held.
    pub async fn liveness_snapshot(&self) -> Vec<(ConnectionId, Instant)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.last_liveness))
            .collect()
    }
}
