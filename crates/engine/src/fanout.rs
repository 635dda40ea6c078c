//! Best-effort fan-out. Each event is serialized once and pushed onto every
//! matching connection's bounded queue. A full queue skips that connection
//! and leaves its fate to the liveness monitor; a closed queue belongs to a
//! socket task that is already tearing down.

use std::sync::Arc;

use shared::{domain::ConnectionId, protocol::ServerEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::registry::{ConnectionRegistry, DeliveryScope, Outbound};

pub(crate) async fn broadcast(
    registry: &ConnectionRegistry,
    scope: DeliveryScope,
    event: &ServerEvent,
) {
    let Some(payload) = encode(event) else {
        return;
    };
    for (id, sender) in registry.senders(scope).await {
        deliver(id, &sender, Outbound::Event(Arc::clone(&payload)));
    }
}

/// Direct reply to one connection.
pub(crate) async fn send_to(registry: &ConnectionRegistry, id: ConnectionId, event: &ServerEvent) {
    let Some(payload) = encode(event) else {
        return;
    };
    if let Some(sender) = registry.sender_of(id).await {
        deliver(id, &sender, Outbound::Event(payload));
    }
}

pub(crate) fn deliver(id: ConnectionId, sender: &mpsc::Sender<Outbound>, frame: Outbound) {
    match sender.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!(connection = %id, "outbound queue full, skipping delivery");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            warn!(error = %err, "dropping event that failed to encode");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::ClientRole;

    use super::*;

    async fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> ServerEvent {
        match rx.try_recv().expect("frame queued") {
            Outbound::Event(text) => serde_json::from_str(&text).expect("decode"),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection_in_scope() {
        let registry = ConnectionRegistry::new();
        let (tx, mut controller_rx) = mpsc::channel(4);
        let controller = registry.register(tx).await;
        registry.set_role(controller, ClientRole::Controller, None).await;
        let (tx, mut display_rx) = mpsc::channel(4);
        let display = registry.register(tx).await;
        registry.set_role(display, ClientRole::Display, None).await;

        broadcast(&registry, DeliveryScope::All, &ServerEvent::Pong).await;
        assert_eq!(next_event(&mut controller_rx).await, ServerEvent::Pong);
        assert_eq!(next_event(&mut display_rx).await, ServerEvent::Pong);

        broadcast(
            &registry,
            DeliveryScope::Role(ClientRole::Display),
            &ServerEvent::DisplayConnected { display_count: 1 },
        )
        .await;
        assert!(controller_rx.try_recv().is_err());
        assert_eq!(
            next_event(&mut display_rx).await,
            ServerEvent::DisplayConnected { display_count: 1 }
        );
    }

    #[tokio::test]
    async fn full_queue_is_skipped_without_blocking_the_rest() {
        let registry = ConnectionRegistry::new();
        let (tx, mut slow_rx) = mpsc::channel(1);
        let slow = registry.register(tx).await;
        registry.set_role(slow, ClientRole::Display, None).await;
        let (tx, mut healthy_rx) = mpsc::channel(4);
        let healthy = registry.register(tx).await;
        registry.set_role(healthy, ClientRole::Display, None).await;

        // Stuff the slow consumer's queue to capacity.
        broadcast(&registry, DeliveryScope::All, &ServerEvent::Pong).await;
        // This one must be dropped for the slow consumer only.
        broadcast(
            &registry,
            DeliveryScope::All,
            &ServerEvent::DisplayConnected { display_count: 2 },
        )
        .await;

        assert_eq!(next_event(&mut slow_rx).await, ServerEvent::Pong);
        assert!(slow_rx.try_recv().is_err(), "overflow frame must be skipped");

        assert_eq!(next_event(&mut healthy_rx).await, ServerEvent::Pong);
        assert_eq!(
            next_event(&mut healthy_rx).await,
            ServerEvent::DisplayConnected { display_count: 2 }
        );
    }

    #[tokio::test]
    async fn closed_queue_is_ignored() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        let id = registry.register(tx).await;
        registry.set_role(id, ClientRole::Display, None).await;
        drop(rx);

        // Must not panic or error; the socket task already went away.
        broadcast(&registry, DeliveryScope::All, &ServerEvent::Pong).await;
        send_to(&registry, id, &ServerEvent::Pong).await;
    }
}
