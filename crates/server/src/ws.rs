use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use engine::Outbound;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::AppState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

/// Pumps one socket: a spawned writer drains the connection's outbound
/// queue while this task feeds inbound frames to the engine. Whichever
/// side ends first, `detach` runs exactly once and the writer is stopped.
async fn ws_connection(state: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut outbound) = state.engine.attach().await;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let sent = match frame {
                Outbound::Event(text) => sender.send(Message::Text(text.to_string())).await,
                Outbound::Ping => sender.send(Message::Ping(Vec::new())).await,
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => state.engine.handle_message(id, &text).await,
            Message::Ping(_) | Message::Pong(_) => state.engine.touch(id).await,
            Message::Binary(_) => {
                debug!(connection = %id, "ignoring binary frame");
                state.engine.touch(id).await;
            }
            Message::Close(_) => break,
        }
    }

    state.engine.detach(id).await;
    send_task.abort();
}
