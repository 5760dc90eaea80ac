use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use campfire_core::{ClientMessage, ErrorKind, ServerMessage, TransportId};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::reconcile::{Intent, LeaveCause};
use crate::AppState;

/// WebSocket upgrade handler. Each accepted socket becomes one transport
/// identity for its whole lifetime; a reconnect is a brand-new identity.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let transport_id: TransportId = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.registry.register(transport_id);

    let writer_transport = transport_id;
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(transport = %writer_transport, "writer task finished");
    });

    debug!(transport = %transport_id, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(transport = %transport_id, %err, "websocket error");
                break;
            }
        };

        match message {
            Message::Text(text) => dispatch_frame(&state, transport_id, text.as_bytes()).await,
            // Some clients send JSON in binary frames; accept both.
            Message::Binary(data) => dispatch_frame(&state, transport_id, &data).await,
            Message::Close(_) => {
                debug!(transport = %transport_id, "client closed websocket");
                break;
            }
            _ => {}
        }
    }

    // Reaching here with a binding still in place means the transport
    // died without an explicit leave: surface it as a disconnect signal.
    if state.registry.resolve(transport_id).is_some() {
        if let Err(err) = state
            .engine
            .apply(Intent::Leave {
                transport_id,
                cause: LeaveCause::TransportClosed,
            })
            .await
        {
            debug!(transport = %transport_id, %err, "disconnect cleanup");
        }
    }
    state.registry.unregister(transport_id);
    writer.abort();

    debug!(transport = %transport_id, "websocket disconnected");
}

async fn dispatch_frame(state: &AppState, transport_id: TransportId, raw: &[u8]) {
    // Any inbound traffic counts as liveness.
    state.registry.touch(transport_id);

    let message = match serde_json::from_slice::<ClientMessage>(raw) {
        Ok(message) => message,
        Err(err) => {
            warn!(transport = %transport_id, %err, "unparseable client frame");
            let _ = state
                .registry
                .send(
                    transport_id,
                    ServerMessage::Error {
                        kind: ErrorKind::Protocol,
                        message: format!("invalid message format: {err}"),
                    },
                )
                .await;
            return;
        }
    };

    let intent = match message {
        ClientMessage::Ping => {
            let _ = state.registry.send(transport_id, ServerMessage::Pong).await;
            return;
        }
        ClientMessage::Join {
            passphrase,
            display_name,
            resume_token,
        } => Intent::Join {
            transport_id,
            passphrase,
            display_name,
            resume_token,
        },
        ClientMessage::Leave => Intent::Leave {
            transport_id,
            cause: LeaveCause::Explicit,
        },
        ClientMessage::Sync => Intent::Sync { transport_id },
        ClientMessage::Mutate { mutation } => Intent::Mutate {
            transport_id,
            mutation,
        },
    };

    if let Err(err) = state.engine.apply(intent).await {
        let _ = state
            .registry
            .send(
                transport_id,
                ServerMessage::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            )
            .await;
    }
}
