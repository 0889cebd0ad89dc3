//! HTTP and WebSocket routes for the folio server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Json},
    routing::get,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex as TokioMutex, broadcast};
use tower_http::cors::CorsLayer;

use crate::error::{ServerError, ServerResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::WorkbookSession;

/// Application state shared across handlers.
pub struct AppState {
    pub session: Arc<WorkbookSession>,
}

type Sender = Arc<TokioMutex<SplitSink<WebSocket, Message>>>;

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/state", get(state_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Current workbook state.
async fn state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.session.get_state())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let sender: Sender = Arc::new(TokioMutex::new(sender));

    // Subscribe before the initial state so nothing falls in between.
    let mut rx = state.session.subscribe();
    send_message(&sender, &state.session.get_state()).await;

    let forward_sender = sender.clone();
    let session = state.session.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Client lagged by {} message(s); resending state", skipped);
                    session.get_state()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if !send_message(&forward_sender, &msg).await {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_client_message(msg, &state, &sender).await,
                Err(e) => {
                    tracing::warn!("Failed to parse client message: {} (input: {})", e, text);
                    send_message(
                        &sender,
                        &ServerMessage::error(format!("Invalid message format: {}", e)),
                    )
                    .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("{}", ServerError::WebSocket(e.to_string()));
                break;
            }
            _ => {}
        }
    }

    forward_task.abort();
}

/// Send a server message through the WebSocket. Returns false once the
/// socket is gone.
async fn send_message(sender: &Sender, msg: &ServerMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode server message: {}", e);
            return true;
        }
    };
    let mut sender = sender.lock().await;
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Handle a client message. Broadcasts go through the session; replies
/// meant for this client alone are sent directly.
/// Send a successful answer to the requester only.
async fn reply(sender: &Sender, answer: ServerResult<ServerMessage>) -> ServerResult<()> {
    let msg = answer?;
    send_message(sender, &msg).await;
    Ok(())
}

async fn handle_client_message(msg: ClientMessage, state: &Arc<AppState>, sender: &Sender) {
    let session = &state.session;
    let result = match msg {
        ClientMessage::GetState => {
            send_message(sender, &session.get_state()).await;
            Ok(())
        }

        ClientMessage::InsertCell {
            source,
            relative_to,
            before,
        } => session.insert_cell(source, relative_to, before).map(|_| ()),

        ClientMessage::UpdateCell { cell_id, source } => session.update_cell(cell_id, source),

        ClientMessage::DeleteCell { cell_id } => session.delete_cell(cell_id),

        ClientMessage::Evaluate {
            cell_id,
            evaluate_all,
        } => session.evaluate(cell_id, evaluate_all),

        ClientMessage::Abort => {
            if !session.abort() {
                send_message(sender, &ServerMessage::error("No evaluation in progress to abort"))
                    .await;
            }
            Ok(())
        }

        ClientMessage::ResetContext => session.reset_context().await.map(|_| ()),

        ClientMessage::GetGlobals => match session.globals().await {
            Ok(variables) => {
                send_message(sender, &ServerMessage::Globals { variables }).await;
                Ok(())
            }
            Err(e) => Err(e),
        },

        ClientMessage::Completions { cell_id, position } => {
            reply(sender, session.completions(cell_id, position)).await
        }

        ClientMessage::Hover { cell_id, position } => {
            reply(sender, session.hover(cell_id, position)).await
        }

        ClientMessage::SignatureHelp { cell_id, position } => {
            reply(sender, session.signature_help(cell_id, position)).await
        }
    };

    if let Err(e) = result {
        tracing::debug!("Request failed: {}", e);
        send_message(sender, &ServerMessage::error(e.client_message())).await;
    }
}

