//! WebSocket endpoint.
//!
//! Each socket becomes one hub subscription. A writer task drains the
//! subscription queue into the socket; a reader task handles the optional
//! `auth` message that ties the connection to a user. When either side
//! ends, the other is aborted and the subscription is removed.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::AppState;
use crate::storage::bounded;
use crate::types::{BalanceUpdate, ServerMessage, UserId};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(alias = "userId")]
    pub user_id: Option<UserId>,
}

/// Messages a client may send.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Auth {
        #[serde(alias = "userId")]
        user_id: UserId,
    },
    Ping,
}

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<UserId>) {
    let conn_id = Uuid::new_v4();
    let mut queue = state.engine.subscribe(conn_id, user_id).await;
    debug!(%conn_id, ?user_id, "WebSocket connected");
    if let Some(user_id) = user_id {
        push_balance(&state, conn_id, user_id).await;
    }

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let reader_state = state.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Auth { user_id }) => {
                        if reader_state.engine.hub().identify(conn_id, user_id) {
                            push_balance(&reader_state, conn_id, user_id).await;
                        }
                    }
                    Ok(ClientMessage::Ping) => {}
                    Err(e) => debug!(%conn_id, error = %e, "Ignoring unrecognized client message"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.engine.unsubscribe(conn_id);
    debug!(%conn_id, "WebSocket disconnected");
}

/// Send the user's current balance to one connection.
async fn push_balance(state: &AppState, conn_id: Uuid, user_id: UserId) {
    match bounded(state.timeout, state.ledger.get_user(user_id)).await {
        Ok(Some(user)) => {
            state.engine.hub().send_to(
                conn_id,
                ServerMessage::BalanceUpdate(BalanceUpdate {
                    new_balance: user.balance,
                }),
            );
        }
        Ok(None) => debug!(user_id, "WebSocket identified as unknown user"),
        Err(e) => warn!(user_id, error = %e, "Could not load balance for connection"),
    }
}
