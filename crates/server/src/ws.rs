use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::app_state::AppState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| ws_connection(state, socket))
}

/// One client session: register for broadcasts, send the current tree, then
/// apply inbound requests one at a time until the socket closes.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (session, mut outbound) = state.api.sessions.register().await;
    info!(%session, "session connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    // Failures are logged and reported to the session inside `on_connect`.
    let _ = server_api::on_connect(&state.api, session).await;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => server_api::handle_frame(&state.api, session, &text).await,
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                server_api::handle_frame(&state.api, session, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%session, %error, "websocket receive failed");
                break;
            }
        }
    }

    state.api.sessions.unregister(session).await;
    send_task.abort();
    info!(%session, "session disconnected");
}
