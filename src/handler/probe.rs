use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::registry::ConnectionRegistry;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub(crate) struct ProbeStatus {
    status: String,
    message: String,
    active_sources: usize,
    active_viewers: usize,
}

impl ProbeStatus {
    fn snapshot(registry: &ConnectionRegistry) -> Self {
        Self {
            status: "connected".to_string(),
            message: "WebSocket server is running".to_string(),
            active_sources: registry.sources().len(),
            active_viewers: registry.total_viewers(),
        }
    }
}

/// Liveness probe: answers with one status message and closes.
pub(crate) async fn probe_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<ConnectionRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| answer_probe(socket, registry))
}

async fn answer_probe(mut socket: WebSocket, registry: Arc<ConnectionRegistry>) {
    let payload = match serde_json::to_string(&ProbeStatus::snapshot(&registry)) {
        Ok(payload) => payload,
        Err(e) => {
            log::error!("probe: encode status failed: {}", e);
            return;
        }
    };

    if let Err(e) = socket.send(Message::Text(payload.into())).await {
        log::error!("probe: send status failed: {}", e);
        return;
    }
    let close = CloseFrame {
        code: close_code::NORMAL,
        reason: "Test completed".into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(close))).await {
        log::debug!("probe: send close failed: {}", e);
    }
}
