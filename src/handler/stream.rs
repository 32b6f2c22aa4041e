use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    http::Uri,
    response::Response,
};

use crate::{
    handler::AppState,
    relay::{session::Session, sink},
};

/// Every path on the viewer server is a URL-encoded source id.
pub(crate) async fn viewer_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    uri: Uri,
) -> Response {
    // sources passed unencoded may carry their own query string
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    ws.on_upgrade(move |socket| serve_viewer(socket, path, state))
}

async fn serve_viewer(socket: WebSocket, path: String, state: AppState) {
    let (frame_sink, tasks) = sink::attach(socket, state.keepalive);

    let report = Session::new(
        frame_sink,
        Arc::clone(&state.transcoder),
        Arc::clone(&state.registry),
        Arc::clone(&state.settings),
    )
    .with_cancellation(tasks.gone(), state.shutdown.child_token())
    .run(&path)
    .await;

    tasks.stop().await;
    log::debug!(
        "viewer for {:?} closed: {:?} after {} attempts, {} frames",
        path,
        report.outcome,
        report.attempts,
        report.frames_sent
    );
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;
