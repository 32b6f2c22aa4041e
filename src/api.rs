use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    handler::{AppState, probe::probe_handler, stream::viewer_handler},
    registry::ConnectionRegistry,
};

/// Viewer endpoint: any path is taken as the source id.
pub(crate) fn start_api_server(cancel: CancellationToken, addr: SocketAddr, state: AppState) {
    let app = Router::new().fallback(viewer_handler).with_state(state);
    serve("viewer", cancel, addr, app);
}

pub(crate) fn start_probe_server(
    cancel: CancellationToken,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
) {
    let app = Router::new().fallback(probe_handler).with_state(registry);
    serve("probe", cancel, addr, app);
}

fn serve(name: &'static str, cancel: CancellationToken, addr: SocketAddr, app: Router) {
    tokio::spawn(async move {
        if let Err(e) = run_server(name, cancel.clone(), addr, app).await {
            log::error!("{} server: {:#}", name, e);
            cancel.cancel();
        }
    });
}

async fn run_server(
    name: &'static str,
    cancel: CancellationToken,
    addr: SocketAddr,
    app: Router,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    log::info!("{} server started on {}", name, addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(name, cancel))
        .await?;
    Ok(())
}

async fn shutdown_signal(name: &'static str, cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down {} server...", name);
}
