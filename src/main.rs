use std::{sync::Arc, time::Duration};

use frame_bus::transcoder::{FfmpegTranscoder, Transcoder};
use tokio_util::sync::CancellationToken;

use crate::{handler::AppState, registry::ConnectionRegistry};

mod api;
mod config;
mod handler;
mod registry;
mod relay;

/// How long viewers get to receive their close frame on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();

    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder: Arc<dyn Transcoder> = Arc::new(
        FfmpegTranscoder::new(config.ffmpeg.clone(), config.profile())
            .with_stop_timeout(config.stop_timeout()),
    );

    let cancel = CancellationToken::new();
    let state = AppState {
        registry: Arc::clone(&registry),
        transcoder,
        settings: Arc::new(config.session_settings()),
        keepalive: config.keepalive(),
        shutdown: cancel.clone(),
    };

    api::start_api_server(cancel.clone(), config.listen, state);
    api::start_probe_server(cancel.clone(), config.probe_listen, Arc::clone(&registry));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while !registry.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !registry.is_empty() {
        log::warn!(
            "{} viewers still attached at exit",
            registry.total_viewers()
        );
    }
    registry.clear();

    std::process::exit(0);
}
