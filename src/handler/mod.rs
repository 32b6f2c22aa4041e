use std::sync::Arc;

use frame_bus::transcoder::Transcoder;
use tokio_util::sync::CancellationToken;

use crate::{
    registry::ConnectionRegistry,
    relay::{session::SessionSettings, sink::Keepalive},
};

pub mod probe;
pub mod stream;

/// Shared by every connection task of the viewer server.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub transcoder: Arc<dyn Transcoder>,
    pub settings: Arc<SessionSettings>,
    pub keepalive: Keepalive,
    pub shutdown: CancellationToken,
}
