use std::{net::SocketAddr, path::PathBuf, sync::LazyLock, time::Duration};

use clap::Parser;
use frame_bus::{reconnect::RetryPolicy, transcoder::TranscodeProfile};

use crate::relay::{session::SessionSettings, sink::Keepalive};

#[derive(Parser, Debug, Clone)]
#[command(name = "exhibit-relay")]
#[command(about = "Relays live camera feeds to browsers as JPEG frames over WebSocket")]
pub struct RelayConfig {
    /// Viewer WebSocket endpoint
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8765")]
    pub listen: SocketAddr,

    /// Liveness probe WebSocket endpoint
    #[arg(long, env = "RELAY_PROBE_LISTEN", default_value = "0.0.0.0:8766")]
    pub probe_listen: SocketAddr,

    /// ffmpeg executable
    #[arg(long, env = "RELAY_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    #[arg(long, env = "RELAY_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, env = "RELAY_BACKOFF_MS", default_value_t = 3000)]
    pub backoff_ms: u64,

    #[arg(long, env = "RELAY_STARTUP_GRACE_MS", default_value_t = 1000)]
    pub startup_grace_ms: u64,

    #[arg(long, env = "RELAY_READ_TIMEOUT_MS", default_value_t = 1000)]
    pub read_timeout_ms: u64,

    #[arg(long, env = "RELAY_READ_CHUNK_SIZE", default_value_t = 32 * 1024)]
    pub read_chunk_size: usize,

    /// Consecutive empty or timed-out reads before the source counts as stalled
    #[arg(long, env = "RELAY_STALL_THRESHOLD", default_value_t = 10)]
    pub stall_threshold: u32,

    /// Largest partial frame held while waiting for an end marker
    #[arg(long, env = "RELAY_MAX_FRAME_BUFFER", default_value_t = 8 * 1024 * 1024)]
    pub max_frame_buffer: usize,

    /// Time the transcoder gets to quit before it is killed
    #[arg(long, env = "RELAY_STOP_TIMEOUT_MS", default_value_t = 2000)]
    pub stop_timeout_ms: u64,

    #[arg(long, env = "RELAY_PING_INTERVAL_SECS", default_value_t = 20)]
    pub ping_interval_secs: u64,

    #[arg(long, env = "RELAY_PING_TIMEOUT_SECS", default_value_t = 10)]
    pub ping_timeout_secs: u64,

    #[arg(long, env = "RELAY_WIDTH", default_value_t = 674)]
    pub width: u32,

    #[arg(long, env = "RELAY_HEIGHT", default_value_t = 384)]
    pub height: u32,

    #[arg(long, env = "RELAY_FPS", default_value_t = 20)]
    pub fps: u32,

    /// JPEG quality scale, 1 (best) to 31
    #[arg(long, env = "RELAY_QUALITY", default_value_t = 5)]
    pub quality: u32,

    #[arg(long, env = "RELAY_PIXEL_FORMAT", default_value = "yuvj420p")]
    pub pixel_format: String,

    /// Socket timeout for network inputs
    #[arg(long, env = "RELAY_IO_TIMEOUT_MS", default_value_t = 5000)]
    pub io_timeout_ms: u64,

    /// URL schemes a source id may use
    #[arg(
        long,
        env = "RELAY_ALLOWED_SCHEMES",
        value_delimiter = ',',
        default_value = "rtsp,rtsps,rtmp,rtmps,http,https"
    )]
    pub allowed_schemes: Vec<String>,

    /// Accept any non-empty source id instead of checking it against the scheme list
    #[arg(long, env = "RELAY_ALLOW_ANY_SOURCE")]
    pub allow_any_source: bool,
}

impl RelayConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                backoff: Duration::from_millis(self.backoff_ms),
            },
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms.max(1)),
            read_chunk_size: self.read_chunk_size.max(1),
            stall_threshold: self.stall_threshold,
            max_frame_buffer: self.max_frame_buffer,
            allowed_schemes: if self.allow_any_source {
                Vec::new()
            } else {
                self.allowed_schemes
                    .iter()
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            },
            ..SessionSettings::default()
        }
    }

    pub fn profile(&self) -> TranscodeProfile {
        TranscodeProfile {
            width: self.width,
            height: self.height,
            fps: self.fps,
            quality: self.quality,
            pixel_format: self.pixel_format.clone(),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            timeout: Duration::from_secs(self.ping_timeout_secs),
        }
    }
}

pub fn config() -> &'static RelayConfig {
    static CONFIG: LazyLock<RelayConfig> = LazyLock::new(RelayConfig::parse);
    &CONFIG
}
