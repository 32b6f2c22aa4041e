//! Per-viewer state machine:
//!
//! ```text
//! Init ──► Validating ──► Streaming ◄──► Reconnecting
//!               │             │               │
//!               └─────────────┴───────────────┴──► Closed
//! ```
//!
//! Each attempt owns one transcoder process and one stderr drain; both are
//! released before the attempt returns, whatever ended it.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use frame_bus::{
    RelayError,
    demux::FrameDemuxer,
    drain::StderrDrain,
    reconnect::{Reconnect, RetryPolicy},
    transcoder::{ProcessStatus, Transcoder, TranscoderProcess},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{registry::ConnectionRegistry, relay::source::source_from_path};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// How a session ends towards the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseStatus {
    /// The source id was missing or refused
    PolicyViolation,
    /// The transcoder cannot run at all
    InternalError,
    /// The retry budget is used up
    RetriesExhausted,
    /// The server is shutting down
    GoingAway,
}

impl CloseStatus {
    pub fn code(&self) -> u16 {
        match self {
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::InternalError => 1011,
            CloseStatus::RetriesExhausted => 4000,
            CloseStatus::GoingAway => 1001,
        }
    }
}

/// Where frames go. Implemented by the WebSocket connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Deliver one frame. An error means the client is gone.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), RelayError>;

    async fn close(&mut self, status: CloseStatus, reason: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Validating,
    Streaming,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Validating => "validating",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub retry: RetryPolicy,
    /// Time a fresh transcoder gets before it must still be running
    pub startup_grace: Duration,
    pub read_timeout: Duration,
    pub read_chunk_size: usize,
    /// Consecutive idle reads tolerated before the source counts as stalled
    pub stall_threshold: u32,
    /// Pause after an empty read
    pub idle_backoff: Duration,
    pub max_frame_buffer: usize,
    /// Empty means any non-empty source id is accepted
    pub allowed_schemes: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            startup_grace: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            read_chunk_size: 32 * 1024,
            stall_threshold: 10,
            idle_backoff: Duration::from_millis(100),
            max_frame_buffer: 8 * 1024 * 1024,
            allowed_schemes: ["rtsp", "rtsps", "rtmp", "rtmps", "http", "https"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Rejected(String),
    ClientGone,
    Shutdown,
    Exhausted(String),
    Fatal(String),
}

#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    pub attempts: u32,
    pub frames_sent: u64,
    pub outcome: SessionOutcome,
}

enum AttemptEnd {
    ClientGone,
    Shutdown,
    Failed(RelayError),
}

pub struct Session<S> {
    sink: S,
    transcoder: Arc<dyn Transcoder>,
    registry: Arc<ConnectionRegistry>,
    settings: Arc<SessionSettings>,
    client_gone: CancellationToken,
    shutdown: CancellationToken,
    state: SessionState,
    attempts: u32,
    frames_sent: u64,
}

impl<S: FrameSink> Session<S> {
    pub fn new(
        sink: S,
        transcoder: Arc<dyn Transcoder>,
        registry: Arc<ConnectionRegistry>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            sink,
            transcoder,
            registry,
            settings,
            client_gone: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            state: SessionState::Init,
            attempts: 0,
            frames_sent: 0,
        }
    }

    /// `client_gone` fires when the viewer leaves, `shutdown` when the server stops.
    pub fn with_cancellation(
        mut self,
        client_gone: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        self.client_gone = client_gone;
        self.shutdown = shutdown;
        self
    }

    pub async fn run(mut self, path: &str) -> SessionReport {
        self.set_state(SessionState::Validating);
        let source = match source_from_path(path, &self.settings.allowed_schemes) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("rejecting viewer for {:?}: {}", path, e);
                let reason = e.to_string();
                self.sink
                    .close(CloseStatus::PolicyViolation, &reason)
                    .await;
                return self.finish(SessionOutcome::Rejected(reason));
            }
        };

        let guard = self.registry.register(&source);
        log::info!(
            "{} watching {} ({} viewers)",
            guard.id(),
            source,
            self.registry.viewers(&source)
        );

        let outcome = self.stream(&source).await;
        match &outcome {
            SessionOutcome::Exhausted(reason) => {
                self.sink
                    .close(CloseStatus::RetriesExhausted, reason)
                    .await;
            }
            SessionOutcome::Fatal(reason) => {
                self.sink.close(CloseStatus::InternalError, reason).await;
            }
            SessionOutcome::Shutdown => {
                self.sink
                    .close(CloseStatus::GoingAway, "server shutting down")
                    .await;
            }
            SessionOutcome::ClientGone | SessionOutcome::Rejected(_) => {}
        }

        log::info!(
            "{} left {} after {} attempts, {} frames: {:?}",
            guard.id(),
            source,
            self.attempts,
            self.frames_sent,
            outcome
        );
        drop(guard);
        self.finish(outcome)
    }

    async fn stream(&mut self, source: &str) -> SessionOutcome {
        let mut reconnect = Reconnect::new(self.settings.retry);
        loop {
            self.set_state(SessionState::Streaming);
            self.attempts += 1;

            let err = match self.attempt(source).await {
                AttemptEnd::ClientGone => return SessionOutcome::ClientGone,
                AttemptEnd::Shutdown => return SessionOutcome::Shutdown,
                AttemptEnd::Failed(err) => err,
            };

            if !err.is_retryable() {
                log::error!("{}: {}", source, err);
                return SessionOutcome::Fatal(err.to_string());
            }

            if !reconnect.record_failure() {
                log::error!(
                    "{}: giving up after {} failed attempts: {}",
                    source,
                    reconnect.failures(),
                    err
                );
                return SessionOutcome::Exhausted(format!(
                    "maximum reconnection attempts reached: {}",
                    err
                ));
            }

            log::warn!(
                "{}: attempt {}/{} failed: {}; retrying in {:?}",
                source,
                reconnect.failures(),
                reconnect.policy().max_attempts,
                err,
                reconnect.backoff()
            );
            self.set_state(SessionState::Reconnecting);
            tokio::select! {
                _ = self.client_gone.cancelled() => return SessionOutcome::ClientGone,
                _ = self.shutdown.cancelled() => return SessionOutcome::Shutdown,
                _ = tokio::time::sleep(reconnect.backoff()) => {}
            }
        }
    }

    async fn attempt(&mut self, source: &str) -> AttemptEnd {
        let mut process = match self.transcoder.start(source).await {
            Ok(process) => process,
            Err(e) => return AttemptEnd::Failed(e),
        };
        let drain = process
            .take_diagnostics()
            .map(|stderr| StderrDrain::spawn(stderr, source));

        let end = self.pump(process.as_mut()).await;

        if let Err(e) = process.terminate().await {
            log::error!("{}: failed to stop transcoder: {}", source, e);
        }
        drop(process);
        let diagnostics = match drain {
            Some(drain) => drain.stop().await,
            None => Vec::new(),
        };

        match end {
            AttemptEnd::Failed(err) => {
                AttemptEnd::Failed(err.with_diagnostic(diagnostics.last().map(String::as_str)))
            }
            other => other,
        }
    }

    /// Move frames from the process to the client until something ends the attempt.
    async fn pump(&mut self, process: &mut dyn TranscoderProcess) -> AttemptEnd {
        tokio::select! {
            _ = self.client_gone.cancelled() => return AttemptEnd::ClientGone,
            _ = self.shutdown.cancelled() => return AttemptEnd::Shutdown,
            _ = tokio::time::sleep(self.settings.startup_grace) => {}
        }
        match process.poll() {
            Ok(ProcessStatus::Running) => {}
            Ok(status) => {
                return AttemptEnd::Failed(RelayError::Startup(format!(
                    "exited during startup with {}",
                    status.describe()
                )));
            }
            Err(e) => return AttemptEnd::Failed(e.into()),
        }

        let mut demuxer = FrameDemuxer::new();
        let mut buf = vec![0u8; self.settings.read_chunk_size];
        let mut idle_reads = 0u32;
        let mut window_start = Instant::now();
        let mut window_frames = 0u64;

        loop {
            match process.poll() {
                Ok(ProcessStatus::Running) => {}
                Ok(status) => {
                    return AttemptEnd::Failed(RelayError::Transport(format!(
                        "transcoder exited mid-stream with {}",
                        status.describe()
                    )));
                }
                Err(e) => return AttemptEnd::Failed(e.into()),
            }

            let read = tokio::select! {
                biased;
                _ = self.client_gone.cancelled() => return AttemptEnd::ClientGone,
                _ = self.shutdown.cancelled() => return AttemptEnd::Shutdown,
                read = tokio::time::timeout(self.settings.read_timeout, process.read_output(&mut buf)) => read,
            };

            let timed_out = read.is_err();
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return AttemptEnd::Failed(e.into()),
                // a slow read is only a reason to look at the process again
                Err(_) => 0,
            };

            if n == 0 {
                idle_reads += 1;
                if idle_reads > self.settings.stall_threshold {
                    return AttemptEnd::Failed(RelayError::StalledSource(idle_reads));
                }
                if !timed_out {
                    tokio::select! {
                        _ = self.client_gone.cancelled() => return AttemptEnd::ClientGone,
                        _ = self.shutdown.cancelled() => return AttemptEnd::Shutdown,
                        _ = tokio::time::sleep(self.settings.idle_backoff) => {}
                    }
                }
                continue;
            }
            idle_reads = 0;

            for frame in demuxer.push(&buf[..n]) {
                // a client that stopped reading can block the send indefinitely
                let sent = tokio::select! {
                    biased;
                    _ = self.client_gone.cancelled() => return AttemptEnd::ClientGone,
                    _ = self.shutdown.cancelled() => return AttemptEnd::Shutdown,
                    sent = self.sink.send_frame(frame) => sent,
                };
                if sent.is_err() {
                    return AttemptEnd::ClientGone;
                }
                self.frames_sent += 1;
                window_frames += 1;
            }

            if demuxer.pending_len() > self.settings.max_frame_buffer {
                return AttemptEnd::Failed(RelayError::FrameOverflow {
                    limit: self.settings.max_frame_buffer,
                });
            }

            let elapsed = window_start.elapsed();
            if elapsed >= STATS_INTERVAL {
                log::debug!(
                    "{} frames in {:.1}s ({:.1} fps)",
                    window_frames,
                    elapsed.as_secs_f64(),
                    window_frames as f64 / elapsed.as_secs_f64()
                );
                window_start = Instant::now();
                window_frames = 0;
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!("session {} -> {}", self.state, state);
        self.state = state;
    }

    fn finish(mut self, outcome: SessionOutcome) -> SessionReport {
        self.set_state(SessionState::Closed);
        SessionReport {
            state: self.state,
            attempts: self.attempts,
            frames_sent: self.frames_sent,
            outcome,
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
