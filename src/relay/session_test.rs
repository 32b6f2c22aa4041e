use std::{
    collections::VecDeque,
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use frame_bus::{
    RelayError,
    reconnect::RetryPolicy,
    transcoder::{DiagnosticStream, ProcessStatus, Transcoder, TranscoderProcess},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::registry::ConnectionRegistry;

const CAMERA: &str = "/rtsp%3A%2F%2Fcam.local%2Flive";
const CAMERA_SOURCE: &str = "rtsp://cam.local/live";

#[derive(Clone, Copy)]
enum Ending {
    /// Output pipe stays open and silent
    Hang,
    /// Output pipe returns empty reads
    Eof,
    /// Process exits once the chunks are used up
    Exit(i32),
}

#[derive(Clone)]
struct Script {
    chunks: Vec<Vec<u8>>,
    ending: Ending,
    startup_exit: Option<i32>,
    stderr: Option<&'static str>,
}

impl Script {
    fn streaming(chunks: Vec<Vec<u8>>, ending: Ending) -> Self {
        Self {
            chunks,
            ending,
            startup_exit: None,
            stderr: None,
        }
    }

    fn dies_at_startup(code: i32, stderr: &'static str) -> Self {
        Self {
            chunks: Vec::new(),
            ending: Ending::Eof,
            startup_exit: Some(code),
            stderr: Some(stderr),
        }
    }
}

#[derive(Clone)]
enum Plan {
    Run(Script),
    Unavailable(&'static str),
}

/// Hands out one plan per start; the last plan repeats.
struct ScriptedTranscoder {
    plans: Mutex<VecDeque<Plan>>,
    starts: AtomicU32,
    terminations: Arc<AtomicU32>,
    registry: Option<Arc<ConnectionRegistry>>,
    viewers_at_start: Mutex<Vec<usize>>,
}

impl ScriptedTranscoder {
    fn new(plans: Vec<Plan>) -> Arc<Self> {
        Arc::new(Self::build(plans, None))
    }

    fn watching(plans: Vec<Plan>, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self::build(plans, Some(registry)))
    }

    fn build(plans: Vec<Plan>, registry: Option<Arc<ConnectionRegistry>>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            starts: AtomicU32::new(0),
            terminations: Arc::new(AtomicU32::new(0)),
            registry,
            viewers_at_start: Mutex::new(Vec::new()),
        }
    }

    fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn start(&self, source: &str) -> Result<Box<dyn TranscoderProcess>, RelayError> {
        assert_eq!(source, CAMERA_SOURCE);
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(registry) = &self.registry {
            self.viewers_at_start
                .lock()
                .unwrap()
                .push(registry.viewers(source));
        }

        let plan = {
            let mut plans = self.plans.lock().unwrap();
            if plans.len() > 1 {
                plans.pop_front().unwrap()
            } else {
                plans.front().cloned().unwrap()
            }
        };
        match plan {
            Plan::Unavailable(msg) => Err(RelayError::Unavailable(msg.to_string())),
            Plan::Run(script) => Ok(Box::new(ScriptedProcess {
                chunks: script.chunks.into(),
                ending: script.ending,
                exited: script.startup_exit,
                stderr: script.stderr,
                terminations: Arc::clone(&self.terminations),
            })),
        }
    }
}

struct ScriptedProcess {
    chunks: VecDeque<Vec<u8>>,
    ending: Ending,
    exited: Option<i32>,
    stderr: Option<&'static str>,
    terminations: Arc<AtomicU32>,
}

#[async_trait]
impl TranscoderProcess for ScriptedProcess {
    fn poll(&mut self) -> std::io::Result<ProcessStatus> {
        Ok(match self.exited {
            Some(code) => ProcessStatus::Exited(Some(code)),
            None => ProcessStatus::Running,
        })
    }

    async fn read_output(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(chunk) = self.chunks.pop_front() {
            buf[..chunk.len()].copy_from_slice(&chunk);
            return Ok(chunk.len());
        }
        match self.ending {
            Ending::Hang => std::future::pending().await,
            Ending::Eof => Ok(0),
            Ending::Exit(code) => {
                self.exited = Some(code);
                Ok(0)
            }
        }
    }

    fn take_diagnostics(&mut self) -> Option<DiagnosticStream> {
        self.stderr
            .take()
            .map(|text| Box::new(Cursor::new(text.as_bytes().to_vec())) as DiagnosticStream)
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.exited.is_none() {
            self.exited = Some(0);
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Recorded {
    frames: Arc<Mutex<Vec<Bytes>>>,
    closes: Arc<Mutex<Vec<(u16, String)>>>,
}

impl Recorded {
    fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().clone()
    }

    fn closes(&self) -> Vec<(u16, String)> {
        self.closes.lock().unwrap().clone()
    }
}

struct RecordingSink {
    recorded: Recorded,
    /// Refuse frames once this many were accepted
    fail_after: Option<usize>,
    /// Fire the token once this many frames were accepted
    leave_after: Option<(usize, CancellationToken)>,
    /// Every send waits forever, like a socket whose peer stopped reading
    blocked: bool,
}

impl RecordingSink {
    fn new() -> (Self, Recorded) {
        let recorded = Recorded::default();
        let sink = Self {
            recorded: recorded.clone(),
            fail_after: None,
            leave_after: None,
            blocked: false,
        };
        (sink, recorded)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), RelayError> {
        if self.blocked {
            std::future::pending::<()>().await;
        }
        let mut frames = self.recorded.frames.lock().unwrap();
        if self.fail_after.is_some_and(|n| frames.len() >= n) {
            return Err(RelayError::ClientDisconnected);
        }
        frames.push(frame);
        if let Some((n, token)) = &self.leave_after {
            if frames.len() >= *n {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn close(&mut self, status: CloseStatus, reason: &str) {
        self.recorded
            .closes
            .lock()
            .unwrap()
            .push((status.code(), reason.to_string()));
    }
}

fn jpeg(body: &[u8]) -> Vec<u8> {
    let mut frame = vec![0xFF, 0xD8];
    frame.extend_from_slice(body);
    frame.extend_from_slice(&[0xFF, 0xD9]);
    frame
}

fn settings(max_attempts: u32) -> Arc<SessionSettings> {
    Arc::new(SessionSettings {
        retry: RetryPolicy {
            max_attempts,
            backoff: Duration::from_secs(3),
        },
        ..Default::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_missing_source_is_rejected() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        Vec::new(),
        Ending::Hang,
    ))]);
    let (sink, recorded) = RecordingSink::new();

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .run("/")
        .await;

    assert!(matches!(report.outcome, SessionOutcome::Rejected(_)));
    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.attempts, 0);
    assert_eq!(transcoder.starts(), 0);
    let closes = recorded.closes();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].0, 1008);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_forbidden_scheme_is_rejected() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        Vec::new(),
        Ending::Hang,
    ))]);
    let (sink, recorded) = RecordingSink::new();

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .run("/file%3A%2F%2F%2Fetc%2Fpasswd")
        .await;

    assert!(matches!(report.outcome, SessionOutcome::Rejected(_)));
    assert_eq!(transcoder.starts(), 0);
    assert_eq!(recorded.closes()[0].0, 1008);
}

#[tokio::test(start_paused = true)]
async fn test_frames_delivered_in_order() {
    let registry = Arc::new(ConnectionRegistry::new());
    let first = jpeg(b"first");
    let second = jpeg(b"second");
    let third = jpeg(b"third");

    let mut tail = first[3..].to_vec();
    tail.extend_from_slice(&second);
    tail.extend_from_slice(&third);
    let chunks = vec![first[..3].to_vec(), tail];

    let transcoder = ScriptedTranscoder::watching(
        vec![Plan::Run(Script::streaming(chunks, Ending::Hang))],
        registry.clone(),
    );
    let gone = CancellationToken::new();
    let (mut sink, recorded) = RecordingSink::new();
    sink.leave_after = Some((3, gone.clone()));

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .with_cancellation(gone, CancellationToken::new())
        .run(CAMERA)
        .await;

    assert_eq!(report.outcome, SessionOutcome::ClientGone);
    assert_eq!(report.frames_sent, 3);
    assert_eq!(report.attempts, 1);
    assert_eq!(
        recorded.frames(),
        vec![Bytes::from(first), Bytes::from(second), Bytes::from(third)]
    );
    // the viewer leaving is not a reason to send a close frame
    assert!(recorded.closes().is_empty());
    assert_eq!(transcoder.starts(), 1);
    assert_eq!(transcoder.terminations(), 1);
    assert_eq!(*transcoder.viewers_at_start.lock().unwrap(), vec![1]);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_ends_session_without_retry() {
    let registry = Arc::new(ConnectionRegistry::new());
    let chunks = vec![jpeg(b"a"), jpeg(b"b"), jpeg(b"c")];
    let transcoder =
        ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(chunks, Ending::Hang))]);
    let (mut sink, recorded) = RecordingSink::new();
    sink.fail_after = Some(1);

    let started = Instant::now();
    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .run(CAMERA)
        .await;

    assert_eq!(report.outcome, SessionOutcome::ClientGone);
    assert_eq!(report.frames_sent, 1);
    assert_eq!(recorded.frames().len(), 1);
    assert_eq!(transcoder.starts(), 1);
    assert_eq!(transcoder.terminations(), 1);
    // startup grace only, no backoff
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_after_three_attempts() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::dies_at_startup(
        1,
        "[tcp @ 0x55] Connection to tcp://cam.local:554 failed: Connection refused\n",
    ))]);
    let (sink, recorded) = RecordingSink::new();

    let started = Instant::now();
    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .run(CAMERA)
        .await;

    assert!(matches!(report.outcome, SessionOutcome::Exhausted(_)));
    assert_eq!(report.attempts, 3);
    assert_eq!(transcoder.starts(), 3);
    assert_eq!(transcoder.terminations(), 3);

    // three startup grace periods and two backoffs
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(9), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "{:?}", elapsed);

    let closes = recorded.closes();
    assert_eq!(closes.len(), 1);
    let (code, reason) = &closes[0];
    assert_eq!(*code, 4000);
    assert!(reason.starts_with("maximum reconnection attempts reached"));
    assert!(reason.contains("exit code 1"), "{}", reason);
    assert!(reason.contains("Connection refused"), "{}", reason);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_midstream_exit() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![
        Plan::Run(Script::streaming(vec![jpeg(b"one")], Ending::Exit(1))),
        Plan::Run(Script::streaming(vec![jpeg(b"two")], Ending::Hang)),
    ]);
    let gone = CancellationToken::new();
    let (mut sink, recorded) = RecordingSink::new();
    sink.leave_after = Some((2, gone.clone()));

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .with_cancellation(gone, CancellationToken::new())
        .run(CAMERA)
        .await;

    assert_eq!(report.outcome, SessionOutcome::ClientGone);
    assert_eq!(report.attempts, 2);
    assert_eq!(
        recorded.frames(),
        vec![Bytes::from(jpeg(b"one")), Bytes::from(jpeg(b"two"))]
    );
    assert_eq!(transcoder.starts(), 2);
    assert_eq!(transcoder.terminations(), 2);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_source() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        vec![jpeg(b"only")],
        Ending::Hang,
    ))]);
    let (sink, recorded) = RecordingSink::new();

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(1))
        .run(CAMERA)
        .await;

    assert_eq!(report.frames_sent, 1);
    assert_eq!(transcoder.starts(), 1);
    let closes = recorded.closes();
    assert_eq!(closes[0].0, 4000);
    assert!(
        closes[0].1.contains("after 11 consecutive idle reads"),
        "{}",
        closes[0].1
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_reads_count_as_stall() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        Vec::new(),
        Ending::Eof,
    ))]);
    let (sink, recorded) = RecordingSink::new();

    let started = Instant::now();
    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(1))
        .run(CAMERA)
        .await;

    assert!(matches!(report.outcome, SessionOutcome::Exhausted(_)));
    assert!(recorded.closes()[0].1.contains("idle reads"));
    // grace period plus ten short pauses, never the full read timeout
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_frame_overflow() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut runaway = vec![0xFF, 0xD8];
    runaway.extend_from_slice(&[0x42; 64]);
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        vec![jpeg(b"ok"), runaway],
        Ending::Hang,
    ))]);
    let (sink, recorded) = RecordingSink::new();
    let settings = Arc::new(SessionSettings {
        retry: RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_secs(3),
        },
        max_frame_buffer: 16,
        ..Default::default()
    });

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings)
        .run(CAMERA)
        .await;

    assert_eq!(report.frames_sent, 1);
    let closes = recorded.closes();
    assert_eq!(closes[0].0, 4000);
    assert!(closes[0].1.contains("exceeded 16 bytes"), "{}", closes[0].1);
    assert_eq!(transcoder.terminations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_transcoder_is_fatal() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Unavailable("ffmpeg: not found")]);
    let (sink, recorded) = RecordingSink::new();

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .run(CAMERA)
        .await;

    assert!(matches!(report.outcome, SessionOutcome::Fatal(_)));
    assert_eq!(report.attempts, 1);
    assert_eq!(transcoder.starts(), 1);
    let closes = recorded.closes();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].0, 1011);
    assert!(closes[0].1.contains("not found"));
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_going_away() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        vec![jpeg(b"frame")],
        Ending::Hang,
    ))]);
    let (sink, recorded) = RecordingSink::new();
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .with_cancellation(CancellationToken::new(), shutdown)
        .run(CAMERA)
        .await;

    assert_eq!(report.outcome, SessionOutcome::Shutdown);
    assert_eq!(recorded.closes()[0].0, 1001);
    assert_eq!(transcoder.starts(), 1);
    assert_eq!(transcoder.terminations(), 1);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_client_leaving_during_backoff() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::dies_at_startup(
        1,
        "rtsp://cam.local/live: Server returned 404 Not Found error\n",
    ))]);
    let (sink, recorded) = RecordingSink::new();
    let gone = CancellationToken::new();

    let trigger = gone.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .with_cancellation(gone, CancellationToken::new())
        .run(CAMERA)
        .await;

    assert_eq!(report.outcome, SessionOutcome::ClientGone);
    assert_eq!(transcoder.starts(), 1);
    assert!(recorded.closes().is_empty());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_blocked_send_ends_when_client_leaves() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        vec![jpeg(b"stuck"), jpeg(b"never")],
        Ending::Hang,
    ))]);
    let (mut sink, recorded) = RecordingSink::new();
    sink.blocked = true;
    let gone = CancellationToken::new();

    let trigger = gone.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .with_cancellation(gone, CancellationToken::new())
        .run(CAMERA)
        .await;

    assert_eq!(report.outcome, SessionOutcome::ClientGone);
    assert_eq!(report.frames_sent, 0);
    assert!(recorded.frames().is_empty());
    assert_eq!(transcoder.starts(), 1);
    assert_eq!(transcoder.terminations(), 1);
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_blocked_send_ends_on_shutdown() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transcoder = ScriptedTranscoder::new(vec![Plan::Run(Script::streaming(
        vec![jpeg(b"stuck")],
        Ending::Hang,
    ))]);
    let (mut sink, recorded) = RecordingSink::new();
    sink.blocked = true;
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        trigger.cancel();
    });

    let report = Session::new(sink, transcoder.clone(), registry.clone(), settings(3))
        .with_cancellation(CancellationToken::new(), shutdown)
        .run(CAMERA)
        .await;

    assert_eq!(report.outcome, SessionOutcome::Shutdown);
    assert_eq!(recorded.closes()[0].0, 1001);
    assert_eq!(transcoder.terminations(), 1);
    assert!(registry.is_empty());
}
