use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use frame_bus::RelayError;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::relay::session::{CloseStatus, FrameSink};

/// Close reasons must fit a control frame payload next to the status code.
const MAX_CLOSE_REASON: usize = 123;

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Ping cadence for viewer sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Keepalive {
    pub interval: Duration,
    /// Extra time the client gets to answer before it counts as gone
    pub timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Frame sink writing one binary message per frame.
pub struct WsFrameSink {
    sender: WsSender,
    gone: CancellationToken,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), RelayError> {
        let sender = &self.sender;
        let sent = tokio::select! {
            biased;
            _ = self.gone.cancelled() => return Err(RelayError::ClientDisconnected),
            sent = async { sender.lock().await.send(Message::Binary(frame)).await } => sent,
        };
        if let Err(e) = sent {
            log::debug!("send frame failed: {}", e);
            self.gone.cancel();
            return Err(RelayError::ClientDisconnected);
        }
        Ok(())
    }

    async fn close(&mut self, status: CloseStatus, reason: &str) {
        let frame = CloseFrame {
            code: status.code(),
            reason: truncate_reason(reason).into(),
        };
        let sender = &self.sender;
        tokio::select! {
            biased;
            _ = self.gone.cancelled() => {
                log::debug!("client gone, close frame {} not sent", status.code());
            }
            sent = async { sender.lock().await.send(Message::Close(Some(frame))).await } => {
                if let Err(e) = sent {
                    log::debug!("send close frame failed: {}", e);
                }
            }
        }
    }
}

/// Background tasks watching a viewer socket: one reads what the client
/// sends (close frames, pongs), one pings it. Either cancels `gone` when the
/// client disappears.
pub struct ClientTasks {
    gone: CancellationToken,
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ClientTasks {
    pub fn gone(&self) -> CancellationToken {
        self.gone.clone()
    }

    pub async fn stop(self) {
        self.stop.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Split a viewer socket into the frame sink and its watcher tasks.
pub fn attach(socket: WebSocket, keepalive: Keepalive) -> (WsFrameSink, ClientTasks) {
    let (sender, receiver) = socket.split();
    let sender: WsSender = Arc::new(Mutex::new(sender));
    let gone = CancellationToken::new();
    let stop = CancellationToken::new();
    let last_seen = Arc::new(StdMutex::new(Instant::now()));

    let watcher = tokio::spawn(watch_client(
        receiver,
        Arc::clone(&last_seen),
        gone.clone(),
        stop.clone(),
    ));
    let pinger = tokio::spawn(ping_client(
        Arc::clone(&sender),
        last_seen,
        keepalive,
        gone.clone(),
        stop.clone(),
    ));

    (
        WsFrameSink {
            sender,
            gone: gone.clone(),
        },
        ClientTasks {
            gone,
            stop,
            handles: vec![watcher, pinger],
        },
    )
}

async fn watch_client(
    mut receiver: SplitStream<WebSocket>,
    last_seen: Arc<StdMutex<Instant>>,
    gone: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = gone.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("client closed: {:?}", frame);
                    gone.cancel();
                    break;
                }
                Some(Ok(_)) => {
                    *last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                }
                Some(Err(e)) => {
                    log::debug!("client socket error: {}", e);
                    gone.cancel();
                    break;
                }
                None => {
                    gone.cancel();
                    break;
                }
            }
        }
    }
}

async fn ping_client(
    sender: WsSender,
    last_seen: Arc<StdMutex<Instant>>,
    keepalive: Keepalive,
    gone: CancellationToken,
    stop: CancellationToken,
) {
    let budget = keepalive.interval + keepalive.timeout;
    let silent_too_long = || {
        let silent_for = last_seen.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
        if silent_for > budget {
            log::info!("client silent for {:?}, dropping", silent_for);
            gone.cancel();
            return true;
        }
        false
    };

    let mut ticker =
        tokio::time::interval_at(Instant::now() + keepalive.interval, keepalive.interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = gone.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if silent_too_long() {
            return;
        }

        // a frame send may hold the socket while the client is not reading,
        // so keep checking for silence on every tick while waiting for it
        let mut guard = loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = gone.cancelled() => return,
                guard = sender.lock() => break guard,
                _ = ticker.tick() => {
                    if silent_too_long() {
                        return;
                    }
                }
            }
        };

        let ping = guard.send(Message::Ping(Bytes::new()));
        tokio::pin!(ping);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = gone.cancelled() => return,
                sent = &mut ping => {
                    if let Err(e) = sent {
                        log::debug!("ping failed: {}", e);
                        gone.cancel();
                        return;
                    }
                    break;
                }
                _ = ticker.tick() => {
                    if silent_too_long() {
                        return;
                    }
                }
            }
        }
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
