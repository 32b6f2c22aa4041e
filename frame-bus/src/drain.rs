use std::{collections::VecDeque, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Number of error lines kept for the failure reason.
const KEEP_LINES: usize = 8;
/// Longest diagnostic line read in one piece; longer lines are split.
const MAX_LINE: usize = 4096;
/// How long `stop` waits for the pipe to hit EOF before cancelling.
const LINGER: Duration = Duration::from_millis(200);

/// Background consumer of a transcoder's diagnostic stream.
///
/// Keeps the stderr pipe empty so the process never blocks on it, logs the
/// lines that report errors and throws everything else away.
pub struct StderrDrain {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Vec<String>>>,
}

impl StderrDrain {
    pub fn spawn<R>(reader: R, source: &str) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let source = source.to_string();

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut kept = VecDeque::with_capacity(KEEP_LINES);
            let mut line = Vec::new();
            loop {
                line.clear();
                let mut limited = (&mut reader).take(MAX_LINE as u64);
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        break;
                    }
                    read = limited.read_until(b'\n', &mut line) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&line);
                            let text = text.trim();
                            if is_error_line(text) {
                                log::error!("ffmpeg [{}]: {}", source, text);
                                if kept.len() == KEEP_LINES {
                                    kept.pop_front();
                                }
                                kept.push_back(text.to_string());
                            }
                        }
                        Err(e) => {
                            log::warn!("stderr drain [{}]: read failed: {}", source, e);
                            break;
                        }
                    }
                }
            }
            kept.into()
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the drain and wait for it. Returns the retained error lines,
    /// oldest first.
    pub async fn stop(mut self) -> Vec<String> {
        let Some(mut handle) = self.handle.take() else {
            return Vec::new();
        };

        // the process is normally gone already, give the pipe a moment to flush
        if let Ok(joined) = tokio::time::timeout(LINGER, &mut handle).await {
            return joined.unwrap_or_else(|e| {
                log::warn!("stderr drain task failed: {}", e);
                Vec::new()
            });
        }

        self.cancel.cancel();
        handle.await.unwrap_or_else(|e| {
            log::warn!("stderr drain task failed: {}", e);
            Vec::new()
        })
    }
}

impl Drop for StderrDrain {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Whether a diagnostic line reports an error or failure.
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error") || lower.contains("fail")
}
