use thiserror::Error;

/// Everything that can end a viewer session or one of its attempts.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request path does not name a usable source
    #[error("invalid source id: {0}")]
    Validation(String),

    /// The transcoder did not launch or exited within the startup grace period
    #[error("transcoder failed to start: {0}")]
    Startup(String),

    /// The transcoder program itself cannot be executed; retrying is pointless
    #[error("transcoder unavailable: {0}")]
    Unavailable(String),

    /// No output bytes for too many consecutive reads
    #[error("no data from source after {0} consecutive idle reads")]
    StalledSource(u32),

    /// Process exited mid-stream or reading its output failed
    #[error("transport failure: {0}")]
    Transport(String),

    /// A start marker was seen but no end marker within the buffer limit
    #[error("frame buffer exceeded {limit} bytes without an end marker")]
    FrameOverflow { limit: usize },

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("maximum reconnection attempts reached ({0})")]
    ExhaustedRetries(u32),
}

impl RelayError {
    /// Whether the failure counts against the retry budget and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Startup(_)
                | RelayError::StalledSource(_)
                | RelayError::Transport(_)
                | RelayError::FrameOverflow { .. }
        )
    }

    /// Attach the most recent transcoder diagnostic to the message, if any.
    pub fn with_diagnostic(self, line: Option<&str>) -> Self {
        let Some(line) = line else { return self };
        match self {
            RelayError::Startup(msg) => RelayError::Startup(format!("{}: {}", msg, line)),
            RelayError::Transport(msg) => RelayError::Transport(format!("{}: {}", msg, line)),
            other => other,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}
