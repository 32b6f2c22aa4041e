use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
};

use crate::error::RelayError;

pub type DiagnosticStream = Box<dyn AsyncRead + Send + Unpin>;

/// Stderr collected when a process dies right after launch.
const STARTUP_STDERR_LIMIT: u64 = 2048;
const STARTUP_STDERR_WAIT: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// `None` when the process was ended by a signal
    Exited(Option<i32>),
}

impl ProcessStatus {
    pub fn describe(&self) -> String {
        match self {
            ProcessStatus::Running => "running".to_string(),
            ProcessStatus::Exited(Some(code)) => format!("exit code {}", code),
            ProcessStatus::Exited(None) => "a signal".to_string(),
        }
    }
}

/// Launches one transcoder per attempt.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(&self, source: &str) -> Result<Box<dyn TranscoderProcess>, RelayError>;
}

/// Lifecycle of a running transcoder.
#[async_trait]
pub trait TranscoderProcess: Send {
    /// Non-blocking status check.
    fn poll(&mut self) -> io::Result<ProcessStatus>;

    /// Read frame bytes from the process output. `Ok(0)` means end of stream.
    async fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// The diagnostic stream. Handed out once.
    fn take_diagnostics(&mut self) -> Option<DiagnosticStream>;

    /// Stop the process. No process is left running once this returns, and
    /// calling it on an exited process does nothing.
    async fn terminate(&mut self) -> io::Result<()>;
}

/// Output profile of the MJPEG transcode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodeProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// JPEG quality scale, 1 (best) to 31
    pub quality: u32,
    pub pixel_format: String,
    /// Socket timeout handed to ffmpeg for network inputs
    pub io_timeout: Duration,
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            width: 674,
            height: 384,
            fps: 20,
            quality: 5,
            pixel_format: "yuvj420p".to_string(),
            io_timeout: Duration::from_secs(5),
        }
    }
}

impl TranscodeProfile {
    /// ffmpeg arguments that read `source` and write MJPEG to stdout.
    pub fn args(&self, source: &str) -> Vec<String> {
        let scheme = scheme_of(source);
        let scheme = scheme.as_deref();

        let mut args = strings(&["-hide_banner", "-loglevel", "error"]);
        if matches!(scheme, Some("rtsp" | "rtsps")) {
            args.extend(strings(&["-rtsp_transport", "tcp"]));
        }
        if matches!(scheme, Some("rtsp" | "rtsps" | "http" | "https")) {
            args.push("-timeout".to_string());
            args.push(self.io_timeout.as_micros().to_string());
        }
        args.push("-i".to_string());
        args.push(source.to_string());
        args.extend(strings(&["-f", "mjpeg", "-pix_fmt"]));
        args.push(self.pixel_format.clone());
        args.push("-q:v".to_string());
        args.push(self.quality.to_string());
        args.push("-s".to_string());
        args.push(format!("{}x{}", self.width, self.height));
        args.push("-r".to_string());
        args.push(self.fps.to_string());
        args.push("pipe:1".to_string());
        args
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn scheme_of(source: &str) -> Option<String> {
    source
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
}

/// Runs the `ffmpeg` command line tool.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    profile: TranscodeProfile,
    stop_timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, profile: TranscodeProfile) -> Self {
        Self {
            program: program.into(),
            profile,
            stop_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn command(&self, source: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.profile.args(source));
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self, source: &str) -> Result<Box<dyn TranscoderProcess>, RelayError> {
        let mut cmd = self.command(source);
        log::debug!("starting transcoder: {:?}", cmd.as_std());

        let mut process = ChildProcess::spawn(&mut cmd)?.with_stop_timeout(self.stop_timeout);
        process.check_started().await?;
        log::info!(
            "transcoder started for {} (pid {:?})",
            source,
            process.id()
        );
        Ok(Box::new(process))
    }
}

/// A spawned subprocess with piped stdio, killed when dropped.
pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    exited: Option<ExitStatus>,
    stop_timeout: Duration,
}

impl ChildProcess {
    pub fn spawn(cmd: &mut Command) -> Result<Self, RelayError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            let program = cmd.as_std().get_program().to_string_lossy().into_owned();
            match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    RelayError::Unavailable(format!("{}: {}", program, e))
                }
                _ => RelayError::Startup(format!("{}: {}", program, e)),
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Startup("stdout not captured".to_string()))?;

        Ok(Self {
            stdin: child.stdin.take(),
            stderr: child.stderr.take(),
            stdout,
            child,
            exited: None,
            stop_timeout: Duration::from_secs(2),
        })
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Fail with `Startup` if the process has already exited.
    pub async fn check_started(&mut self) -> Result<(), RelayError> {
        let status = match self.poll() {
            Ok(ProcessStatus::Running) => return Ok(()),
            Ok(status) => status,
            Err(e) => return Err(RelayError::Startup(e.to_string())),
        };

        let stderr = self.read_stderr_tail().await;
        if stderr.is_empty() {
            Err(RelayError::Startup(format!("exited with {}", status.describe())))
        } else {
            Err(RelayError::Startup(format!(
                "exited with {}: {}",
                status.describe(),
                stderr
            )))
        }
    }

    async fn read_stderr_tail(&mut self) -> String {
        let Some(stderr) = self.stderr.take() else {
            return String::new();
        };
        let mut buf = Vec::new();
        let mut limited = stderr.take(STARTUP_STDERR_LIMIT);
        // the process is dead, so this only waits if a grandchild holds the pipe
        let _ = tokio::time::timeout(STARTUP_STDERR_WAIT, limited.read_to_end(&mut buf)).await;
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}

#[async_trait]
impl TranscoderProcess for ChildProcess {
    fn poll(&mut self) -> io::Result<ProcessStatus> {
        if let Some(status) = self.exited {
            return Ok(ProcessStatus::Exited(status.code()));
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.exited = Some(status);
                Ok(ProcessStatus::Exited(status.code()))
            }
            None => Ok(ProcessStatus::Running),
        }
    }

    async fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf).await
    }

    fn take_diagnostics(&mut self) -> Option<DiagnosticStream> {
        self.stderr
            .take()
            .map(|stderr| Box::new(stderr) as DiagnosticStream)
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if let ProcessStatus::Exited(_) = self.poll()? {
            self.stdin.take();
            return Ok(());
        }

        // ffmpeg finishes its output and quits on `q`
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            drop(stdin);
        }

        match tokio::time::timeout(self.stop_timeout, self.child.wait()).await {
            Ok(status) => {
                self.exited = Some(status?);
                return Ok(());
            }
            Err(_) => {
                log::warn!(
                    "transcoder {:?} still running after {:?}, killing",
                    self.child.id(),
                    self.stop_timeout
                );
            }
        }

        if let Err(e) = self.child.kill().await {
            // lost the race against a normal exit
            if self.child.try_wait()?.is_none() {
                return Err(e);
            }
        }
        self.exited = self.child.try_wait()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "transcoder_test.rs"]
mod transcoder_test;
