//! Building blocks of the live frame relay: an external transcoder turns a
//! remote feed into an MJPEG byte stream, the demuxer cuts that stream into
//! JPEG frames and the retry controller decides how often a viewer may
//! restart the pipeline.
//!
//! ```text
//!  source ──► ffmpeg (ChildProcess) ──stdout──► FrameDemuxer ──► frames
//!                     │
//!                     └──stderr──► StderrDrain ──► log (errors only)
//! ```

pub mod demux;
pub mod drain;
pub mod error;
pub mod reconnect;
pub mod transcoder;

pub use error::RelayError;
