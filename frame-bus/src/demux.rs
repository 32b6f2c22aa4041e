use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// JPEG start-of-image marker.
pub const START_MARKER: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Incrementally cuts complete JPEG frames out of an MJPEG byte stream.
///
/// Holds at most one trailing partial frame between calls. The buffer has no
/// size limit of its own; callers check [`FrameDemuxer::pending_len`].
#[derive(Debug, Default)]
pub struct FrameDemuxer {
    buffer: BytesMut,
    scan: Scan,
}

/// Progress of the end marker search over the buffered partial frame.
#[derive(Debug, Default, Clone, Copy)]
struct Scan {
    /// Bytes already searched; non-zero only while the buffer starts with a start marker
    searched: usize,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = next_frame(&mut self.buffer, &mut self.scan) {
            frames.push(frame);
        }
        frames
    }

    /// Bytes waiting for an end marker.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan = Scan::default();
    }
}

impl Decoder for FrameDemuxer {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(next_frame(src, &mut self.scan))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = next_frame(src, &mut self.scan);
        if frame.is_none() {
            // a partial frame at end of stream can never complete
            src.clear();
            self.scan = Scan::default();
        }
        Ok(frame)
    }
}

/// Extract the first complete frame from `buf`, discarding anything that
/// cannot begin one. Leaves a partial frame in place and remembers how far it
/// was searched, so each byte is looked at a bounded number of times.
fn next_frame(buf: &mut BytesMut, scan: &mut Scan) -> Option<Bytes> {
    if scan.searched == 0 {
        let Some(start) = find_marker(buf, &START_MARKER, 0) else {
            // a trailing 0xFF may be the first half of a start marker split by the chunking
            if buf.last() == Some(&START_MARKER[0]) {
                buf.advance(buf.len() - 1);
            } else {
                buf.clear();
            }
            return None;
        };
        if start > 0 {
            buf.advance(start);
        }
    }

    // step back one byte: an end marker may straddle the previous boundary
    let from = scan
        .searched
        .saturating_sub(1)
        .max(START_MARKER.len());
    match find_marker(buf, &END_MARKER, from) {
        Some(end) => {
            *scan = Scan::default();
            Some(buf.split_to(end + END_MARKER.len()).freeze())
        }
        None => {
            scan.searched = buf.len().max(START_MARKER.len());
            None
        }
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

#[cfg(test)]
#[path = "demux_test.rs"]
mod demux_test;
