//! # Body Decoders
//!
//! Reads a response body from a polled [`BodyStream`] into an owned buffer.
//!
//! Three shapes of body are handled:
//! - **Declared length**: read until exactly `n` bytes have arrived.
//! - **Chunked**: hex size line, data, CRLF, repeated until a zero-size chunk.
//! - **Until close**: no length and no chunking, read until the peer hangs up.
//!
//! Every read is bounded by a rolling inactivity deadline that resets on each
//! successful read, so a slow but steady transfer is never cut off while a
//! stalled one is abandoned. When no data is ready but the connection is
//! still up the reader sleeps for a short poll interval and tries again.
//!
//! The payload ceiling is enforced while reading. A declared length above the
//! ceiling is rejected before any allocation; chunk sizes are never used to
//! reserve memory.

use std::io;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Size of a single transfer read.
pub const TRANSFER_CHUNK: usize = 256;

/// Longest chunk-size line accepted, including extensions and CRLF.
const MAX_SIZE_LINE: usize = 32;

/// A connection body that can be polled without blocking indefinitely.
pub trait BodyStream {
    /// Read whatever is available right now.
    ///
    /// `Ok(0)` means nothing is ready; use [`BodyStream::is_connected`] to tell
    /// an idle connection from a closed one.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether the peer may still send more data.
    fn is_connected(&self) -> bool;
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    #[error("no data for {idle:?} after {received} bytes")]
    Stalled { received: usize, idle: Duration },

    #[error("connection closed after {received} of {expected:?} bytes")]
    Closed {
        received: usize,
        expected: Option<usize>,
    },

    #[error("malformed chunk size line {0:?}")]
    MalformedChunkSize(String),

    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// How the body is framed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFraming {
    Length(usize),
    Chunked,
    UntilClose,
}

/// Timing knobs for polled reads.
#[derive(Clone, Copy, Debug)]
pub struct ReadTimeouts {
    /// Maximum time without any data before giving up.
    pub inactivity: Duration,
    /// Sleep between polls while the connection is idle.
    pub poll_interval: Duration,
}

impl Default for ReadTimeouts {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Polling reader with a rolling inactivity deadline.
struct PolledReader<'a> {
    stream: &'a mut dyn BodyStream,
    timeouts: ReadTimeouts,
    deadline: Instant,
    received: usize,
}

impl<'a> PolledReader<'a> {
    fn new(stream: &'a mut dyn BodyStream, timeouts: ReadTimeouts) -> Self {
        Self {
            stream,
            timeouts,
            deadline: Instant::now() + timeouts.inactivity,
            received: 0,
        }
    }

    /// Read at least one byte, or `Ok(0)` once the peer has closed.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        loop {
            let n = self.stream.read_available(buf)?;
            if n > 0 {
                self.deadline = Instant::now() + self.timeouts.inactivity;
                return Ok(n);
            }
            if !self.stream.is_connected() {
                return Ok(0);
            }
            if Instant::now() >= self.deadline {
                return Err(StreamError::Stalled {
                    received: self.received,
                    idle: self.timeouts.inactivity,
                });
            }
            thread::sleep(self.timeouts.poll_interval);
        }
    }

    /// Append exactly `count` bytes to `out`.
    fn read_exact_into(
        &mut self,
        count: usize,
        out: &mut Vec<u8>,
        expected: Option<usize>,
    ) -> Result<(), StreamError> {
        let mut buf = [0u8; TRANSFER_CHUNK];
        let mut remaining = count;
        while remaining > 0 {
            let want = remaining.min(TRANSFER_CHUNK);
            let n = self.read_some(&mut buf[..want])?;
            if n == 0 {
                return Err(StreamError::Closed {
                    received: self.received,
                    expected,
                });
            }
            out.extend_from_slice(&buf[..n]);
            self.received += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Read one line terminated by `\n`, returning it without the terminator.
    fn read_line(&mut self) -> Result<String, StreamError> {
        let mut line = Vec::with_capacity(MAX_SIZE_LINE);
        let mut byte = [0u8; 1];
        loop {
            if self.read_some(&mut byte)? == 0 {
                return Err(StreamError::Closed {
                    received: self.received,
                    expected: None,
                });
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() >= MAX_SIZE_LINE {
                return Err(StreamError::MalformedChunkSize(
                    String::from_utf8_lossy(&line).into_owned(),
                ));
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Parse a chunk-size line: hex digits, optionally followed by `;ext`.
pub fn parse_chunk_size(line: &str) -> Result<usize, StreamError> {
    let digits = line
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StreamError::MalformedChunkSize(line.to_string()));
    }
    usize::from_str_radix(digits, 16).map_err(|_| StreamError::MalformedChunkSize(line.to_string()))
}

/// Read a body of declared length.
///
/// The caller must already have checked `length` against the ceiling; the
/// buffer is reserved up front.
pub fn read_fixed_length(
    stream: &mut dyn BodyStream,
    length: usize,
    timeouts: ReadTimeouts,
) -> Result<Vec<u8>, StreamError> {
    let mut reader = PolledReader::new(stream, timeouts);
    let mut out = Vec::with_capacity(length);
    reader.read_exact_into(length, &mut out, Some(length))?;
    Ok(out)
}

/// Decode a chunked body, refusing to grow past `max_bytes`.
pub fn read_chunked(
    stream: &mut dyn BodyStream,
    max_bytes: usize,
    timeouts: ReadTimeouts,
) -> Result<Vec<u8>, StreamError> {
    let mut reader = PolledReader::new(stream, timeouts);
    let mut out = Vec::new();
    loop {
        let line = reader.read_line()?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            break;
        }
        if out.len().saturating_add(size) > max_bytes {
            return Err(StreamError::TooLarge { limit: max_bytes });
        }
        reader.read_exact_into(size, &mut out, None)?;
        // CRLF after the chunk data
        let trailer = reader.read_line()?;
        if !trailer.is_empty() {
            return Err(StreamError::MalformedChunkSize(trailer));
        }
    }
    Ok(out)
}

/// Read until the peer closes, refusing to grow past `max_bytes`.
pub fn read_until_close(
    stream: &mut dyn BodyStream,
    max_bytes: usize,
    timeouts: ReadTimeouts,
) -> Result<Vec<u8>, StreamError> {
    let mut reader = PolledReader::new(stream, timeouts);
    let mut out = Vec::new();
    let mut buf = [0u8; TRANSFER_CHUNK];
    loop {
        let n = reader.read_some(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > max_bytes {
            return Err(StreamError::TooLarge { limit: max_bytes });
        }
        out.extend_from_slice(&buf[..n]);
        reader.received += n;
    }
}

/// Decode a body according to its framing.
pub fn read_body(
    stream: &mut dyn BodyStream,
    framing: BodyFraming,
    max_bytes: usize,
    timeouts: ReadTimeouts,
) -> Result<Vec<u8>, StreamError> {
    match framing {
        BodyFraming::Length(n) if n > max_bytes => Err(StreamError::TooLarge { limit: max_bytes }),
        BodyFraming::Length(n) => read_fixed_length(stream, n, timeouts),
        BodyFraming::Chunked => read_chunked(stream, max_bytes, timeouts),
        BodyFraming::UntilClose => read_until_close(stream, max_bytes, timeouts),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::BodyStream;
    use std::collections::VecDeque;
    use std::io;

    /// In-memory [`BodyStream`] that replays scripted reads.
    ///
    /// Each step either delivers bytes (split across reads by the caller's
    /// buffer size) or reports one idle poll. After the script runs out the
    /// stream reports `connected` as configured.
    #[derive(Debug, Default)]
    pub struct ScriptedBody {
        steps: VecDeque<ScriptStep>,
        stay_open: bool,
        pub reads: usize,
    }

    #[derive(Debug, Clone)]
    pub enum ScriptStep {
        Data(Vec<u8>),
        Idle,
        Fail(io::ErrorKind),
    }

    impl ScriptedBody {
        /// A body that delivers `bytes` and then closes.
        pub fn closing(bytes: &[u8]) -> Self {
            Self::from_steps(vec![ScriptStep::Data(bytes.to_vec())], false)
        }

        pub fn from_steps(steps: Vec<ScriptStep>, stay_open: bool) -> Self {
            Self {
                steps: steps.into(),
                stay_open,
                reads: 0,
            }
        }
    }

    impl BodyStream for ScriptedBody {
        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.steps.pop_front() {
                None => Ok(0),
                Some(ScriptStep::Idle) => Ok(0),
                Some(ScriptStep::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
                Some(ScriptStep::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(ScriptStep::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }

        fn is_connected(&self) -> bool {
            !self.steps.is_empty() || self.stay_open
        }
    }
}
