//! Length-prefixed message framing over OS pipes.
//!
//! Every frame is a 4-digit zero-padded ASCII decimal length followed by
//! exactly that many payload bytes:
//!
//! ```text
//! 0013System/Load
//! ^^^^ length   ^^^^^^^^^^^ payload (13 bytes)
//! ```
//!
//! Reads and writes wait a bounded time for readiness. "Not ready within the
//! timeout" is a normal outcome (`Ok(None)` / `Ok(false)`), distinct from real
//! I/O failures, which propagate as errors.

use std::io::{Read, Write};
use std::time::Duration;

use filedescriptor::{
    AsRawSocketDescriptor, FileDescriptor, POLLERR, POLLHUP, POLLIN, POLLOUT, Pipe, poll, pollfd,
};

use crate::error::FrameError;

/// Width of the ASCII length prefix.
pub const PREFIX_LEN: usize = 4;

/// Largest payload the 4-digit prefix can describe.
pub const MAX_PAYLOAD: usize = 9999;

/// Default readiness wait used by the worker protocol.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Encode `payload` as a single frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge { len: payload.len() });
    }
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(format!("{:04}", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse a length prefix. Only four ASCII digits are accepted.
pub fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Result<usize, FrameError> {
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidLength(
            String::from_utf8_lossy(prefix).into_owned(),
        ));
    }
    Ok(prefix
        .iter()
        .fold(0usize, |acc, digit| acc * 10 + usize::from(digit - b'0')))
}

/// Read exactly one frame from `reader`.
///
/// End-of-stream before the first prefix byte, or in the middle of a frame,
/// is reported as [`FrameError::Closed`].
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    read_exact_or_closed(reader, &mut prefix)?;
    let len = parse_prefix(&prefix)?;
    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload)?;
    Ok(payload)
}

fn read_exact_or_closed<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(err)
        }
    })
}

/// Create a one-directional framed channel backed by a fresh pipe.
pub fn channel() -> Result<(FrameSender, FrameReceiver), FrameError> {
    let pipe = Pipe::new()?;
    Ok((
        FrameSender { fd: pipe.write },
        FrameReceiver { fd: pipe.read },
    ))
}

/// Outcome of waiting on a single descriptor.
enum Readiness {
    Ready,
    TimedOut,
}

fn wait_for(fd: &FileDescriptor, events: i16, timeout: Duration) -> Result<Readiness, FrameError> {
    let mut pfd = [pollfd {
        fd: fd.as_socket_descriptor(),
        events,
        revents: 0,
    }];
    match poll(&mut pfd, Some(timeout)) {
        Ok(0) => Ok(Readiness::TimedOut),
        Ok(_) => {
            // Hangup/error still counts as ready: the following read or
            // write reports the real condition.
            if pfd[0].revents & (events | POLLHUP | POLLERR) != 0 {
                Ok(Readiness::Ready)
            } else {
                Ok(Readiness::TimedOut)
            }
        }
        Err(filedescriptor::Error::Poll(err)) if err.kind() == std::io::ErrorKind::Interrupted => {
            Ok(Readiness::TimedOut)
        }
        Err(err) => Err(err.into()),
    }
}

/// Write half of a framed channel.
#[derive(Debug)]
pub struct FrameSender {
    fd: FileDescriptor,
}

impl FrameSender {
    /// Send one message, waiting up to `timeout` for the pipe to accept it.
    ///
    /// Returns `Ok(false)` when the pipe did not become writable in time.
    /// An oversized message is rejected before any waiting.
    pub fn send(&mut self, message: &str, timeout: Duration) -> Result<bool, FrameError> {
        let frame = encode_frame(message.as_bytes())?;
        match wait_for(&self.fd, POLLOUT, timeout)? {
            Readiness::TimedOut => Ok(false),
            Readiness::Ready => {
                self.fd.write_all(&frame).map_err(|err| {
                    if err.kind() == std::io::ErrorKind::BrokenPipe {
                        FrameError::Closed
                    } else {
                        FrameError::Io(err)
                    }
                })?;
                self.fd.flush()?;
                Ok(true)
            }
        }
    }
}

/// Read half of a framed channel.
#[derive(Debug)]
pub struct FrameReceiver {
    fd: FileDescriptor,
}

impl FrameReceiver {
    /// Receive one message, waiting up to `timeout` for data.
    ///
    /// Returns `Ok(None)` when nothing was readable in time.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<String>, FrameError> {
        match wait_for(&self.fd, POLLIN, timeout)? {
            Readiness::TimedOut => Ok(None),
            Readiness::Ready => {
                let payload = decode_frame(&mut self.fd)?;
                String::from_utf8(payload)
                    .map(Some)
                    .map_err(|_| FrameError::InvalidUtf8)
            }
        }
    }
}
