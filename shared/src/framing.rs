//! Newline framing over a TCP byte stream.
//!
//! [`LineFramer`] keeps bytes across reads and splits them on `\n`;
//! [`ConnectionReader`] drives one bounded read at a time and turns complete
//! lines into decoded [`WireMessage`]s, dropping anything that does not
//! decode.

use crate::{decode, FrameError, WireMessage};
use bytes::{Bytes, BytesMut};
use log::debug;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

const READ_CHUNK: usize = 4096;

/// Receive buffer that yields complete lines and keeps the partial tail.
pub struct LineFramer {
    buf: BytesMut,
    max_line_len: usize,
}

impl LineFramer {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_line_len,
        }
    }

    /// Mutable access to the receive buffer for socket reads.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Splits off every complete line currently buffered.
    ///
    /// Returned lines exclude the terminator; blank lines are skipped. Fails
    /// on any line, terminated or not, longer than `max_line_len`.
    pub fn drain_lines(&mut self) -> Result<Vec<Bytes>, FrameError> {
        let mut lines = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.len() > self.max_line_len {
                return Err(FrameError::LineTooLong {
                    limit: self.max_line_len,
                });
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line.freeze());
            }
        }

        if self.buf.len() > self.max_line_len {
            return Err(FrameError::LineTooLong {
                limit: self.max_line_len,
            });
        }

        Ok(lines)
    }
}

/// Outcome of one bounded read on a connection.
#[derive(Debug, PartialEq)]
pub enum ReadEvent {
    /// Zero or more decoded messages; undecodable lines are already dropped.
    Messages(Vec<WireMessage>),
    /// The read timed out without data.
    Idle,
    /// The peer closed the stream.
    Closed,
}

pub struct ConnectionReader<R> {
    reader: R,
    framer: LineFramer,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    pub fn new(reader: R, read_timeout: Duration, max_line_len: usize) -> Self {
        Self {
            reader,
            framer: LineFramer::new(max_line_len),
            read_timeout,
        }
    }

    /// Performs one read bounded by the read timeout.
    ///
    /// A partial line left in the buffer when the peer closes is discarded.
    pub async fn next_event(&mut self) -> io::Result<ReadEvent> {
        self.framer.buf_mut().reserve(READ_CHUNK);

        let n = match timeout(self.read_timeout, self.reader.read_buf(self.framer.buf_mut())).await
        {
            Ok(res) => res?,
            Err(_) => return Ok(ReadEvent::Idle),
        };

        if n == 0 {
            if self.framer.pending() > 0 {
                debug!(
                    "Discarding {} bytes of unterminated input at end of stream",
                    self.framer.pending()
                );
            }
            return Ok(ReadEvent::Closed);
        }

        let messages = self
            .framer
            .drain_lines()?
            .into_iter()
            .filter_map(|line| match decode(&line) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!("Discarding malformed line: {}", e);
                    None
                }
            })
            .collect();

        Ok(ReadEvent::Messages(messages))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
