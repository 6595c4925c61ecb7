//! Line relays between the child's byte pipes and in-process channels.
//!
//! Output side: stdout bytes are split on `\n` (a trailing `\r` is dropped
//! too) and every line becomes one message. Input side: every message is
//! written back out followed by `\n`.

use bytes::{BufMut, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Read size for the stdout buffer
const READ_CHUNK: usize = 8 * 1024;

/// Policy for output lines longer than the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    /// End the relay with [`RelayError::LineTooLong`].
    #[default]
    Error,
    /// Forward the first `max_bytes` and drop the rest of the line.
    Truncate,
}

/// Upper bound on a single line of process output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineLimit {
    pub max_bytes: usize,
    pub overflow: Overflow,
}

impl Default for LineLimit {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            overflow: Overflow::Error,
        }
    }
}

/// Splits a byte source into lines without ever buffering much more than
/// `limit.max_bytes`.
pub struct LineReader<R> {
    reader: R,
    buffer: BytesMut,
    limit: LineLimit,
    /// Bytes at the front of `buffer` already known to contain no `\n`.
    scanned: usize,
    /// Dropping the tail of a truncated line.
    discarding: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, limit: LineLimit) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            limit,
            scanned: 0,
            discarding: false,
            eof: false,
        }
    }

    /// Next line with its terminator stripped, or `None` at end of stream.
    ///
    /// A final line without a terminator is still returned.
    pub async fn next_line(&mut self) -> Result<Option<String>, RelayError> {
        loop {
            if let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
                let line = self.buffer.split_to(self.scanned + offset + 1);
                self.scanned = 0;
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                return self.finish_line(&line[..line.len() - 1]).map(Some);
            }
            self.scanned = self.buffer.len();

            // One extra byte leaves room for the `\r` of a split `\r\n`.
            if self.buffer.len() > self.limit.max_bytes.saturating_add(1) {
                if self.discarding {
                    self.buffer.clear();
                    self.scanned = 0;
                } else {
                    match self.limit.overflow {
                        Overflow::Error => {
                            return Err(RelayError::LineTooLong {
                                limit: self.limit.max_bytes,
                            })
                        }
                        Overflow::Truncate => {
                            let head = self.buffer.split_to(self.limit.max_bytes);
                            self.buffer.clear();
                            self.scanned = 0;
                            self.discarding = true;
                            return Ok(Some(decode(&head)));
                        }
                    }
                }
            }

            if self.eof {
                if self.buffer.is_empty() || self.discarding {
                    self.buffer.clear();
                    return Ok(None);
                }
                let rest = self.buffer.split();
                self.scanned = 0;
                return self.finish_line(&rest).map(Some);
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(RelayError::Read)?;
            if n == 0 {
                self.eof = true;
            }
        }
    }

    fn finish_line(&self, raw: &[u8]) -> Result<String, RelayError> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.len() <= self.limit.max_bytes {
            return Ok(decode(raw));
        }
        match self.limit.overflow {
            Overflow::Error => Err(RelayError::LineTooLong {
                limit: self.limit.max_bytes,
            }),
            Overflow::Truncate => Ok(decode(&raw[..self.limit.max_bytes])),
        }
    }
}

fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Process stdout → channel.
///
/// Ends with `Ok` at end of stream or when the receiving side is gone.
pub async fn process_to_channel<R>(
    source: R,
    tx: mpsc::Sender<String>,
    limit: LineLimit,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineReader::new(source, limit);
    while let Some(line) = lines.next_line().await? {
        if tx.send(line).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Channel → process stdin, one line per message.
///
/// Ends with `Ok` once the channel is closed and drained.
pub async fn channel_to_process<W>(
    mut rx: mpsc::Receiver<String>,
    mut sink: W,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::new();
    while let Some(message) = rx.recv().await {
        buffer.clear();
        buffer.reserve(message.len() + 1);
        buffer.extend_from_slice(message.as_bytes());
        buffer.put_u8(b'\n');

        sink.write_all(&buffer).await.map_err(RelayError::Write)?;
        sink.flush().await.map_err(RelayError::Write)?;
    }
    Ok(())
}
