//! Newline-framed reads over an arbitrary byte source.
//!
//! [`LineReader`] reassembles `\n`-terminated lines from a source that may
//! deliver bytes in arbitrarily small chunks. Unlike a buffered reader it
//! never reads past what it was asked to: with `read_len == 1` it consumes
//! the source one byte per read call and therefore never buffers anything
//! beyond the first newline. That property lets the caller take the source
//! back (via [`get_mut`](LineReader::get_mut)) and read a byte-exact payload
//! that follows a control line on the same stream.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Default capacity of the internal line buffer.
pub const DEFAULT_MAX_LEN: usize = 4096;

/// Default number of bytes requested from the source per read call.
pub const DEFAULT_READ_LEN: usize = 1024;

/// Errors from [`LineReader::read_line`].
#[derive(Debug, thiserror::Error)]
pub enum LineReaderError {
    /// The buffer filled up without a newline appearing.
    #[error("line buffer reached {0} bytes")]
    BufferFull(usize),

    /// Reading from the underlying source failed.
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reassembles newline-delimited frames from a byte source.
pub struct LineReader<R> {
    src: R,
    read_len: usize,
    eof: bool,
    buffer: Vec<u8>,
    bytes_read: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Creates a reader with the default buffer capacity and read length.
    pub fn new(src: R) -> Self {
        Self::with_limits(src, DEFAULT_MAX_LEN, DEFAULT_READ_LEN)
    }

    /// Creates a reader reading `read_len` bytes per call into a buffer
    /// capped at `max_len` bytes (including the newline).
    ///
    /// Use `read_len == 1` when raw payload bytes may follow a line on the
    /// same stream and must not be swallowed by the line buffer.
    pub fn with_limits(src: R, max_len: usize, read_len: usize) -> Self {
        assert!(max_len > 0 && read_len > 0);
        Self {
            src,
            read_len,
            eof: false,
            buffer: vec![0; max_len],
            bytes_read: 0,
        }
    }

    /// True once the source reported end-of-stream.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Bytes currently buffered (read but not yet returned as a line).
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[..self.bytes_read]
    }

    /// Access to the underlying source, for byte-exact reads between lines.
    ///
    /// Only meaningful with `read_len == 1`; otherwise the buffer may
    /// already hold bytes past the last returned newline.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.src
    }

    /// Reads the next line, without its `\n` terminator.
    ///
    /// Returns `Ok(None)` once the source reaches end-of-stream; any bytes
    /// buffered at that point stay in [`buffered`](Self::buffered). Fails
    /// with [`LineReaderError::BufferFull`] if a line exceeds the buffer.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, LineReaderError> {
        // a complete line may already sit in the buffer from a previous read
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        if self.eof {
            return Ok(None);
        }

        while self.bytes_read < self.buffer.len() {
            let space = self.buffer.len() - self.bytes_read;
            let upto = self.bytes_read + self.read_len.min(space);
            let n = self.src.read(&mut self.buffer[self.bytes_read..upto]).await?;
            if n == 0 {
                self.eof = true;
                return Ok(None);
            }
            self.bytes_read += n;

            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
        }

        Err(LineReaderError::BufferFull(self.buffer.len()))
    }

    /// Extracts the first full line from the buffer and compacts it.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let idx = self.buffer[..self.bytes_read]
            .iter()
            .position(|&b| b == b'\n')?;
        let line = self.buffer[..idx].to_vec();
        self.buffer.copy_within(idx + 1..self.bytes_read, 0);
        self.bytes_read -= idx + 1;
        Some(line)
    }
}
