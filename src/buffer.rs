use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ErrorKind, Result};

const DEFAULT_SIZE: usize = 1024;
const MIN_GROWTH: usize = 32;

/// A sliding window over bytes received from a stream.
///
/// Valid bytes live in `data[off..off + len]`. Reads consume from the head of
/// the window; refills append to the tail, compacting the window back to the
/// origin when the free suffix is too small.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    data: Vec<u8>,
    off: usize,
    len: usize,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: vec![0u8; DEFAULT_SIZE],
            off: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data[self.off..self.off + self.len]
    }

    pub(crate) fn clear(&mut self) {
        self.off = 0;
        self.len = 0;
    }

    /// Reads from `stream` until at least `min` unconsumed bytes are
    /// buffered. On failure the window is unchanged from the caller's
    /// perspective; a retry with more data available will succeed.
    pub(crate) async fn fill_to<S>(&mut self, stream: &mut S, min: usize) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        if self.len >= min {
            return Ok(());
        }

        // Move live bytes back to the origin if the suffix can't hold the
        // rest of the message.
        if self.data.len() - self.off < min {
            self.data.copy_within(self.off..self.off + self.len, 0);
            self.off = 0;
        }

        if self.data.len() < min {
            let mut capacity = self.data.len().max(MIN_GROWTH);
            while capacity < min {
                capacity *= 2;
            }
            self.data.resize(capacity, 0);
        }

        while self.len < min {
            let start = self.off + self.len;
            let n = stream.read(&mut self.data[start..]).await?;
            if n == 0 {
                return Err(ErrorKind::from(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed before enough bytes were received",
                ))
                .into());
            }
            self.len += n;
        }

        Ok(())
    }

    /// Consumes `n` bytes from the head of the window, returning them.
    pub(crate) fn consume(&mut self, n: usize) -> &[u8] {
        debug_assert!(n <= self.len);
        let start = self.off;
        self.off += n;
        self.len -= n;
        &self.data[start..start + n]
    }

    pub(crate) fn read_i32_le(&mut self) -> Result<i32> {
        if self.len < 4 {
            return Err(short_read(4, self.len));
        }
        let bytes = self.consume(4);
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[allow(dead_code)]
    pub(crate) fn read_i64_le(&mut self) -> Result<i64> {
        if self.len < 8 {
            return Err(short_read(8, self.len));
        }
        let bytes = self.consume(8);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    /// Consumes a NUL-terminated string from the head of the window.
    #[allow(dead_code)]
    pub(crate) fn read_cstring(&mut self) -> Result<&str> {
        let nul = match self.bytes().iter().position(|&b| b == 0) {
            Some(idx) => idx,
            None => {
                return Err(crate::error::Error::invalid_response(
                    "unterminated cstring in buffered data",
                ))
            }
        };
        let bytes = self.consume(nul + 1);
        std::str::from_utf8(&bytes[..nul])
            .map_err(|_| crate::error::Error::invalid_response("cstring is not valid UTF-8"))
    }
}

fn short_read(wanted: usize, available: usize) -> crate::error::Error {
    crate::error::Error::invalid_response(format!(
        "needed {} buffered bytes but only {} are available",
        wanted, available
    ))
}
