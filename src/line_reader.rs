use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Provides a facility to read LF-terminated lines from a stream. A CR
/// immediately before the LF is dropped too, so both `\n` and `\r\n` line
/// endings are accepted.
///
/// In future this could be an `AsyncIterator<Item = Bytes>`.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but lacks a LF.
    buf: BytesMut,
    /// Index in buf from which a LF may appear (and before which a LF hasn't
    /// been seen).
    maybe_lf_from: usize,
    /// Data source
    reader: T,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Only scan the bytes that arrived since the last miss, keeping
            // O(bytes_read) behaviour. Pipelined lines that arrive in the same
            // read_buf call are handled by the outer loop: we only call
            // read_buf once all pending lines in the buffer have been taken.
            if let Some(eol) = self
                .buf
                .iter()
                .skip(self.maybe_lf_from)
                .position(|&c| c == b'\n')
            {
                let line =
                    self.buf.split_to(self.maybe_lf_from + eol + 1).freeze();

                // Drop the trailing b"\n" and any b"\r" before it.
                let mut end = line.len() - 1;
                if line[..end].ends_with(b"\r") {
                    end -= 1;
                }

                self.maybe_lf_from = 0;

                return Ok(Some(line.slice(0..end)));
            }

            self.maybe_lf_from = self.buf.len();

            // If we didn't read any bytes this time around, assume we've
            // reached an end-of-stream condition.
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Reads exactly `n` bytes, taking buffered data first. Returns None if
    /// the stream ends before `n` bytes are available.
    #[cfg(test)]
    pub(crate) async fn read_chunk(
        &mut self,
        n: usize,
    ) -> io::Result<Option<Bytes>> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }

        let chunk = self.buf.split_to(n).freeze();
        self.maybe_lf_from = 0;

        Ok(Some(chunk))
    }

    /// Reads once from the underlying reader into the buffer.
    async fn fill(&mut self) -> io::Result<usize> {
        self.reader.read_buf(&mut self.buf).await
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_lf_from: 0,
            reader: value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn test_fragmented_lines() {
        // When properly read, each nth line should read b"test:{n}".
        let tests: &[&[u8]] = &[
            // Simple reassembly
            b"test:",
            b"1\n",
            // CRLF endings are accepted too
            b"test:",
            b"2\r",
            b"\n",
            b"test:",
            b"3",
            b"\r\n",
            // Pipelined lines
            b"test:4\ntest:5\n",
            b"test:6\r",
            b"\ntest:7\n",
            b"test:8",
            b"\r\ntest:9\n",
        ];

        // Set the buffer large enough that our tests will never overflow it.
        // We can ensure correct fragmentation of reads by explicitly yielding
        // between each.
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in tests {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        let mut lr: LineReader<_> = server.into();

        for n in 1..=9 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("test:{n}")
            );
        }

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_line_at_eof_is_dropped() {
        let (mut client, server) = io::duplex(64);
        client.write_all(b"whole\nhalf").await.unwrap();
        drop(client);

        let mut lr: LineReader<_> = server.into();
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "whole");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_chunk_after_line() {
        let (mut client, server) = io::duplex(64);

        tokio::spawn(async move {
            client.write_all(b"len 5\r\nab").await.unwrap();
            yield_now().await;
            client.write_all(b"cdeNEXT\n").await.unwrap();
        });

        let mut lr: LineReader<_> = server.into();
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "len 5");
        assert_eq!(lr.read_chunk(5).await.unwrap().unwrap(), "abcde");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "NEXT");
        assert!(lr.read_chunk(1).await.unwrap().is_none());
    }
}
