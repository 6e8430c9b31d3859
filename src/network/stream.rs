//! Channel-backed byte streams
//!
//! [`byte_stream_pair`] returns two ends of an in-process pipe. Writes are
//! copied into [`Bytes`] chunks and queued; the reader hands them out in
//! order. Transports use this to expose a network stream as `Read`/`Write`.
//!
//! The queue holds at most [`STREAM_QUEUE_CHUNKS`] chunks. Writers never
//! block: a write that finds the queue full is dropped whole and counted.

use bytes::{Buf, Bytes};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::constants::STREAM_QUEUE_CHUNKS;

/// Create a connected writer/reader pair.
///
/// Reads that find nothing queued within `read_timeout` fail with
/// [`io::ErrorKind::WouldBlock`] so the reading thread can check for
/// cancellation. Once the writer is dropped and the queue is empty, reads
/// return `Ok(0)`.
pub fn byte_stream_pair(read_timeout: Duration) -> (ChannelWriter, ChannelReader) {
    let (tx, rx) = bounded(STREAM_QUEUE_CHUNKS);
    (
        ChannelWriter {
            tx,
            dropped: AtomicU64::new(0),
        },
        ChannelReader {
            rx,
            current: Bytes::new(),
            read_timeout,
        },
    )
}

/// Writing end of a channel byte stream
pub struct ChannelWriter {
    tx: Sender<Bytes>,
    dropped: AtomicU64,
}

impl ChannelWriter {
    /// Queue an already-owned chunk without copying.
    ///
    /// When the queue is full the chunk is discarded and still reported as
    /// written; see [`dropped_bytes`](Self::dropped_bytes).
    pub fn send_bytes(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) => {
                let len = chunk.len() as u64;
                let total = self.dropped.fetch_add(len, Ordering::Relaxed) + len;
                tracing::trace!(
                    bytes = len,
                    total_dropped = total,
                    "Byte stream queue full, chunk dropped"
                );
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "byte stream reader dropped",
            )),
        }
    }

    /// Bytes discarded so far because the reader fell behind.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_bytes(Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reading end of a channel byte stream
pub struct ChannelReader {
    rx: Receiver<Bytes>,
    current: Bytes,
    read_timeout: Duration,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.current.has_remaining() {
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.current = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data yet"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let count = buf.len().min(self.current.remaining());
        self.current.copy_to_slice(&mut buf[..count]);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_arrive_in_order() {
        let (mut writer, mut reader) = byte_stream_pair(Duration::from_millis(10));
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        drop(writer);

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_small_reads_split_chunks() {
        let (mut writer, mut reader) = byte_stream_pair(Duration::from_millis(10));
        writer.write_all(&[1, 2, 3, 4, 5]).unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [3, 4]);
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 5);
    }

    #[test]
    fn test_empty_queue_would_block() {
        let (_writer, mut reader) = byte_stream_pair(Duration::from_millis(1));
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_full_queue_drops_whole_chunks() {
        let (mut writer, mut reader) = byte_stream_pair(Duration::from_millis(1));
        let chunk = [9u8; 1024];
        for _ in 0..STREAM_QUEUE_CHUNKS + 8 {
            writer.write_all(&chunk).unwrap();
        }
        assert_eq!(writer.dropped_bytes(), 8 * 1024);

        drop(writer);
        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received.len(), STREAM_QUEUE_CHUNKS * 1024);
        assert!(received.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_write_after_reader_dropped_fails() {
        let (mut writer, reader) = byte_stream_pair(Duration::from_millis(1));
        drop(reader);
        let err = writer.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
