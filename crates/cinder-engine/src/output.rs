//! Output capture with hard byte caps
//!
//! Both backends tee each stream into a capped in-memory buffer and, for
//! streaming executions, into a channel sink. The caps match the API
//! response limits: anything past them is dropped, and a truncation marker
//! is appended so callers can tell.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// stdout cap (1 MiB)
pub const MAX_STDOUT_BYTES: usize = 1 << 20;
/// stderr cap (256 KiB)
pub const MAX_STDERR_BYTES: usize = 256 * 1024;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Byte buffer that stops accepting input at a fixed cap.
#[derive(Debug)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Accept as much of `data` as fits; remember whether anything was cut.
    pub fn write(&mut self, data: &[u8]) {
        if self.buf.len() >= self.cap {
            if !data.is_empty() {
                self.truncated = true;
            }
            return;
        }
        let remaining = self.cap - self.buf.len();
        if data.len() > remaining {
            self.buf.extend_from_slice(&data[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(data);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Render the captured bytes, appending the truncation marker if the
    /// cap was hit.
    pub fn into_string(self) -> String {
        let mut s = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            s.push_str(TRUNCATION_MARKER);
        }
        s
    }
}

/// Read `reader` to EOF, teeing every chunk into a capped buffer and an
/// optional streaming sink. Returns the buffer when the stream closes.
/// Sink send failures (client went away) stop streaming but not capture.
pub async fn pump_stream<R>(
    mut reader: R,
    cap: usize,
    sink: Option<mpsc::Sender<Bytes>>,
) -> CappedBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = CappedBuffer::new(cap);
    let mut sink = sink;
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.write(&chunk[..n]);
                if let Some(tx) = &sink {
                    if tx.send(Bytes::copy_from_slice(&chunk[..n])).await.is_err() {
                        sink = None;
                    }
                }
            }
            Err(_) => break,
        }
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_cap_passes_through() {
        let mut buf = CappedBuffer::new(16);
        buf.write(b"hello");
        assert_eq!(buf.into_string(), "hello");
    }

    #[test]
    fn test_truncates_at_exact_cap() {
        let mut buf = CappedBuffer::new(4);
        buf.write(b"hello world");
        let s = buf.into_string();
        assert!(s.starts_with("hell"));
        assert!(s.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_writes_after_cap_are_dropped() {
        let mut buf = CappedBuffer::new(4);
        buf.write(b"1234");
        buf.write(b"5678");
        let s = buf.into_string();
        assert!(s.starts_with("1234"));
        assert!(!s.contains('5'));
        assert!(s.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_exact_fit_is_not_marked_truncated() {
        let mut buf = CappedBuffer::new(4);
        buf.write(b"1234");
        assert_eq!(buf.into_string(), "1234");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut buf = CappedBuffer::new(16);
        buf.write(&[0x68, 0x69, 0xff, 0xfe]);
        let s = buf.into_string();
        assert!(s.starts_with("hi"));
    }

    #[tokio::test]
    async fn test_pump_tees_into_buffer_and_sink() {
        let data = b"line one\nline two\n".to_vec();
        let (tx, mut rx) = mpsc::channel(8);

        let buf = pump_stream(&data[..], 1024, Some(tx)).await;
        assert_eq!(buf.into_string(), "line one\nline two\n");

        let mut streamed = Vec::new();
        while let Some(chunk) = rx.recv().await {
            streamed.extend_from_slice(&chunk);
        }
        assert_eq!(streamed, data);
    }

    #[tokio::test]
    async fn test_pump_caps_buffer_but_streams_all() {
        let data = vec![b'x'; 100];
        let (tx, mut rx) = mpsc::channel(64);

        let buf = pump_stream(&data[..], 10, Some(tx)).await;
        assert_eq!(buf.len(), 10);

        let mut streamed = 0;
        while let Some(chunk) = rx.recv().await {
            streamed += chunk.len();
        }
        assert_eq!(streamed, 100);
    }

    #[tokio::test]
    async fn test_pump_survives_dropped_sink() {
        let data = vec![b'x'; 64 * 1024];
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let buf = pump_stream(&data[..], 1 << 20, Some(tx)).await;
        assert_eq!(buf.len(), 64 * 1024);
    }
}
