//! Non-blocking readers over blocking OS streams.
//!
//! Two sources feed the pipeline's drain loop:
//!
//! - [`QueueReader`]: owns an fd and a background pump thread that copies
//!   byte chunks into an mpsc channel. The drain loop polls the channel with
//!   a bounded timeout, so a blocking `read(2)` never stalls the
//!   orchestrator.
//! - [`SharedOutBuf`]: an in-memory append buffer with a read cursor,
//!   filled by a process pump thread and polled by the drain loop.
//!
//! Lifecycle for both: open, then closed (EOF or read error observed), then
//! fully read (closed and no bytes left). The fd behind a `QueueReader` is
//! owned by its pump thread; the thread's exit is the single place it is
//! closed.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::text::split_lines_keepends;

/// Bytes requested per `read(2)` in the reader thread.
pub const READ_CHUNK_SIZE: usize = 1024;

/// A background-thread reader that turns a blocking fd into a pollable
/// chunk source.
pub struct QueueReader {
    rx: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    peeked: Option<Vec<u8>>,
}

impl QueueReader {
    /// Spawn a reader thread that owns `fd` and pumps chunks until EOF or a
    /// read error. A pty master raises `EIO` once every slave side is gone;
    /// that counts as EOF here. The thread is detached and exits on its own
    /// once the fd closes or the receiver is dropped.
    pub fn from_fd(fd: OwnedFd, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let closed = Arc::new(AtomicBool::new(false));
        let thread_closed = Arc::clone(&closed);
        let spawned = thread::Builder::new()
            .name("oxsh-fd-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK_SIZE];
                loop {
                    match nix::unistd::read(&fd, &mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(_) => break,
                    }
                }
                thread_closed.store(true, Ordering::SeqCst);
            });
        if spawned.is_err() {
            closed.store(true, Ordering::SeqCst);
        }
        QueueReader {
            rx,
            closed,
            timeout,
            peeked: None,
        }
    }

    /// One chunk from the queue, or an empty vec if nothing arrived within
    /// the timeout.
    pub fn read_chunk(&mut self) -> Vec<u8> {
        if let Some(chunk) = self.peeked.take() {
            return chunk;
        }
        match self.rx.recv_timeout(self.timeout) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Vec::new(),
        }
    }

    /// All chunks that are available right now, without waiting.
    pub fn read_available(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(chunk) = self.peeked.take() {
            out.extend_from_slice(&chunk);
        }
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Available lines (keepends), reassembled from whole chunks. A chunk
    /// that ends mid-line yields a partial tail; concatenation is lossless.
    /// Stops early once `hint` lines have been collected.
    pub fn read_lines_available(&mut self, hint: usize) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        loop {
            let chunk = self.read_chunk();
            if chunk.is_empty() {
                break;
            }
            lines.extend(split_lines_keepends(&chunk));
            if lines.len() >= hint {
                break;
            }
        }
        lines
    }

    /// Block until the stream is fully read, returning everything left.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(chunk) = self.peeked.take() {
            out.extend_from_slice(&chunk);
        }
        loop {
            match self.rx.recv_timeout(self.timeout) {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.closed.load(Ordering::SeqCst) {
                        // closed is set after the final send, so one more
                        // sweep settles anything still queued
                        while let Ok(chunk) = self.rx.try_recv() {
                            out.extend_from_slice(&chunk);
                        }
                        break;
                    }
                }
            }
        }
        out
    }

    /// True once the pump thread finished and the queue is drained.
    pub fn is_fully_read(&mut self) -> bool {
        // closed is set after the final send, so observing it first means
        // anything still in flight is already queued
        if !self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if self.peeked.is_some() {
            return false;
        }
        match self.rx.try_recv() {
            Ok(chunk) => {
                self.peeked = Some(chunk);
                false
            }
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for QueueReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueReader")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// An append-only byte buffer shared between a pump thread (writer) and the
/// drain loop (reader). Reading advances a cursor; writing appends.
#[derive(Debug, Default)]
pub struct SharedOutBuf {
    inner: Mutex<OutBufInner>,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct OutBufInner {
    buf: Vec<u8>,
    cursor: usize,
}

impl SharedOutBuf {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedOutBuf::default())
    }

    /// Append bytes. Called only by the owning pump thread.
    pub fn write_all(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.buf.extend_from_slice(chunk);
    }

    /// Mark the writer as finished.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Everything appended since the last read.
    pub fn read_available(&self) -> Vec<u8> {
        let mut inner = self.lock();
        let out = inner.buf[inner.cursor..].to_vec();
        inner.cursor = inner.buf.len();
        out
    }

    /// Available bytes split into keepends lines; empty when nothing new.
    pub fn read_lines_available(&self) -> Vec<Vec<u8>> {
        let chunk = self.read_available();
        if chunk.is_empty() {
            return Vec::new();
        }
        split_lines_keepends(&chunk)
    }

    /// Full contents from the start, regardless of the cursor.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().buf.clone()
    }

    /// True once the writer closed the buffer and the cursor is caught up.
    pub fn is_fully_read(&self) -> bool {
        if !self.is_closed() {
            return false;
        }
        let inner = self.lock();
        inner.cursor >= inner.buf.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutBufInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().expect("pipe")
    }

    #[test]
    fn reads_chunks_until_eof() {
        let (r, w) = pipe_pair();
        let mut reader = QueueReader::from_fd(r, Duration::from_millis(5));
        let mut wfile = std::fs::File::from(w);
        wfile.write_all(b"hello\nworld\n").expect("write");
        drop(wfile);

        let out = reader.read_to_end();
        assert_eq!(out, b"hello\nworld\n");
        assert!(reader.is_fully_read());
    }

    #[test]
    fn read_chunk_times_out_empty() {
        let (r, _w) = pipe_pair();
        let mut reader = QueueReader::from_fd(r, Duration::from_millis(5));
        assert_eq!(reader.read_chunk(), Vec::<u8>::new());
        assert!(!reader.is_fully_read());
    }

    #[test]
    fn lines_keep_endings() {
        let (r, w) = pipe_pair();
        let mut reader = QueueReader::from_fd(r, Duration::from_millis(20));
        let mut wfile = std::fs::File::from(w);
        wfile.write_all(b"a\nb\nc").expect("write");
        drop(wfile);

        std::thread::sleep(Duration::from_millis(30));
        let lines = reader.read_lines_available(64);
        let joined: Vec<u8> = lines.concat();
        assert_eq!(joined, b"a\nb\nc");
    }

    #[test]
    fn shared_buf_cursor_advances() {
        let buf = SharedOutBuf::new();
        buf.write_all(b"one\n");
        assert_eq!(buf.read_available(), b"one\n");
        assert_eq!(buf.read_available(), b"");
        buf.write_all(b"two\n");
        assert_eq!(buf.read_available(), b"two\n");
        assert!(!buf.is_fully_read());
        buf.close();
        assert!(buf.is_fully_read());
        assert_eq!(buf.contents(), b"one\ntwo\n");
    }
}
