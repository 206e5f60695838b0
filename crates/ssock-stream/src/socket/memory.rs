//! In-process duplex socket pair.
//!
//! Each end owns the receive side of one pipe and the send side of the
//! other, so the pair can be split across threads. Useful for loopback
//! sessions in tests and benchmarks where a real TCP connection would only
//! add noise.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::RawSocket;

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    /// Writer side closed: readers drain what is left, then see end of stream.
    writer_closed: bool,
    /// Reader side closed: further writes fail.
    reader_closed: bool,
    capacity: Option<usize>,
}

#[derive(Default)]
struct Channel {
    pipe: Mutex<Pipe>,
    ready: Condvar,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, Pipe> {
        // A poisoned pipe still holds consistent bytes.
        self.pipe.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One end of an in-memory duplex byte stream.
pub struct MemorySocket {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
    blocking: bool,
    read_chunk: Option<usize>,
    reads: usize,
    closed: bool,
}

/// Create a connected pair of in-memory sockets.
pub fn pair() -> (MemorySocket, MemorySocket) {
    let a_to_b = Arc::new(Channel::default());
    let b_to_a = Arc::new(Channel::default());
    (
        MemorySocket::new(Arc::clone(&b_to_a), Arc::clone(&a_to_b)),
        MemorySocket::new(a_to_b, b_to_a),
    )
}

impl MemorySocket {
    fn new(rx: Arc<Channel>, tx: Arc<Channel>) -> Self {
        Self {
            rx,
            tx,
            blocking: true,
            read_chunk: None,
            reads: 0,
            closed: false,
        }
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Deliver at most `chunk` bytes per read, to exercise partial reads.
    pub fn set_read_chunk(&mut self, chunk: usize) {
        self.read_chunk = Some(chunk.max(1));
    }

    /// Limit how many bytes may sit unread in this end's receive pipe.
    /// Writers hitting the limit get `WouldBlock`.
    pub fn set_capacity(&self, capacity: usize) {
        self.rx.lock().capacity = Some(capacity);
    }

    /// Number of successful reads that returned data or end of stream.
    pub fn read_calls(&self) -> usize {
        self.reads
    }

    /// Bytes waiting to be read on this end.
    pub fn available(&self) -> usize {
        self.rx.lock().data.len()
    }
}

impl RawSocket for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut pipe = self.rx.lock();
        loop {
            if !pipe.data.is_empty() {
                let limit = self.read_chunk.unwrap_or(usize::MAX);
                let n = buf.len().min(pipe.data.len()).min(limit);
                for (dst, src) in buf.iter_mut().zip(pipe.data.drain(..n)) {
                    *dst = src;
                }
                self.reads += 1;
                self.rx.ready.notify_all();
                return Ok(n);
            }
            if pipe.writer_closed || buf.is_empty() {
                self.reads += 1;
                return Ok(0);
            }
            if !self.blocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            pipe = self
                .rx
                .ready
                .wait(pipe)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut pipe = self.tx.lock();
        if pipe.reader_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let room = match pipe.capacity {
            Some(cap) => cap.saturating_sub(pipe.data.len()),
            None => buf.len(),
        };
        if room == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(room);
        pipe.data.extend(&buf[..n]);
        self.tx.ready.notify_all();
        Ok(n)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let pipe = self.rx.lock();
        let (pipe, _) = self
            .rx
            .ready
            .wait_timeout_while(pipe, timeout, |p| p.data.is_empty() && !p.writer_closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(!pipe.data.is_empty() || pipe.writer_closed)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        {
            let mut outgoing = self.tx.lock();
            outgoing.writer_closed = true;
            self.tx.ready.notify_all();
        }
        let mut incoming = self.rx.lock();
        incoming.reader_closed = true;
        self.rx.ready.notify_all();
        Ok(())
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
