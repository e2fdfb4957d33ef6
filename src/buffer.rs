//! Reusable receive buffers
//!
//! The receive loop checks a buffer out before every read and returns it
//! after handing the datagram off, so steady-state receiving does not
//! allocate per packet.

use std::sync::Mutex;

pub(crate) struct BufferPool {
    bufs: Mutex<Vec<Box<[u8]>>>,
    buf_len: usize,
    max_cached: usize,
}

impl BufferPool {
    pub(crate) fn new(buf_len: usize, max_cached: usize) -> Self {
        Self {
            bufs: Mutex::new(Vec::with_capacity(max_cached)),
            buf_len,
            max_cached,
        }
    }

    /// Check out a zeroed-or-dirty buffer of the pool's fixed length
    pub(crate) fn take(&self) -> Box<[u8]> {
        self.bufs
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0; self.buf_len].into_boxed_slice())
    }

    /// Return a buffer; dropped instead if the pool is full
    pub(crate) fn put(&self, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), self.buf_len);
        let mut bufs = self.bufs.lock().unwrap();
        if bufs.len() < self.max_cached {
            bufs.push(buf);
        }
    }
}
