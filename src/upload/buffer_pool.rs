//! Bounded pool of fixed-size upload buffers.
//!
//! The pool re-chunks an arbitrary byte stream into `buff_size` pieces.
//! At most `max_buffs` buffers exist at once; when all of them are lent
//! out, acquiring the next one waits until a [`PooledBuffer`] is returned.
//! That wait is the backpressure that caps upload memory at
//! `max_buffs * buff_size`.
//!
//! A [`PooledBuffer`] goes back to the free list when it is dropped, so a
//! buffer is returned exactly once whether its upload succeeded, failed or
//! was never attempted.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::errors::BlobError;

/// Free list shared between the pool and the buffers it has lent out.
struct PoolShared {
    /// One permit per buffer that may exist.
    permits: Arc<Semaphore>,
    /// Previously allocated buffers ready for reuse.
    free: Mutex<Vec<BytesMut>>,
    /// Number of buffers ever allocated.
    allocated: AtomicUsize,
}

impl PoolShared {
    fn recycle(&self, mut buf: BytesMut) {
        buf.clear();
        match self.free.lock() {
            Ok(mut free) => free.push(buf),
            // A poisoned list only loses the allocation; the permit is
            // still released by the caller.
            Err(poisoned) => poisoned.into_inner().push(buf),
        }
    }

    fn take_free(&self) -> Option<BytesMut> {
        match self.free.lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }
}

/// A filled (or partially filled) buffer lent out by an [`UploadBufferPool`].
///
/// Dereferences to the bytes written so far.
pub struct PooledBuffer {
    data: BytesMut,
    capacity: usize,
    shared: Arc<PoolShared>,
    // Released after `Drop::drop` has put the buffer back on the free list.
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }

    /// Copy as much of `input` as fits; returns the number of bytes taken.
    fn fill(&mut self, input: &[u8]) -> usize {
        let n = self.remaining().min(input.len());
        self.data.extend_from_slice(&input[..n]);
        n
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.data);
        self.shared.recycle(buf);
    }
}

/// Re-chunks written bytes into buffers of exactly `buff_size` bytes.
pub struct UploadBufferPool {
    buff_size: usize,
    max_buffs: usize,
    shared: Arc<PoolShared>,
    /// The buffer currently being filled.
    current: Option<PooledBuffer>,
}

impl std::fmt::Debug for UploadBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBufferPool")
            .field("buff_size", &self.buff_size)
            .field("max_buffs", &self.max_buffs)
            .field("allocated", &self.allocated())
            .field("pending", &self.pending())
            .finish()
    }
}

impl UploadBufferPool {
    /// Create a pool of at most `max_buffs` buffers of `buff_size` bytes.
    ///
    /// Two buffers are the minimum: one being filled while another is
    /// still in flight.
    pub fn new(max_buffs: usize, buff_size: usize) -> Result<Self, BlobError> {
        if max_buffs < 2 {
            return Err(BlobError::invalid_argument(format!(
                "UploadBufferPool needs at least 2 buffers, got {max_buffs}"
            )));
        }
        if buff_size == 0 {
            return Err(BlobError::invalid_argument(
                "UploadBufferPool buffer size must be positive",
            ));
        }
        Ok(Self {
            buff_size,
            max_buffs,
            shared: Arc::new(PoolShared {
                permits: Arc::new(Semaphore::new(max_buffs)),
                free: Mutex::new(Vec::with_capacity(max_buffs)),
                allocated: AtomicUsize::new(0),
            }),
            current: None,
        })
    }

    pub fn buff_size(&self) -> usize {
        self.buff_size
    }

    pub fn max_buffs(&self) -> usize {
        self.max_buffs
    }

    /// Number of buffers allocated so far (never more than `max_buffs`).
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Acquire)
    }

    /// Number of buffers that can be acquired right now without waiting.
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Bytes sitting in the buffer currently being filled.
    pub fn pending(&self) -> usize {
        self.current.as_ref().map_or(0, |b| b.len())
    }

    /// Take a buffer off the free list, allocate one if the pool is not at
    /// capacity, or wait for one to be returned.
    async fn get_buffer(&self) -> Result<PooledBuffer, BlobError> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| BlobError::io(format!("Upload buffer pool closed: {e}")))?;

        let data = match self.shared.take_free() {
            Some(buf) => buf,
            None => {
                let n = self.shared.allocated.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(allocated = n, size = self.buff_size, "allocating upload buffer");
                BytesMut::with_capacity(self.buff_size)
            }
        };

        Ok(PooledBuffer {
            data,
            capacity: self.buff_size,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Write `data` into the pool, returning every buffer that became full.
    ///
    /// `data` may be at most one buffer long, so a single write never
    /// holds more than two buffers (the one it filled and the one holding
    /// the overflow).  Callers split larger inputs first.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<Vec<PooledBuffer>, BlobError> {
        if data.len() > self.buff_size {
            return Err(BlobError::invalid_argument(format!(
                "Write of {} bytes exceeds the pool buffer size of {}",
                data.len(),
                self.buff_size
            )));
        }

        let mut ready = Vec::new();
        while !data.is_empty() {
            let mut current = match self.current.take() {
                Some(buf) => buf,
                None => self.get_buffer().await?,
            };
            let taken = current.fill(data);
            data = &data[taken..];

            if current.is_full() {
                ready.push(current);
            } else {
                self.current = Some(current);
            }
        }
        Ok(ready)
    }

    /// Emit the partially filled buffer, if it holds any bytes.
    pub fn flush(&mut self) -> Option<PooledBuffer> {
        self.current.take().filter(|buf| !buf.is_empty())
    }

    /// Hand a buffer back once its upload has completed.  Dropping the
    /// buffer has the same effect.
    pub fn return_buffer(&self, buffer: PooledBuffer) {
        drop(buffer);
    }
}
