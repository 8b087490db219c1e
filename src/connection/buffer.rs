//! Network buffers and the per-thread loan protocol.
//!
//! Most connections are idle most of the time, so they do not own their
//! buffers. A worker thread keeps one spare read and one spare write buffer;
//! a connection borrows them while it runs and gives them back when it goes
//! idle with nothing left in them.
//!
//! ```text
//!   connection becomes active            connection goes idle
//!   ─────────────────────────            ────────────────────
//!   has a buffer?     ─▶ Existing         buffer empty?
//!   thread spare?     ─▶ Loaned             spare slot free? ─▶ back to the thread
//!   otherwise         ─▶ Allocated          otherwise        ─▶ freed
//!                                         buffer has data?   ─▶ stays with connection
//! ```

use std::collections::TryReserveError;
use std::fmt;

/// A growable byte buffer with consumed/produced cursors.
///
/// ```text
///   0          start            end              capacity
///   │ consumed │ unconsumed data │ free space    │
/// ```
pub struct NetBuf {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuf")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl NetBuf {
    /// Allocates a buffer, reporting allocation failure instead of aborting.
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        data.resize(capacity, 0);
        Ok(Self {
            data,
            start: 0,
            end: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Marks `n` bytes at the front as consumed.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Free space after the produced cursor.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Marks `n` bytes of the spare area as produced.
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.data.len());
    }

    /// Appends bytes, growing the buffer if needed.
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), TryReserveError> {
        self.reserve(bytes.len())?;
        let end = self.end;
        self.data[end..end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// Makes sure `additional` bytes fit after the produced cursor.
    ///
    /// On failure the buffer keeps its contents.
    pub fn reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        if self.data.len() - self.end >= additional {
            return Ok(());
        }
        self.compact();
        let needed = self.end.saturating_add(additional);
        if needed > self.data.len() {
            let new_len = needed.max(self.data.len() * 2);
            self.data.try_reserve_exact(new_len - self.data.len())?;
            self.data.resize(new_len, 0);
        }
        Ok(())
    }

    /// Moves unconsumed data to the front of the storage.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// Makes room for more input: compacts first, then doubles the storage
    /// up to `max`.
    ///
    /// # Returns
    ///
    /// `false` if the buffer is full and cannot grow any further.
    pub fn make_room(&mut self, max: usize) -> bool {
        if self.end < self.data.len() {
            return true;
        }
        self.compact();
        if self.end < self.data.len() {
            return true;
        }
        let current = self.data.len();
        if current >= max {
            return false;
        }
        let target = (current.max(1) * 2).min(max);
        if self.data.try_reserve_exact(target - current).is_err() {
            return false;
        }
        self.data.resize(target, 0);
        true
    }

    /// Shrinks an empty buffer that grew beyond `threshold` back to `size`.
    pub fn shrink(&mut self, size: usize, threshold: usize) {
        if self.is_empty() && self.data.len() > threshold {
            self.data.truncate(size);
            self.data.shrink_to_fit();
            self.clear();
        }
    }
}

/// Where a connection's buffer came from when it became active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLoan {
    /// The connection already held a buffer
    Existing,
    /// Taken from the thread's spare slot
    Loaned,
    /// Freshly allocated
    Allocated,
}

/// A thread's spare buffers.
#[derive(Debug)]
pub struct BufferPool {
    read: Option<NetBuf>,
    write: Option<NetBuf>,
    size: usize,
}

impl BufferPool {
    /// Creates a pool of buffers of `size` bytes, spares pre-allocated.
    pub fn new(size: usize) -> Self {
        Self {
            read: NetBuf::try_with_capacity(size).ok(),
            write: NetBuf::try_with_capacity(size).ok(),
            size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn has_spare_read(&self) -> bool {
        self.read.is_some()
    }

    pub fn has_spare_write(&self) -> bool {
        self.write.is_some()
    }

    pub fn loan_read(&mut self, slot: &mut Option<NetBuf>) -> Result<BufferLoan, TryReserveError> {
        loan(slot, &mut self.read, self.size)
    }

    pub fn loan_write(
        &mut self,
        slot: &mut Option<NetBuf>,
    ) -> Result<BufferLoan, TryReserveError> {
        loan(slot, &mut self.write, self.size)
    }

    pub fn return_read(&mut self, slot: &mut Option<NetBuf>) {
        give_back(slot, &mut self.read, self.size)
    }

    pub fn return_write(&mut self, slot: &mut Option<NetBuf>) {
        give_back(slot, &mut self.write, self.size)
    }
}

fn loan(
    slot: &mut Option<NetBuf>,
    spare: &mut Option<NetBuf>,
    size: usize,
) -> Result<BufferLoan, TryReserveError> {
    if slot.is_some() {
        return Ok(BufferLoan::Existing);
    }
    if let Some(buf) = spare.take() {
        *slot = Some(buf);
        return Ok(BufferLoan::Loaned);
    }
    *slot = Some(NetBuf::try_with_capacity(size)?);
    Ok(BufferLoan::Allocated)
}

fn give_back(slot: &mut Option<NetBuf>, spare: &mut Option<NetBuf>, size: usize) {
    match slot {
        Some(buf) if buf.is_empty() => {}
        _ => return,
    }
    if let Some(mut buf) = slot.take() {
        if spare.is_none() && buf.capacity() == size {
            buf.clear();
            *spare = Some(buf);
        }
        // Otherwise the buffer is dropped here
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursors() {
        let mut buf = NetBuf::try_with_capacity(8).unwrap();
        buf.spare()[..3].copy_from_slice(b"abc");
        buf.commit(3);
        assert_eq!(buf.data(), b"abc");

        buf.consume(1);
        assert_eq!(buf.data(), b"bc");
        buf.consume(2);
        assert!(buf.is_empty());
        assert_eq!(buf.spare().len(), 8);
    }

    #[test]
    fn test_make_room_compacts_then_grows() {
        let mut buf = NetBuf::try_with_capacity(4).unwrap();
        buf.put(b"abcd").unwrap();
        buf.consume(2);
        assert!(buf.make_room(16));
        assert_eq!(buf.capacity(), 4);
        assert_eq!(buf.data(), b"cd");

        buf.put(b"ef").unwrap();
        assert!(buf.make_room(16));
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.data(), b"cdef");

        let mut full = NetBuf::try_with_capacity(4).unwrap();
        full.put(b"abcd").unwrap();
        assert!(!full.make_room(4));
    }

    #[test]
    fn test_reserve_failure_keeps_data() {
        let mut buf = NetBuf::try_with_capacity(8).unwrap();
        buf.put(b"abcdef").unwrap();
        buf.consume(2);

        assert!(buf.reserve(usize::MAX).is_err());
        assert!(buf.put(&[0u8; 4]).is_ok());
        assert_eq!(&buf.data()[..4], b"cdef");
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_shrink_only_when_empty() {
        let mut buf = NetBuf::try_with_capacity(4).unwrap();
        buf.put(&[0u8; 64]).unwrap();
        buf.shrink(4, 16);
        assert_eq!(buf.capacity(), 64);

        buf.clear();
        buf.shrink(4, 16);
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_loan_order() {
        let mut pool = BufferPool::new(32);
        let mut first = None;
        let mut second = None;

        assert_eq!(pool.loan_read(&mut first).unwrap(), BufferLoan::Loaned);
        assert!(!pool.has_spare_read());
        assert_eq!(pool.loan_read(&mut second).unwrap(), BufferLoan::Allocated);
        assert_eq!(pool.loan_read(&mut first).unwrap(), BufferLoan::Existing);
    }

    #[test]
    fn test_return_keeps_unconsumed_data() {
        let mut pool = BufferPool::new(32);
        let mut slot = None;
        pool.loan_read(&mut slot).unwrap();
        slot.as_mut().unwrap().put(b"partial").unwrap();

        pool.return_read(&mut slot);
        assert!(slot.is_some());
        assert!(!pool.has_spare_read());

        slot.as_mut().unwrap().clear();
        pool.return_read(&mut slot);
        assert!(slot.is_none());
        assert!(pool.has_spare_read());
    }

    #[test]
    fn test_single_owner() {
        // A buffer is either in the spare slot or with exactly one connection.
        let mut pool = BufferPool::new(32);
        let mut a = None;
        let mut b = None;

        pool.loan_write(&mut a).unwrap();
        pool.loan_write(&mut b).unwrap();
        pool.return_write(&mut a);
        pool.return_write(&mut b);

        // Only one of the two fits in the spare slot, the other is freed.
        assert!(a.is_none() && b.is_none());
        assert!(pool.has_spare_write());
        let mut c = None;
        assert_eq!(pool.loan_write(&mut c).unwrap(), BufferLoan::Loaned);
        assert_eq!(pool.loan_write(&mut a).unwrap(), BufferLoan::Allocated);
    }
}
