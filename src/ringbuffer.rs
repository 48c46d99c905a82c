//! Lock-free single-producer single-consumer byte FIFO.
//!
//! The transport primitive under the atom channels and the worker pump.
//! Capacity must be a power of two; indices are monotonic 64-bit counters
//! addressed through a mask, so they never wrap within a process lifetime.
//! Both sides are wait-free: `write` and `read` transfer as many bytes as
//! currently fit and report the count.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{HostError, Result};

/// Pad an atomic index onto its own cache line so the producer and the
/// consumer never invalidate each other's line.
#[repr(align(64))]
struct CacheAligned<T>(T);

struct Inner {
    buf: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    mask: usize,
    write_pos: CacheAligned<AtomicU64>,
    read_pos: CacheAligned<AtomicU64>,
}

// SAFETY: the byte range [read, write) is only read by the consumer and the
// range [write, write + write_space) only written by the producer; index
// publication is release/acquire, so neither side observes bytes the other
// is still touching.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn read_space(&self) -> usize {
        let w = self.write_pos.0.load(Ordering::Acquire);
        let r = self.read_pos.0.load(Ordering::Relaxed);
        (w - r) as usize
    }

    fn write_space(&self) -> usize {
        let w = self.write_pos.0.load(Ordering::Relaxed);
        let r = self.read_pos.0.load(Ordering::Acquire);
        self.capacity - (w - r) as usize
    }

    /// Copy `cnt` bytes starting at ring position `pos` into `dst`,
    /// honoring the wrap point.
    ///
    /// SAFETY: caller must hold the consumer role and `cnt` must be within
    /// published read space.
    unsafe fn copy_out(&self, pos: u64, dst: &mut [u8], cnt: usize) {
        let buf = unsafe { &*self.buf.get() };
        let start = pos as usize & self.mask;
        let first = cnt.min(self.capacity - start);
        dst[..first].copy_from_slice(&buf[start..start + first]);
        if cnt > first {
            dst[first..cnt].copy_from_slice(&buf[..cnt - first]);
        }
    }

    /// Copy `cnt` bytes from `src` into the ring starting at position `pos`.
    ///
    /// SAFETY: caller must hold the producer role and `cnt` must be within
    /// free write space.
    unsafe fn copy_in(&self, pos: u64, src: &[u8], cnt: usize) {
        let buf = unsafe { &mut *self.buf.get() };
        let start = pos as usize & self.mask;
        let first = cnt.min(self.capacity - start);
        buf[start..start + first].copy_from_slice(&src[..first]);
        if cnt > first {
            buf[..cnt - first].copy_from_slice(&src[first..cnt]);
        }
    }
}

/// Handle used to create a split ringbuffer.
pub struct Ringbuffer;

impl Ringbuffer {
    /// Allocate a ringbuffer of `capacity` bytes and split it into its two
    /// endpoints. Fails with [`HostError::BadCapacity`] unless `capacity`
    /// is a non-zero power of two.
    pub fn with_capacity(capacity: usize) -> Result<(Producer, Consumer)> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(HostError::BadCapacity(capacity));
        }
        let inner = Arc::new(Inner {
            buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            mask: capacity - 1,
            write_pos: CacheAligned(AtomicU64::new(0)),
            read_pos: CacheAligned(AtomicU64::new(0)),
        });
        Ok((
            Producer {
                inner: Arc::clone(&inner),
            },
            Consumer { inner },
        ))
    }
}

/// Writing endpoint. Exactly one exists per ringbuffer; movable to any
/// thread, not clonable.
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes that can be written without overwriting unread data.
    pub fn write_space(&self) -> usize {
        self.inner.write_space()
    }

    /// Write up to `src.len()` bytes; returns the count actually written.
    /// Bytes are published before the write index advances (release), so a
    /// concurrent reader never observes a torn span.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let space = self.inner.write_space();
        let cnt = src.len().min(space);
        if cnt == 0 {
            return 0;
        }
        let w = self.inner.write_pos.0.load(Ordering::Relaxed);
        unsafe { self.inner.copy_in(w, src, cnt) };
        self.inner
            .write_pos
            .0
            .store(w + cnt as u64, Ordering::Release);
        cnt
    }
}

/// Reading endpoint. Exactly one exists per ringbuffer.
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes available to read.
    pub fn read_space(&self) -> usize {
        self.inner.read_space()
    }

    /// Copy up to `dst.len()` bytes without consuming them; returns the
    /// count copied.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let avail = self.inner.read_space();
        let cnt = dst.len().min(avail);
        if cnt == 0 {
            return 0;
        }
        let r = self.inner.read_pos.0.load(Ordering::Relaxed);
        unsafe { self.inner.copy_out(r, dst, cnt) };
        cnt
    }

    /// Read up to `dst.len()` bytes; returns the count actually read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let cnt = self.peek(dst);
        if cnt > 0 {
            let r = self.inner.read_pos.0.load(Ordering::Relaxed);
            self.inner
                .read_pos
                .0
                .store(r + cnt as u64, Ordering::Release);
        }
        cnt
    }

    /// Consume up to `n` bytes without copying them anywhere; returns the
    /// count skipped. Used to discard records that cannot be delivered.
    pub fn skip(&mut self, n: usize) -> usize {
        let cnt = n.min(self.inner.read_space());
        if cnt > 0 {
            let r = self.inner.read_pos.0.load(Ordering::Relaxed);
            self.inner
                .read_pos
                .0
                .store(r + cnt as u64, Ordering::Release);
        }
        cnt
    }

    /// Drain everything currently readable.
    pub fn clear(&mut self) {
        let avail = self.inner.read_space();
        self.skip(avail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            Ringbuffer::with_capacity(0),
            Err(HostError::BadCapacity(0))
        ));
        assert!(matches!(
            Ringbuffer::with_capacity(3),
            Err(HostError::BadCapacity(3))
        ));
        assert!(Ringbuffer::with_capacity(1024).is_ok());
    }

    #[test]
    fn write_read_roundtrip() {
        let (mut tx, mut rx) = Ringbuffer::with_capacity(16).unwrap();
        assert_eq!(tx.write(b"hello"), 5);
        assert_eq!(rx.read_space(), 5);
        assert_eq!(tx.write_space(), 11);

        let mut out = [0u8; 5];
        assert_eq!(rx.peek(&mut out), 5);
        assert_eq!(&out, b"hello");
        // peek is non-destructive
        assert_eq!(rx.read_space(), 5);
        assert_eq!(rx.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(rx.read_space(), 0);
    }

    #[test]
    fn partial_write_when_full() {
        let (mut tx, mut rx) = Ringbuffer::with_capacity(8).unwrap();
        assert_eq!(tx.write(b"0123456789"), 8);
        assert_eq!(tx.write(b"x"), 0);

        let mut out = [0u8; 3];
        assert_eq!(rx.read(&mut out), 3);
        assert_eq!(&out, b"012");
        // freed space becomes writable again, across the wrap point
        assert_eq!(tx.write(b"abc"), 3);
        let mut rest = [0u8; 8];
        assert_eq!(rx.read(&mut rest), 8);
        assert_eq!(&rest, b"34567abc");
    }

    #[test]
    fn skip_and_clear() {
        let (mut tx, mut rx) = Ringbuffer::with_capacity(16).unwrap();
        tx.write(b"abcdef");
        assert_eq!(rx.skip(2), 2);
        let mut out = [0u8; 4];
        assert_eq!(rx.read(&mut out), 4);
        assert_eq!(&out, b"cdef");
        tx.write(b"zz");
        rx.clear();
        assert_eq!(rx.read_space(), 0);
    }

    #[test]
    fn spsc_stress_preserves_order() {
        let (mut tx, mut rx) = Ringbuffer::with_capacity(1024).unwrap();
        const COUNT: u32 = 1_000_000;

        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let bytes = i.to_ne_bytes();
                let mut written = 0;
                while written < bytes.len() {
                    written += tx.write(&bytes[written..]);
                    if written < bytes.len() {
                        std::hint::spin_loop();
                    }
                }
            }
        });

        let mut expected = 0u32;
        let mut buf = [0u8; 4];
        while expected < COUNT {
            let mut got = 0;
            while got < 4 {
                got += rx.read(&mut buf[got..]);
                if got < 4 {
                    std::hint::spin_loop();
                }
            }
            assert_eq!(u32::from_ne_bytes(buf), expected);
            expected += 1;
        }

        producer.join().unwrap();
        assert_eq!(rx.read_space(), 0);
    }
}
