//! Single-producer/single-consumer byte rings on a shared page.
//!
//! [`Writer`] and [`Reader`] are the two ends of one ring of a
//! [`SharedPage`]. They work over any handle that derefs to the page: an
//! `Arc` for threads in one process, or a [`Shm`] mapping for separate
//! processes.
//!
//! Writes and reads are partial: they move as many bytes as currently fit
//! or are available and return the count. Zero is a normal result meaning
//! "not now". Neither end notifies the peer; pair a ring with an
//! [`EventChannel`] (see [`Connection`]) for that.
//!
//! [`slots`] holds the other ring family: fixed-size request/response slots
//! whose producers notify only when the consumer asked for it.
//!
//! # Example
//!
//! ```
//! use evring::ring;
//!
//! let (writer, reader) = ring::channel::<8>();
//!
//! assert_eq!(writer.write(b"HELLOWORLD")?, 8);
//! assert_eq!(reader.read_to_vec(100)?, b"HELLOWOR");
//! assert_eq!(writer.write(b"LD")?, 2);
//! # Ok::<(), evring::ring::RingError>(())
//! ```
//!
//! [`Shm`]: crate::ipc::shmem::Shm
//! [`EventChannel`]: crate::event::EventChannel
//! [`Connection`]: crate::connection::Connection

pub(crate) mod raw;
pub mod slots;

use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::page::{Direction, SharedPage};
use crate::trace::warn;

pub(crate) use raw::CapacityCheck;
pub use slots::{BackRing, FrontRing, SlotRing};

/// Errors produced by ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// The indices are further apart than the ring can hold. The peer is
    /// corrupt or hostile; the ring cannot be used any more.
    #[error(
        "ring protocol violation: producer index {producer} and consumer index {consumer} \
         exceed capacity {capacity}"
    )]
    ProtocolViolation {
        producer: u32,
        consumer: u32,
        capacity: usize,
    },
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Producer end of one ring.
///
/// `Send` but not `Sync`: at most one thread writes through it at a time.
/// Only one `Writer` may exist per ring across both parties.
pub struct Writer<P, const N: usize> {
    page: P,
    dir: Direction,
    _unsync: PhantomUnsync,
}

/// Consumer end of one ring.
///
/// `Send` but not `Sync`. Only one `Reader` may exist per ring across both
/// parties.
pub struct Reader<P, const N: usize> {
    page: P,
    dir: Direction,
    _unsync: PhantomUnsync,
}

impl<P: Deref<Target = SharedPage<N>>, const N: usize> Writer<P, N> {
    /// Producer end of ring `dir` on `page`.
    pub fn new(page: P, dir: Direction) -> Self {
        let () = CapacityCheck::<N>::OK;
        Self {
            page,
            dir,
            _unsync: PhantomData,
        }
    }

    /// Copy as many bytes of `src` as fit and publish them.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the peer corrupted the indices.
    pub fn write(&self, src: &[u8]) -> Result<usize, RingError> {
        self.page.ring(self.dir).write(src).inspect_err(|err| {
            warn!(direction = ?self.dir, %err, "ring write rejected");
        })
    }

    /// Free space in bytes.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the peer corrupted the indices.
    pub fn available_to_write(&self) -> Result<usize, RingError> {
        self.page.ring(self.dir).available_to_write()
    }

    /// Bytes written but not yet consumed by the peer.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the peer corrupted the indices.
    pub fn available_to_read(&self) -> Result<usize, RingError> {
        self.page.ring(self.dir).available_to_read()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn page(&self) -> &SharedPage<N> {
        &self.page
    }
}

impl<P: Deref<Target = SharedPage<N>>, const N: usize> Reader<P, N> {
    /// Consumer end of ring `dir` on `page`.
    pub fn new(page: P, dir: Direction) -> Self {
        let () = CapacityCheck::<N>::OK;
        Self {
            page,
            dir,
            _unsync: PhantomData,
        }
    }

    /// Copy up to `dst.len()` bytes out and release their space.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the peer corrupted the indices.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, RingError> {
        self.page.ring(self.dir).read(dst).inspect_err(|err| {
            warn!(direction = ?self.dir, %err, "ring read rejected");
        })
    }

    /// Read up to `max_len` bytes into a fresh vector.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the peer corrupted the indices.
    pub fn read_to_vec(&self, max_len: usize) -> Result<Vec<u8>, RingError> {
        let len = max_len.min(self.available_to_read()?);
        let mut buf = vec![0; len];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Bytes ready to read.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the peer corrupted the indices.
    pub fn available_to_read(&self) -> Result<usize, RingError> {
        self.page.ring(self.dir).available_to_read()
    }

    /// Free space the peer could write into.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the peer corrupted the indices.
    pub fn available_to_write(&self) -> Result<usize, RingError> {
        self.page.ring(self.dir).available_to_write()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn page(&self) -> &SharedPage<N> {
        &self.page
    }
}

impl From<RingError> for io::Error {
    fn from(err: RingError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// Non-blocking: a full ring is `WouldBlock`.
impl<P: Deref<Target = SharedPage<N>>, const N: usize> io::Write for Writer<P, N> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match Writer::write(&*self, buf)? {
            0 => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Non-blocking: an empty ring is `WouldBlock`, never end-of-file.
impl<P: Deref<Target = SharedPage<N>>, const N: usize> io::Read for Reader<P, N> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match Reader::read(&*self, buf)? {
            0 => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }
}

/// In-process ring over a heap page: the `out` ring of a fresh
/// [`SharedPage`].
///
/// Fails to compile if `N` is not a power of two between 4 and 2^31.
#[must_use]
pub fn channel<const N: usize>() -> (
    Writer<Arc<SharedPage<N>>, N>,
    Reader<Arc<SharedPage<N>>, N>,
) {
    let page = Arc::new(SharedPage::new());
    (
        Writer::new(Arc::clone(&page), Direction::Out),
        Reader::new(page, Direction::Out),
    )
}
