//! Shared page wire layout.
//!
//! A [`SharedPage`] carries two byte rings between a *front* party and a
//! *back* party. The layout is a versioned contract between independently
//! built parties, so it is `#[repr(C)]` with no self-describing header:
//!
//! ```text
//! offset     size  field       written by
//! 0          N     out data    front (front -> back)
//! N          N     in data     back  (back -> front)
//! 2N         4     out_cons    back
//! 2N + 4     4     out_prod    front
//! 2N + 8     4     in_cons     front
//! 2N + 12    4     in_prod     back
//! ```
//!
//! Indices are 32-bit little-endian counters that only ever increase
//! (modulo 2^32). A ring position is `index mod N`. A zero-filled page is
//! the initial state of both rings, so a freshly `ftruncate`d shared memory
//! object and [`SharedPage::default`] are equivalent.
//!
//! With `N = 1024` ([`XENSTORE_RING_SIZE`]) this is the classic xenstore
//! interface page.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::SharedMemorySafe;

/// Version of the page layout documented in this module.
pub const PAGE_LAYOUT_VERSION: u32 = 1;

/// Ring capacity of the classic xenstore interface page.
pub const XENSTORE_RING_SIZE: usize = 1024;

/// Which party a handle acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Writes the `out` ring, reads the `in` ring.
    Front,
    /// Writes the `in` ring, reads the `out` ring.
    Back,
}

impl Side {
    /// Ring this side produces into.
    #[inline]
    pub const fn tx(self) -> Direction {
        match self {
            Self::Front => Direction::Out,
            Self::Back => Direction::In,
        }
    }

    /// Ring this side consumes from.
    #[inline]
    pub const fn rx(self) -> Direction {
        match self {
            Self::Front => Direction::In,
            Self::Back => Direction::Out,
        }
    }

    #[inline]
    pub const fn peer(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Front => f.write_str("front"),
            Self::Back => f.write_str("back"),
        }
    }
}

/// One of the two rings in a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Front to back.
    Out,
    /// Back to front.
    In,
}

/// Data area of one ring.
///
/// Bytes are only reached through raw pointers by the ring algorithm. The
/// producer writes bytes between `prod` and `cons + N`, the consumer reads
/// bytes between `cons` and `prod`; the index publication protocol keeps
/// those regions disjoint.
#[repr(transparent)]
pub struct RingData<const N: usize>(UnsafeCell<[u8; N]>);

impl<const N: usize> RingData<N> {
    const fn new() -> Self {
        Self(UnsafeCell::new([0; N]))
    }

    #[inline]
    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }
}

// SAFETY: concurrent access to the bytes is coordinated by the ring indices:
// each byte is owned by exactly one role at a time and ownership moves with
// Release/Acquire index updates.
unsafe impl<const N: usize> Sync for RingData<N> {}
unsafe impl<const N: usize> Send for RingData<N> {}

// SAFETY: inline bytes, no pointers, valid when zero-filled.
unsafe impl<const N: usize> SharedMemorySafe for RingData<N> {}

/// The shared page: two rings plus their producer/consumer indices.
#[derive(SharedMemorySafe)]
#[repr(C)]
pub struct SharedPage<const N: usize = XENSTORE_RING_SIZE> {
    out_data: RingData<N>,
    in_data: RingData<N>,
    out_cons: AtomicU32,
    out_prod: AtomicU32,
    in_cons: AtomicU32,
    in_prod: AtomicU32,
}

impl<const N: usize> SharedPage<N> {
    /// Zeroed page: both rings empty at index 0.
    pub const fn new() -> Self {
        Self {
            out_data: RingData::new(),
            in_data: RingData::new(),
            out_cons: AtomicU32::new(0),
            out_prod: AtomicU32::new(0),
            in_cons: AtomicU32::new(0),
            in_prod: AtomicU32::new(0),
        }
    }

    /// Ring capacity in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Borrow one ring of the page.
    #[inline]
    pub(crate) const fn ring(&self, dir: Direction) -> RingRef<'_, N> {
        match dir {
            Direction::Out => RingRef {
                data: &self.out_data,
                prod: &self.out_prod,
                cons: &self.out_cons,
            },
            Direction::In => RingRef {
                data: &self.in_data,
                prod: &self.in_prod,
                cons: &self.in_cons,
            },
        }
    }

    /// Relaxed `(producer, consumer)` snapshot, for diagnostics.
    pub fn indices(&self, dir: Direction) -> (u32, u32) {
        let ring = self.ring(dir);
        (
            load_index(ring.prod, Ordering::Relaxed),
            load_index(ring.cons, Ordering::Relaxed),
        )
    }

    /// Overwrite both indices of a ring. Only meaningful before the ring is
    /// in use, or to model a misbehaving peer.
    #[cfg(test)]
    pub(crate) fn force_indices(&self, dir: Direction, prod: u32, cons: u32) {
        let ring = self.ring(dir);
        store_index(ring.prod, prod, Ordering::SeqCst);
        store_index(ring.cons, cons, Ordering::SeqCst);
    }
}

impl<const N: usize> Default for SharedPage<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for SharedPage<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPage")
            .field("capacity", &N)
            .field("out", &self.indices(Direction::Out))
            .field("in", &self.indices(Direction::In))
            .finish()
    }
}

/// Borrowed view of one ring: its data area and the two indices that gate it.
#[derive(Clone, Copy)]
pub(crate) struct RingRef<'a, const N: usize> {
    pub(crate) data: &'a RingData<N>,
    pub(crate) prod: &'a AtomicU32,
    pub(crate) cons: &'a AtomicU32,
}

/// Indices are stored little-endian on the page.
#[inline]
pub(crate) fn load_index(index: &AtomicU32, order: Ordering) -> u32 {
    u32::from_le(index.load(order))
}

#[inline]
pub(crate) fn store_index(index: &AtomicU32, value: u32, order: Ordering) {
    index.store(value.to_le(), order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_wire_contract() {
        assert_eq!(offset_of!(SharedPage<1024>, out_data), 0);
        assert_eq!(offset_of!(SharedPage<1024>, in_data), 1024);
        assert_eq!(offset_of!(SharedPage<1024>, out_cons), 2048);
        assert_eq!(offset_of!(SharedPage<1024>, out_prod), 2052);
        assert_eq!(offset_of!(SharedPage<1024>, in_cons), 2056);
        assert_eq!(offset_of!(SharedPage<1024>, in_prod), 2060);
        assert_eq!(size_of::<SharedPage<1024>>(), 2064);
        assert!(size_of::<SharedPage>() <= 4096);
    }

    #[test]
    fn small_page_layout() {
        assert_eq!(offset_of!(SharedPage<8>, in_data), 8);
        assert_eq!(offset_of!(SharedPage<8>, out_cons), 16);
        assert_eq!(size_of::<SharedPage<8>>(), 32);
    }

    #[test]
    fn sides_are_mirrored() {
        assert_eq!(Side::Front.tx(), Side::Back.rx());
        assert_eq!(Side::Back.tx(), Side::Front.rx());
        assert_eq!(Side::Front.peer(), Side::Back);
    }

    #[test]
    fn indices_are_little_endian_on_the_page() {
        let page = SharedPage::<8>::new();
        page.force_indices(Direction::Out, 0x0102_0304, 0);
        let raw = page.out_prod.load(Ordering::Relaxed);
        assert_eq!(raw.to_ne_bytes(), 0x0102_0304u32.to_le_bytes());
        assert_eq!(page.indices(Direction::Out), (0x0102_0304, 0));
    }
}
