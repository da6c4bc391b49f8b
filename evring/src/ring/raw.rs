//! Byte ring algorithm over one borrowed ring of a [`SharedPage`].
//!
//! Both parties run this code against the same indices. The producer owns
//! `prod`, the consumer owns `cons`; each loads its own index Relaxed and the
//! remote index Acquire, copies bytes, then publishes its own index with
//! Release. Nothing here blocks or notifies.
//!
//! [`SharedPage`]: crate::page::SharedPage

use std::cmp::min;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::page::{RingRef, load_index, store_index};
use crate::ring::RingError;

/// Compile-time check of the ring capacity.
///
/// Positions are `index & (N - 1)` and the distance between the indices must
/// fit a `u32`, so `N` is a power of two no larger than 2^31. The lower bound
/// keeps the index words 4-byte aligned right after the data areas.
pub(crate) struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    pub(crate) const OK: () = assert!(
        N.is_power_of_two() && N >= 4 && N <= 1 << 31,
        "ring capacity must be a power of two between 4 and 2^31"
    );
}

impl<const N: usize> RingRef<'_, N> {
    const MASK: u32 = (N - 1) as u32;

    /// Bytes in flight, or a protocol violation if the indices are further
    /// apart than the ring can hold.
    #[inline]
    fn used(prod: u32, cons: u32) -> Result<usize, RingError> {
        let used = prod.wrapping_sub(cons) as usize;
        if used > N {
            return Err(RingError::ProtocolViolation {
                producer: prod,
                consumer: cons,
                capacity: N,
            });
        }
        Ok(used)
    }

    /// Free space as seen by the producer.
    pub(crate) fn available_to_write(&self) -> Result<usize, RingError> {
        let prod = load_index(self.prod, Ordering::Relaxed);
        let cons = load_index(self.cons, Ordering::Acquire);
        Self::used(prod, cons).map(|used| N - used)
    }

    /// Readable bytes as seen by the consumer.
    pub(crate) fn available_to_read(&self) -> Result<usize, RingError> {
        let prod = load_index(self.prod, Ordering::Acquire);
        let cons = load_index(self.cons, Ordering::Relaxed);
        Self::used(prod, cons)
    }

    /// Copy as much of `src` as fits and publish it.
    ///
    /// Must only be called by the single producer of this ring.
    pub(crate) fn write(&self, src: &[u8]) -> Result<usize, RingError> {
        let prod = load_index(self.prod, Ordering::Relaxed);
        // Acquire: the consumer's reads of the space it released happen
        // before we overwrite it.
        let cons = load_index(self.cons, Ordering::Acquire);
        let free = N - Self::used(prod, cons)?;

        let len = min(free, src.len());
        if len == 0 {
            return Ok(0);
        }

        let start = (prod & Self::MASK) as usize;
        let first = min(len, N - start);
        let base = self.data.as_ptr();

        // SAFETY:
        // - `start + first <= N` and `len - first <= start`, so both copies
        //   stay inside the N-byte data area.
        // - The destination lies in [prod, cons + N), which the consumer does
        //   not read until we publish the new producer index below.
        // - `src` is a local slice and cannot overlap the shared page.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), base, len - first);
        }

        // Release: the bytes above are visible before the consumer sees them.
        store_index(self.prod, prod.wrapping_add(len as u32), Ordering::Release);
        Ok(len)
    }

    /// Copy up to `dst.len()` readable bytes out and release the space.
    ///
    /// Must only be called by the single consumer of this ring.
    pub(crate) fn read(&self, dst: &mut [u8]) -> Result<usize, RingError> {
        let cons = load_index(self.cons, Ordering::Relaxed);
        // Acquire: the producer's byte writes are visible before we copy.
        let prod = load_index(self.prod, Ordering::Acquire);
        let used = Self::used(prod, cons)?;

        let len = min(used, dst.len());
        if len == 0 {
            return Ok(0);
        }

        let start = (cons & Self::MASK) as usize;
        let first = min(len, N - start);
        let base = self.data.as_ptr();

        // SAFETY:
        // - Both source ranges stay inside the N-byte data area (see write).
        // - The source lies in [cons, prod), published by the producer with
        //   Release and observed above with Acquire; the producer does not
        //   touch it until we publish the new consumer index.
        // - `dst` is a local slice and cannot overlap the shared page.
        unsafe {
            ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), len - first);
        }

        // Release: our reads complete before the producer reuses the space.
        store_index(self.cons, cons.wrapping_add(len as u32), Ordering::Release);
        Ok(len)
    }
}
