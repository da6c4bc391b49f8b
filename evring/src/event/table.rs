//! Per-context event table: the receiving side of every event channel.
//!
//! Each execution context owns one [`EventTable`] placed where its peers can
//! reach it (heap memory shared between threads, or a shared memory
//! mapping). Peers *raise* ports in it; the owner masks, unmasks and
//! consumes them, and sleeps on [`EventTable::wake_word`].
//!
//! Every flag lives in an atomic bitmap and every cross-party handshake uses
//! `SeqCst`, so that "set pending, then check mask" on one side and "clear
//! mask, then check pending" on the other cannot both miss.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::SharedMemorySafe;
use crate::event::EventError;
use crate::trace::trace;

/// Number of ports one table can hold.
pub const MAX_PORTS: usize = 256;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_PORTS / WORD_BITS;

/// Event channel identity within one table.
///
/// Ports are small integers agreed out of band; a port number only means
/// something relative to the table that bound it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Port(u32);

impl Port {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for Port {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<Port> for u32 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// Observable state of one channel in its owner's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Pending,
    Masked,
    MaskedPending,
}

impl ChannelState {
    const fn from_bits(pending: bool, masked: bool) -> Self {
        match (pending, masked) {
            (false, false) => Self::Idle,
            (true, false) => Self::Pending,
            (false, true) => Self::Masked,
            (true, true) => Self::MaskedPending,
        }
    }
}

/// What a raise did to the owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Delivery {
    /// The context's wake word went 0 -> 1; its host sleeper must be woken.
    Wake,
    /// Already signalled since the owner last looked; nothing more to do.
    Coalesced,
    /// The owner has delivery disabled and will re-scan before sleeping.
    Deferred,
    /// The port is masked; the event stays pending until unmasked.
    Suppressed,
    /// Nothing pending on the port.
    Nothing,
}

/// Pending, mask and binding state for up to [`MAX_PORTS`] ports, plus the
/// context-wide wake word and delivery mask.
#[derive(SharedMemorySafe)]
#[repr(C)]
pub struct EventTable {
    /// Host wake word: 1 once an event has been delivered since the owner
    /// last cleared it.
    upcall_pending: AtomicU32,
    /// Non-zero while the owner has delivery disabled.
    upcall_mask: AtomicU32,
    bound: [AtomicU64; WORDS],
    pending: [AtomicU64; WORDS],
    mask: [AtomicU64; WORDS],
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTable")
            .field("upcall_pending", &self.upcall_pending.load(Ordering::Relaxed))
            .field("upcall_mask", &self.upcall_mask.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[inline]
fn locate(port: Port) -> Result<(usize, u64), EventError> {
    let idx = port.0 as usize;
    if idx >= MAX_PORTS {
        return Err(EventError::OutOfRange(port));
    }
    Ok((idx / WORD_BITS, 1 << (idx % WORD_BITS)))
}

impl EventTable {
    /// Empty table: nothing bound, delivery enabled.
    pub const fn new() -> Self {
        Self {
            upcall_pending: AtomicU32::new(0),
            upcall_mask: AtomicU32::new(0),
            bound: [const { AtomicU64::new(0) }; WORDS],
            pending: [const { AtomicU64::new(0) }; WORDS],
            mask: [const { AtomicU64::new(0) }; WORDS],
        }
    }

    /// Position of a bound port.
    fn bound_bit(&self, port: Port) -> Result<(usize, u64), EventError> {
        let (word, bit) = locate(port)?;
        if self.bound[word].load(Ordering::SeqCst) & bit == 0 {
            return Err(EventError::Unbound(port));
        }
        Ok((word, bit))
    }

    /// Bind the lowest free port. It starts unmasked with nothing pending.
    ///
    /// # Errors
    ///
    /// [`EventError::Exhausted`] when all [`MAX_PORTS`] ports are bound.
    pub fn bind(&self) -> Result<Port, EventError> {
        for (word, bound) in self.bound.iter().enumerate() {
            let mut current = bound.load(Ordering::SeqCst);
            while current != u64::MAX {
                let offset = (!current).trailing_zeros() as usize;
                let bit = 1u64 << offset;
                match bound.compare_exchange(
                    current,
                    current | bit,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        self.reset(word, bit);
                        let port = Port((word * WORD_BITS + offset) as u32);
                        trace!(%port, "bound");
                        return Ok(port);
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        Err(EventError::Exhausted)
    }

    /// Bind a specific port number agreed out of band.
    ///
    /// # Errors
    ///
    /// [`EventError::OutOfRange`] or [`EventError::AlreadyBound`].
    pub fn bind_port(&self, port: Port) -> Result<(), EventError> {
        let (word, bit) = locate(port)?;
        if self.bound[word].fetch_or(bit, Ordering::SeqCst) & bit != 0 {
            return Err(EventError::AlreadyBound(port));
        }
        self.reset(word, bit);
        trace!(%port, "bound");
        Ok(())
    }

    fn reset(&self, word: usize, bit: u64) {
        self.mask[word].fetch_and(!bit, Ordering::SeqCst);
        self.pending[word].fetch_and(!bit, Ordering::SeqCst);
    }

    /// Unbind a port: mask it, drop anything pending, free the number.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] if the port is not bound here.
    pub fn close(&self, port: Port) -> Result<(), EventError> {
        let (word, bit) = self.bound_bit(port)?;
        self.mask[word].fetch_or(bit, Ordering::SeqCst);
        self.pending[word].fetch_and(!bit, Ordering::SeqCst);
        self.bound[word].fetch_and(!bit, Ordering::SeqCst);
        trace!(%port, "closed");
        Ok(())
    }

    /// Unbind every port.
    pub fn close_all(&self) {
        for word in 0..WORDS {
            self.mask[word].store(u64::MAX, Ordering::SeqCst);
            self.pending[word].store(0, Ordering::SeqCst);
            self.bound[word].store(0, Ordering::SeqCst);
        }
    }

    /// Mark `port` pending and report whether the owner must be woken.
    ///
    /// Repeated raises before the owner consumes the port coalesce into at
    /// most one [`Delivery::Wake`].
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] / [`EventError::OutOfRange`] if the port is
    /// not bound in this table.
    pub fn raise(&self, port: Port) -> Result<Delivery, EventError> {
        let (word, bit) = self.bound_bit(port)?;
        self.pending[word].fetch_or(bit, Ordering::SeqCst);
        Ok(self.deliver(word, bit))
    }

    /// Second half of a raise or unmask: the port is pending, decide whether
    /// the owner hears about it.
    fn deliver(&self, word: usize, bit: u64) -> Delivery {
        if self.mask[word].load(Ordering::SeqCst) & bit != 0 {
            return Delivery::Suppressed;
        }
        if self.upcall_mask.load(Ordering::SeqCst) != 0 {
            return Delivery::Deferred;
        }
        if self.upcall_pending.swap(1, Ordering::SeqCst) == 0 {
            Delivery::Wake
        } else {
            Delivery::Coalesced
        }
    }

    /// Suppress delivery for `port`. Raises still mark it pending.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] / [`EventError::OutOfRange`].
    pub fn mask(&self, port: Port) -> Result<(), EventError> {
        let (word, bit) = self.bound_bit(port)?;
        self.mask[word].fetch_or(bit, Ordering::SeqCst);
        Ok(())
    }

    /// Re-enable delivery for `port`. An event raised while masked is
    /// delivered now, exactly as if it had just been raised.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] / [`EventError::OutOfRange`].
    pub fn unmask(&self, port: Port) -> Result<Delivery, EventError> {
        let (word, bit) = self.bound_bit(port)?;
        self.mask[word].fetch_and(!bit, Ordering::SeqCst);
        if self.pending[word].load(Ordering::SeqCst) & bit == 0 {
            return Ok(Delivery::Nothing);
        }
        Ok(self.deliver(word, bit))
    }

    /// Clear the pending flag, returning whether it was set.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] / [`EventError::OutOfRange`].
    pub fn consume_pending(&self, port: Port) -> Result<bool, EventError> {
        let (word, bit) = self.bound_bit(port)?;
        Ok(self.pending[word].fetch_and(!bit, Ordering::SeqCst) & bit != 0)
    }

    /// # Errors
    ///
    /// [`EventError::Unbound`] / [`EventError::OutOfRange`].
    pub fn state(&self, port: Port) -> Result<ChannelState, EventError> {
        let (word, bit) = self.bound_bit(port)?;
        let pending = self.pending[word].load(Ordering::SeqCst) & bit != 0;
        let masked = self.mask[word].load(Ordering::SeqCst) & bit != 0;
        Ok(ChannelState::from_bits(pending, masked))
    }

    /// Whether `port` is bound in this table.
    pub fn is_bound(&self, port: Port) -> bool {
        self.bound_bit(port).is_ok()
    }

    /// Any bound, unmasked port with an event pending.
    pub fn has_deliverable(&self) -> bool {
        (0..WORDS).any(|word| {
            let bound = self.bound[word].load(Ordering::SeqCst);
            let pending = self.pending[word].load(Ordering::SeqCst);
            let mask = self.mask[word].load(Ordering::SeqCst);
            bound & pending & !mask != 0
        })
    }

    /// Word the owner's host sleeps on.
    #[inline]
    pub fn wake_word(&self) -> &AtomicU32 {
        &self.upcall_pending
    }

    /// Forget earlier deliveries before re-scanning pending ports.
    #[inline]
    pub(crate) fn clear_wake_word(&self) {
        self.upcall_pending.store(0, Ordering::SeqCst);
    }

    /// Whether the owner currently has delivery disabled.
    pub fn delivery_disabled(&self) -> bool {
        self.upcall_mask.load(Ordering::SeqCst) != 0
    }

    /// Disable delivery to this context until the guard drops.
    ///
    /// Raises made meanwhile only mark ports pending. Dropping the guard
    /// restores the previous setting on every exit path.
    pub fn disable_delivery(&self) -> DeliveryGuard<'_> {
        let previous = self.upcall_mask.swap(1, Ordering::SeqCst);
        DeliveryGuard {
            table: self,
            previous,
        }
    }
}

/// Restores the table's delivery mask when dropped.
#[must_use = "delivery is re-enabled as soon as the guard is dropped"]
pub struct DeliveryGuard<'a> {
    table: &'a EventTable,
    previous: u32,
}

impl DeliveryGuard<'_> {
    /// Re-enable delivery while still holding the guard: the sleep window of
    /// the blocking scheduler.
    pub(crate) fn open(&self) {
        self.table.upcall_mask.store(0, Ordering::SeqCst);
    }

    /// End the sleep window.
    pub(crate) fn close(&self) {
        self.table.upcall_mask.store(1, Ordering::SeqCst);
    }
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.table
            .upcall_mask
            .store(self.previous, Ordering::SeqCst);
        // Anything that arrived while disabled was deferred; note it so the
        // next sleep attempt returns at once.
        if self.previous == 0 && self.table.has_deliverable() {
            self.table.upcall_pending.store(1, Ordering::SeqCst);
        }
    }
}
