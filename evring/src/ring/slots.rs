//! Fixed-slot request/response rings with event-index notify suppression.
//!
//! A [`SlotRing`] holds `S` slots, each carrying either a request or the
//! response to it. The [`FrontRing`] produces requests and consumes
//! responses; the [`BackRing`] does the opposite, writing each response
//! into the slot of a request it has already consumed.
//!
//! ```text
//! offset  size  field      written by
//! 0       4     req_prod   front
//! 4       4     req_event  back
//! 8       4     rsp_prod   back
//! 12      4     rsp_event  front
//! 16      48    padding
//! 64      ...   S slots (union of request and response)
//! ```
//!
//! A consumer that has drained its side stores `event = cons + 1` and
//! re-checks (`final_check`). A producer publishing from `old` to `new`
//! notifies only if that range crossed the consumer's event index, so a
//! burst of pushes against a busy consumer rings the doorbell once.
//!
//! Private producer/consumer positions live in the endpoints; only the four
//! header words are shared.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::SharedMemorySafe;
use crate::event::{EventChannel, EventError, EventTable};
use crate::host::Host;
use crate::page::{load_index, store_index};
use crate::ring::{CapacityCheck, RingError};
use crate::trace::{trace, warn};

/// One slot: the request, later overwritten by its response.
#[repr(C)]
pub union Slot<Req: Copy + SharedMemorySafe, Rsp: Copy + SharedMemorySafe> {
    req: Req,
    rsp: Rsp,
}

#[repr(transparent)]
struct Slots<Req: Copy + SharedMemorySafe, Rsp: Copy + SharedMemorySafe, const S: usize>(
    UnsafeCell<[Slot<Req, Rsp>; S]>,
);

// SAFETY: a slot belongs to the front from `rsp_cons` up to `req_prod` and
// to the back from `req_cons` up to `rsp_prod`; ownership moves with
// Release/Acquire index updates.
unsafe impl<Req, Rsp, const S: usize> Sync for Slots<Req, Rsp, S>
where
    Req: Copy + SharedMemorySafe,
    Rsp: Copy + SharedMemorySafe,
{
}

/// The shared part of a request/response ring.
#[repr(C)]
pub struct SlotRing<Req: Copy + SharedMemorySafe, Rsp: Copy + SharedMemorySafe, const S: usize> {
    req_prod: AtomicU32,
    req_event: AtomicU32,
    rsp_prod: AtomicU32,
    rsp_event: AtomicU32,
    _pad: [u8; 48],
    slots: Slots<Req, Rsp, S>,
}

// SAFETY: fixed-width index words and plain-data slots; zero-filled it is a
// valid (if not yet initialised) ring.
unsafe impl<Req, Rsp, const S: usize> SharedMemorySafe for SlotRing<Req, Rsp, S>
where
    Req: Copy + SharedMemorySafe,
    Rsp: Copy + SharedMemorySafe,
{
}

impl<Req, Rsp, const S: usize> SlotRing<Req, Rsp, S>
where
    Req: Copy + SharedMemorySafe,
    Rsp: Copy + SharedMemorySafe,
{
    const MASK: u32 = (S - 1) as u32;

    /// Initialised, empty ring.
    pub const fn new() -> Self {
        Self {
            req_prod: AtomicU32::new(0),
            req_event: AtomicU32::new(1u32.to_le()),
            rsp_prod: AtomicU32::new(0),
            rsp_event: AtomicU32::new(1u32.to_le()),
            _pad: [0; 48],
            // SAFETY: SharedMemorySafe types are valid when zero-filled.
            slots: Slots(UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() })),
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        S
    }

    /// `SHARED_RING_INIT`: no requests or responses, both events armed.
    fn reset(&self) {
        store_index(&self.req_prod, 0, Ordering::Relaxed);
        store_index(&self.rsp_prod, 0, Ordering::Relaxed);
        store_index(&self.req_event, 1, Ordering::Relaxed);
        store_index(&self.rsp_event, 1, Ordering::Release);
    }

    #[inline]
    fn slot(&self, index: u32) -> *mut Slot<Req, Rsp> {
        let base = self.slots.0.get().cast::<Slot<Req, Rsp>>();
        // SAFETY: masked into 0..S.
        unsafe { base.add((index & Self::MASK) as usize) }
    }

    /// Publish `new` as `prod` and report whether the consumer's event index
    /// lies in `(old, new]`.
    fn publish(prod: &AtomicU32, event: &AtomicU32, new: u32) -> bool {
        let old = load_index(prod, Ordering::Relaxed);
        store_index(prod, new, Ordering::Release);
        // The event load must not pass the index store, or a consumer
        // re-arming in between would be missed.
        fence(Ordering::SeqCst);
        let event = load_index(event, Ordering::Relaxed);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }

    /// Arm `event` at `cons + 1`, then look at `prod` again.
    fn rearm(prod: &AtomicU32, event: &AtomicU32, cons: u32) -> u32 {
        store_index(event, cons.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::SeqCst);
        load_index(prod, Ordering::Acquire)
    }

    /// Relaxed `(req_prod, req_event, rsp_prod, rsp_event)`, for diagnostics.
    pub fn header(&self) -> (u32, u32, u32, u32) {
        (
            load_index(&self.req_prod, Ordering::Relaxed),
            load_index(&self.req_event, Ordering::Relaxed),
            load_index(&self.rsp_prod, Ordering::Relaxed),
            load_index(&self.rsp_event, Ordering::Relaxed),
        )
    }
}

impl<Req, Rsp, const S: usize> Default for SlotRing<Req, Rsp, S>
where
    Req: Copy + SharedMemorySafe,
    Rsp: Copy + SharedMemorySafe,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Rsp, const S: usize> fmt::Debug for SlotRing<Req, Rsp, S>
where
    Req: Copy + SharedMemorySafe,
    Rsp: Copy + SharedMemorySafe,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (req_prod, req_event, rsp_prod, rsp_event) = self.header();
        f.debug_struct("SlotRing")
            .field("slots", &S)
            .field("req_prod", &req_prod)
            .field("req_event", &req_event)
            .field("rsp_prod", &rsp_prod)
            .field("rsp_event", &rsp_event)
            .finish()
    }
}

fn violation(producer: u32, consumer: u32, capacity: usize) -> RingError {
    let err = RingError::ProtocolViolation {
        producer,
        consumer,
        capacity,
    };
    warn!(%err, "slot ring rejected");
    err
}

/// Request producer and response consumer.
///
/// `Send` but not `Sync`.
pub struct FrontRing<R, Req, Rsp, const S: usize> {
    ring: R,
    req_prod_pvt: Cell<u32>,
    rsp_cons: Cell<u32>,
    _slots: PhantomData<fn() -> (Req, Rsp)>,
}

impl<R, Req, Rsp, const S: usize> FrontRing<R, Req, Rsp, S>
where
    R: Deref<Target = SlotRing<Req, Rsp, S>>,
    Req: Copy + SharedMemorySafe,
    Rsp: Copy + SharedMemorySafe,
{
    /// Initialise `ring` and take its front end. The front sets the ring up
    /// before the back attaches, so a zero-filled mapping is fine here.
    pub fn new(ring: R) -> Self {
        let () = CapacityCheck::<S>::OK;
        ring.reset();
        Self {
            ring,
            req_prod_pvt: Cell::new(0),
            rsp_cons: Cell::new(0),
            _slots: PhantomData,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        S
    }

    /// Slots free for new requests.
    pub fn free_requests(&self) -> usize {
        S - self.req_prod_pvt.get().wrapping_sub(self.rsp_cons.get()) as usize
    }

    /// Queue a request. It stays invisible to the back until
    /// [`publish`](Self::publish). Returns the request when every slot is
    /// in use.
    pub fn push(&self, req: Req) -> Result<(), Req> {
        if self.free_requests() == 0 {
            return Err(req);
        }
        let prod = self.req_prod_pvt.get();
        // SAFETY: the slot is past every response we consumed and not yet
        // published, so the back does not touch it.
        unsafe { (&raw mut (*self.ring.slot(prod)).req).write(req) };
        self.req_prod_pvt.set(prod.wrapping_add(1));
        Ok(())
    }

    /// Make queued requests visible. `true` if the back asked to be
    /// notified about any of them.
    pub fn publish(&self) -> bool {
        let ring = &*self.ring;
        let prod = self.req_prod_pvt.get();
        SlotRing::<Req, Rsp, S>::publish(&ring.req_prod, &ring.req_event, prod)
    }

    /// [`publish`](Self::publish), then ring `doorbell` if the back asked.
    ///
    /// # Errors
    ///
    /// Whatever [`EventChannel::notify`] reports.
    pub fn publish_and_notify<T, H>(
        &self,
        doorbell: &EventChannel<T, H>,
    ) -> Result<bool, EventError>
    where
        T: Deref<Target = EventTable>,
        H: Host,
    {
        let notify = self.publish();
        if notify {
            doorbell.notify()?;
        } else {
            trace!(req_prod = self.req_prod_pvt.get(), "request notify suppressed");
        }
        Ok(notify)
    }

    /// Responses ready to take.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the back published more responses
    /// than there are requests outstanding.
    pub fn unconsumed_responses(&self) -> Result<usize, RingError> {
        let prod = load_index(&self.ring.rsp_prod, Ordering::Acquire);
        self.responses_until(prod)
    }

    fn responses_until(&self, prod: u32) -> Result<usize, RingError> {
        let cons = self.rsp_cons.get();
        let ready = prod.wrapping_sub(cons);
        if ready > self.req_prod_pvt.get().wrapping_sub(cons) {
            return Err(violation(prod, cons, S));
        }
        Ok(ready as usize)
    }

    /// Take the oldest response, freeing its slot for a new request.
    ///
    /// # Errors
    ///
    /// See [`unconsumed_responses`](Self::unconsumed_responses).
    pub fn pop(&self) -> Result<Option<Rsp>, RingError> {
        if self.unconsumed_responses()? == 0 {
            return Ok(None);
        }
        let cons = self.rsp_cons.get();
        // SAFETY: published by the back (Acquire above) and not yet consumed.
        let rsp = unsafe { (&raw const (*self.ring.slot(cons)).rsp).read() };
        self.rsp_cons.set(cons.wrapping_add(1));
        Ok(Some(rsp))
    }

    /// Re-arm the response event after draining, then re-check. `true`
    /// means responses arrived in the meantime and must be taken before
    /// sleeping; `false` means the next response will notify.
    ///
    /// # Errors
    ///
    /// See [`unconsumed_responses`](Self::unconsumed_responses).
    pub fn final_check(&self) -> Result<bool, RingError> {
        if self.unconsumed_responses()? > 0 {
            return Ok(true);
        }
        let ring = &*self.ring;
        let prod =
            SlotRing::<Req, Rsp, S>::rearm(&ring.rsp_prod, &ring.rsp_event, self.rsp_cons.get());
        Ok(self.responses_until(prod)? > 0)
    }

    #[inline]
    pub fn ring(&self) -> &SlotRing<Req, Rsp, S> {
        &self.ring
    }
}

/// Request consumer and response producer.
///
/// `Send` but not `Sync`.
pub struct BackRing<R, Req, Rsp, const S: usize> {
    ring: R,
    req_cons: Cell<u32>,
    rsp_prod_pvt: Cell<u32>,
    _slots: PhantomData<fn() -> (Req, Rsp)>,
}

impl<R, Req, Rsp, const S: usize> BackRing<R, Req, Rsp, S>
where
    R: Deref<Target = SlotRing<Req, Rsp, S>>,
    Req: Copy + SharedMemorySafe,
    Rsp: Copy + SharedMemorySafe,
{
    /// Attach to a ring the front has initialised.
    pub fn new(ring: R) -> Self {
        let () = CapacityCheck::<S>::OK;
        Self {
            ring,
            req_cons: Cell::new(0),
            rsp_prod_pvt: Cell::new(0),
            _slots: PhantomData,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        S
    }

    /// Requests ready to take.
    ///
    /// # Errors
    ///
    /// [`RingError::ProtocolViolation`] if the front published more
    /// requests than there are slots.
    pub fn unconsumed_requests(&self) -> Result<usize, RingError> {
        let prod = load_index(&self.ring.req_prod, Ordering::Acquire);
        self.requests_until(prod)
    }

    fn requests_until(&self, prod: u32) -> Result<usize, RingError> {
        let cons = self.req_cons.get();
        // Every request not yet answered holds a slot, and `prod` never
        // moves back past what we consumed.
        let held = prod.wrapping_sub(self.rsp_prod_pvt.get());
        let ready = prod.wrapping_sub(cons);
        if held as usize > S || ready > held {
            return Err(violation(prod, cons, S));
        }
        Ok(ready as usize)
    }

    /// Take the oldest request. Its slot is reused for the response.
    ///
    /// # Errors
    ///
    /// See [`unconsumed_requests`](Self::unconsumed_requests).
    pub fn pop(&self) -> Result<Option<Req>, RingError> {
        if self.unconsumed_requests()? == 0 {
            return Ok(None);
        }
        let cons = self.req_cons.get();
        // SAFETY: published by the front (Acquire above), and the front
        // does not reuse the slot until our response for it is consumed.
        let req = unsafe { (&raw const (*self.ring.slot(cons)).req).read() };
        self.req_cons.set(cons.wrapping_add(1));
        Ok(Some(req))
    }

    /// Requests taken but not yet answered.
    pub fn unanswered(&self) -> usize {
        self.req_cons.get().wrapping_sub(self.rsp_prod_pvt.get()) as usize
    }

    /// Queue a response for the oldest unanswered request. It stays
    /// invisible to the front until [`publish`](Self::publish). Returns the
    /// response when no request is waiting for one.
    pub fn push(&self, rsp: Rsp) -> Result<(), Rsp> {
        if self.unanswered() == 0 {
            return Err(rsp);
        }
        let prod = self.rsp_prod_pvt.get();
        // SAFETY: the slot held a request we already consumed, and the front
        // does not reuse it before this response is published and consumed.
        unsafe { (&raw mut (*self.ring.slot(prod)).rsp).write(rsp) };
        self.rsp_prod_pvt.set(prod.wrapping_add(1));
        Ok(())
    }

    /// Make queued responses visible. `true` if the front asked to be
    /// notified about any of them.
    pub fn publish(&self) -> bool {
        let ring = &*self.ring;
        let prod = self.rsp_prod_pvt.get();
        SlotRing::<Req, Rsp, S>::publish(&ring.rsp_prod, &ring.rsp_event, prod)
    }

    /// [`publish`](Self::publish), then ring `doorbell` if the front asked.
    ///
    /// # Errors
    ///
    /// Whatever [`EventChannel::notify`] reports.
    pub fn publish_and_notify<T, H>(
        &self,
        doorbell: &EventChannel<T, H>,
    ) -> Result<bool, EventError>
    where
        T: Deref<Target = EventTable>,
        H: Host,
    {
        let notify = self.publish();
        if notify {
            doorbell.notify()?;
        } else {
            trace!(rsp_prod = self.rsp_prod_pvt.get(), "response notify suppressed");
        }
        Ok(notify)
    }

    /// Re-arm the request event after draining, then re-check. `true`
    /// means requests arrived in the meantime.
    ///
    /// # Errors
    ///
    /// See [`unconsumed_requests`](Self::unconsumed_requests).
    pub fn final_check(&self) -> Result<bool, RingError> {
        if self.unconsumed_requests()? > 0 {
            return Ok(true);
        }
        let ring = &*self.ring;
        let prod =
            SlotRing::<Req, Rsp, S>::rearm(&ring.req_prod, &ring.req_event, self.req_cons.get());
        Ok(self.requests_until(prod)? > 0)
    }

    #[inline]
    pub fn ring(&self) -> &SlotRing<Req, Rsp, S> {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventChannel;
    use crate::host::FutexHost;
    use crate::host::testing::CountingHost;
    use crate::sched::{Deadline, Scheduler};
    use std::mem::{offset_of, size_of};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    type Ring = SlotRing<u64, u32, 8>;
    type Front = FrontRing<Arc<Ring>, u64, u32, 8>;
    type Back = BackRing<Arc<Ring>, u64, u32, 8>;

    fn ends() -> (Front, Back) {
        let ring = Arc::new(Ring::new());
        (FrontRing::new(Arc::clone(&ring)), BackRing::new(ring))
    }

    #[test]
    fn header_layout() {
        assert_eq!(offset_of!(Ring, req_prod), 0);
        assert_eq!(offset_of!(Ring, req_event), 4);
        assert_eq!(offset_of!(Ring, rsp_prod), 8);
        assert_eq!(offset_of!(Ring, rsp_event), 12);
        assert_eq!(offset_of!(Ring, slots), 64);
        assert_eq!(size_of::<Ring>(), 64 + 8 * 8);
    }

    #[test]
    fn front_initialises_a_zeroed_ring() {
        let ring = Arc::new(Ring::new());
        store_index(&ring.req_event, 0, Ordering::Relaxed);
        store_index(&ring.rsp_event, 0, Ordering::Relaxed);
        let _front: Front = FrontRing::new(Arc::clone(&ring));
        assert_eq!(ring.header(), (0, 1, 0, 1));
    }

    #[test]
    fn requests_and_responses_share_slots() {
        let (front, back) = ends();
        for id in 0..8 {
            front.push(id).unwrap();
        }
        assert_eq!(front.push(99), Err(99));
        front.publish();

        assert_eq!(back.unconsumed_requests().unwrap(), 8);
        assert_eq!(back.push(0), Err(0), "nothing to answer yet");
        for id in 0..3 {
            assert_eq!(back.pop().unwrap(), Some(id));
            back.push(id as u32 * 10).unwrap();
        }
        back.publish();

        assert_eq!(front.unconsumed_responses().unwrap(), 3);
        assert_eq!(front.pop().unwrap(), Some(0));
        assert_eq!(front.pop().unwrap(), Some(10));
        assert_eq!(front.pop().unwrap(), Some(20));
        assert_eq!(front.pop().unwrap(), None);
        assert_eq!(front.free_requests(), 3);
    }

    #[test]
    fn pushes_without_rearm_notify_once() {
        let (front, back) = ends();
        front.push(1).unwrap();
        assert!(front.publish());
        front.push(2).unwrap();
        assert!(!front.publish());
        front.push(3).unwrap();
        assert!(!front.publish());

        while back.pop().unwrap().is_some() {}
        assert!(!back.final_check().unwrap());
        front.push(4).unwrap();
        assert!(front.publish(), "re-armed consumer is notified");
    }

    #[test]
    fn final_check_catches_a_publish_after_draining() {
        let (front, back) = ends();
        front.push(1).unwrap();
        assert!(front.publish());
        assert_eq!(back.pop().unwrap(), Some(1));

        // Lands after the drain but before the back re-armed: suppressed.
        front.push(2).unwrap();
        assert!(!front.publish());
        assert!(back.final_check().unwrap());
        assert_eq!(back.pop().unwrap(), Some(2));
        assert!(!back.final_check().unwrap());
    }

    #[test]
    fn responses_are_suppressed_the_same_way() {
        let (front, back) = ends();
        for id in 0..4 {
            front.push(id).unwrap();
        }
        front.publish();
        for _ in 0..4 {
            let id = back.pop().unwrap().unwrap();
            back.push(id as u32).unwrap();
        }
        assert!(back.publish());
        assert_eq!(front.pop().unwrap(), Some(0));
        assert!(front.final_check().unwrap(), "three responses still waiting");
        while front.pop().unwrap().is_some() {}
        assert!(!front.final_check().unwrap());
        assert_eq!(front.ring().header().3, 5);

        front.push(4).unwrap();
        front.publish();
        assert_eq!(back.pop().unwrap(), Some(4));
        back.push(4).unwrap();
        assert!(back.publish(), "front re-armed at the fifth response");
        assert_eq!(front.pop().unwrap(), Some(4));
    }

    #[test]
    fn publish_and_notify_rings_the_doorbell_once() {
        let host = Arc::new(CountingHost::default());
        let front_table = Arc::new(EventTable::new());
        let back_table = Arc::new(EventTable::new());
        let (front_ch, back_ch) =
            EventChannel::pair(front_table, Arc::clone(&back_table), Arc::clone(&host)).unwrap();
        let (front, back) = ends();

        let mut notified = 0;
        for id in 0..5 {
            front.push(id).unwrap();
            notified += usize::from(front.publish_and_notify(&front_ch).unwrap());
        }
        assert_eq!(notified, 1);
        assert!(back_ch.consume_pending().unwrap());
        assert_eq!(back.unconsumed_requests().unwrap(), 5);
    }

    #[test]
    fn overfull_request_index_is_a_violation() {
        let (front, back) = ends();
        store_index(&front.ring().req_prod, 9, Ordering::Release);
        let err = back.pop().unwrap_err();
        assert_eq!(
            err,
            RingError::ProtocolViolation {
                producer: 9,
                consumer: 0,
                capacity: 8
            }
        );
    }

    #[test]
    fn request_index_moving_back_is_a_violation() {
        let (front, back) = ends();
        for id in 0..3 {
            front.push(id).unwrap();
        }
        front.publish();
        assert_eq!(back.pop().unwrap(), Some(0));
        assert_eq!(back.pop().unwrap(), Some(1));
        back.push(0).unwrap();
        store_index(&front.ring().req_prod, 1, Ordering::Release);
        assert!(back.unconsumed_requests().is_err());
    }

    #[test]
    fn unrequested_response_is_a_violation() {
        let (front, back) = ends();
        front.push(1).unwrap();
        front.publish();
        store_index(&back.ring().rsp_prod, 2, Ordering::Release);
        assert!(matches!(
            front.pop(),
            Err(RingError::ProtocolViolation { producer: 2, .. })
        ));
    }

    #[test]
    fn cross_thread_request_response() {
        const TOTAL: u64 = 2_000;
        let front_table = Arc::new(EventTable::new());
        let back_table = Arc::new(EventTable::new());
        let (front_ch, back_ch) =
            EventChannel::pair(Arc::clone(&front_table), Arc::clone(&back_table), FutexHost)
                .unwrap();
        let ring = Arc::new(Ring::new());
        let front: Front = FrontRing::new(Arc::clone(&ring));
        let back: Back = BackRing::new(ring);
        let deadline = || Deadline::after(Duration::from_secs(10));

        let server = thread::spawn(move || {
            let sched = Scheduler::new(back_table, FutexHost);
            let mut answered = 0;
            while answered < TOTAL {
                while let Some(id) = back.pop().unwrap() {
                    back.push(id as u32 * 2).unwrap();
                    answered += 1;
                }
                back.publish_and_notify(&back_ch).unwrap();
                back_ch.consume_pending().unwrap();
                if answered < TOTAL && !back.final_check().unwrap() {
                    sched.block_until(deadline()).unwrap();
                }
            }
        });

        let sched = Scheduler::new(front_table, FutexHost);
        let (mut sent, mut got) = (0u64, 0u64);
        while got < TOTAL {
            while sent < TOTAL && front.push(sent).is_ok() {
                sent += 1;
            }
            front.publish_and_notify(&front_ch).unwrap();
            while let Some(rsp) = front.pop().unwrap() {
                assert_eq!(u64::from(rsp), got * 2);
                got += 1;
            }
            front_ch.consume_pending().unwrap();
            let room = sent < TOTAL && front.free_requests() > 0;
            if got < TOTAL && !room && !front.final_check().unwrap() {
                sched.block_until(deadline()).unwrap();
            }
        }
        server.join().unwrap();
    }
}
