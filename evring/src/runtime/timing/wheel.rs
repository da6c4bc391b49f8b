//! Hashed timing wheel with O(1) schedule/cancel and bounded per-tick work.
//!
//! Single-level, power-of-two slots; owned by one run loop. Tick streams
//! fired timers via callback, in deadline order, through a buffer sized
//! once for the wheel's capacity.

use core::num::NonZeroUsize;

use crate::runtime::timing::slab::{Slab, SlabIndex};
use crate::runtime::timing::time::{Duration, Ticks, Timestamp};

/// Handle returned to callers; includes index and generation to detect stale use.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle<T> {
    idx: SlabIndex<T>,
    generation: u32,
}

impl<T> Copy for TimerHandle<T> {}

impl<T> Clone for TimerHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

/// Witness type for power-of-two values.
#[derive(Clone, Copy, Debug)]
pub struct PowerOfTwo(usize);

impl PowerOfTwo {
    pub const fn new(val: usize) -> Option<Self> {
        if val.is_power_of_two() {
            Some(Self(val))
        } else {
            None
        }
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

/// Wheel configuration (immutable after creation).
pub struct WheelConfig {
    pub slots: PowerOfTwo,
    pub capacity: NonZeroUsize,
}

/// Hashed timing wheel.
pub struct Wheel<T> {
    slots: Vec<Option<SlabIndex<T>>>, // head of list per slot
    slab: Slab<T>,
    mask: usize,
    cursor: u64, // last tick processed
    due: Vec<(u64, TimerHandle<T>, T)>,
}

impl<T> Wheel<T> {
    /// Create a new wheel.
    pub fn new(cfg: WheelConfig) -> Self {
        let slots = cfg.slots.get();
        Self {
            slots: vec![None; slots],
            slab: Slab::with_capacity(cfg.capacity),
            mask: slots - 1,
            cursor: 0,
            due: Vec::with_capacity(cfg.capacity.get()),
        }
    }

    /// Last tick processed by [`tick`](Self::tick).
    #[inline]
    pub const fn cursor(&self) -> Timestamp<Ticks> {
        Timestamp::new(self.cursor)
    }

    /// Pending timers.
    #[inline]
    pub const fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Schedule `payload` to fire `delay` ticks after the next tick, so a
    /// zero delay fires on the next tick. `None` when the wheel is full.
    pub fn schedule(&mut self, delay: Duration<Ticks>, payload: T) -> Option<TimerHandle<T>> {
        let deadline = self.cursor.saturating_add(1).saturating_add(delay.as_u64());
        let slot = (deadline as usize) & self.mask;
        let head = self.slots[slot];
        let (idx, generation) = {
            let (idx, node) = self.slab.alloc(payload, deadline)?;
            node.next = head;
            (idx, node.generation)
        };
        if let Some(head_idx) = head
            && let Some(head) = self.slab.get_mut(head_idx)
        {
            head.prev = Some(idx);
        }
        self.slots[slot] = Some(idx);
        Some(TimerHandle { idx, generation })
    }

    /// Cancel a timer by handle. `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle<T>) -> bool {
        let Some(node) = self.slab.get(handle.idx) else {
            return false;
        };
        if node.generation != handle.generation {
            return false;
        }
        let (next, prev, deadline) = (node.next, node.prev, node.deadline);

        match prev {
            Some(p) => {
                if let Some(pnode) = self.slab.get_mut(p) {
                    pnode.next = next;
                }
            }
            None => self.slots[(deadline as usize) & self.mask] = next,
        }
        if let Some(n) = next
            && let Some(nnode) = self.slab.get_mut(n)
        {
            nnode.prev = prev;
        }

        self.slab.free(handle.idx).is_some()
    }

    /// Earliest pending deadline, in ticks.
    pub fn next_deadline(&self) -> Option<Timestamp<Ticks>> {
        self.slab.min_deadline().map(Timestamp::new)
    }

    /// Advance the wheel to `now` and invoke `on_fire` for each due timer,
    /// earliest deadline first.
    ///
    /// No allocations occur during tick.
    pub fn tick(&mut self, now: Timestamp<Ticks>, mut on_fire: impl FnMut(TimerHandle<T>, T)) {
        let now_tick = now.as_u64();
        if now_tick <= self.cursor {
            return;
        }
        // Past one full rotation every slot has been visited; skip the rest.
        // Slots are then no longer walked in deadline order.
        let first = self
            .cursor
            .saturating_add(1)
            .max(now_tick.saturating_sub(self.mask as u64));
        let jumped = first > self.cursor.saturating_add(1);
        for tick in first..=now_tick {
            let slot = (tick as usize) & self.mask;
            let mut head = self.slots[slot];
            let mut pending_head: Option<SlabIndex<T>> = None;
            while let Some(idx) = head {
                let Some(node) = self.slab.get_mut(idx) else {
                    break;
                };
                head = node.next;

                if node.deadline <= now_tick {
                    let (deadline, generation) = (node.deadline, node.generation);
                    if let Some(payload) = node.payload.take() {
                        self.due
                            .push((deadline, TimerHandle { idx, generation }, payload));
                    }
                    self.slab.free(idx);
                } else {
                    // Not due this rotation; relink onto the kept list.
                    node.next = pending_head;
                    node.prev = None;
                    if let Some(ph) = pending_head
                        && let Some(pnode) = self.slab.get_mut(ph)
                    {
                        pnode.prev = Some(idx);
                    }
                    pending_head = Some(idx);
                }
            }
            self.slots[slot] = pending_head;
        }
        self.cursor = now_tick;

        if jumped {
            self.due.sort_unstable_by_key(|&(deadline, ..)| deadline);
        }
        for (_, handle, payload) in self.due.drain(..) {
            on_fire(handle, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel_u32(capacity: usize) -> Wheel<u32> {
        Wheel::new(WheelConfig {
            slots: PowerOfTwo::new(8).unwrap(),
            capacity: NonZeroUsize::new(capacity).unwrap(),
        })
    }

    fn ticks(n: u64) -> Duration<Ticks> {
        Duration::new(n)
    }

    fn at(n: u64) -> Timestamp<Ticks> {
        Timestamp::new(n)
    }

    #[test]
    fn fires_due_timers() {
        let mut w = wheel_u32(4);
        let h1 = w.schedule(ticks(0), 10).unwrap();
        let h2 = w.schedule(ticks(1), 20).unwrap();
        let mut fired = Vec::new();
        w.tick(at(1), |h, v| fired.push((h, v)));
        assert_eq!(fired, vec![(h1, 10)]);

        fired.clear();
        w.tick(at(3), |h, v| fired.push((h, v)));
        assert_eq!(fired, vec![(h2, 20)]);
        assert!(w.is_empty());
    }

    #[test]
    fn cancel_prevents_fire() {
        let mut w = wheel_u32(2);
        let h = w.schedule(ticks(0), 42).unwrap();
        assert!(w.cancel(h));
        assert!(!w.cancel(h));
        let mut fired = Vec::new();
        w.tick(at(1), |_, v| fired.push(v));
        assert!(fired.is_empty());
    }

    #[test]
    fn cancel_middle_of_slot_list() {
        let mut w = wheel_u32(4);
        let a = w.schedule(ticks(0), 1).unwrap();
        let b = w.schedule(ticks(0), 2).unwrap();
        let c = w.schedule(ticks(0), 3).unwrap();
        assert!(w.cancel(b));
        let mut fired = Vec::new();
        w.tick(at(1), |h, v| fired.push((h, v)));
        fired.sort_by_key(|(_, v)| *v);
        assert_eq!(fired, vec![(a, 1), (c, 3)]);
    }

    #[test]
    fn stale_handle_rejected() {
        let mut w = wheel_u32(1);
        let h1 = w.schedule(ticks(0), 1).unwrap();
        w.tick(at(1), |_, _| {});
        let h2 = w.schedule(ticks(0), 2).unwrap();
        assert_ne!(h1, h2);
        assert!(!w.cancel(h1));
        assert!(w.cancel(h2));
    }

    #[test]
    fn capacity_exhaustion() {
        let mut w = wheel_u32(1);
        let _ = w.schedule(ticks(0), 1).unwrap();
        assert!(
            w.schedule(ticks(0), 2).is_none(),
            "should fail when slab is full"
        );
    }

    #[test]
    fn pending_kept_until_due() {
        let mut w = wheel_u32(2);
        let h = w.schedule(ticks(2), 99).unwrap();
        let mut fired = Vec::new();
        w.tick(at(2), |handle, v| fired.push((handle, v)));
        assert!(fired.is_empty(), "not due yet");
        w.tick(at(3), |handle, v| fired.push((handle, v)));
        assert_eq!(fired, vec![(h, 99)]);
    }

    #[test]
    fn timers_beyond_one_rotation_wait_their_turn() {
        let mut w = wheel_u32(2);
        let h = w.schedule(ticks(10), 7).unwrap();
        assert_eq!(w.next_deadline(), Some(at(11)));
        let mut fired = Vec::new();
        w.tick(at(3), |_, v| fired.push(v));
        w.tick(at(10), |_, v| fired.push(v));
        assert!(fired.is_empty());
        w.tick(at(11), |handle, v| {
            assert_eq!(handle, h);
            fired.push(v);
        });
        assert_eq!(fired, vec![7]);
    }

    #[test]
    fn jump_ahead_fires_everything_due() {
        let mut w = wheel_u32(3);
        let h1 = w.schedule(ticks(0), 1).unwrap();
        let h2 = w.schedule(ticks(2), 3).unwrap();
        let h3 = w.schedule(ticks(40), 5).unwrap();
        let mut seen = Vec::new();
        w.tick(at(100), |h, v| seen.push((h, v)));
        seen.sort_by_key(|(_, v)| *v);
        assert_eq!(seen, vec![(h1, 1), (h2, 3), (h3, 5)]);
        assert_eq!(w.cursor(), at(100));
    }

    #[test]
    fn jump_ahead_fires_in_deadline_order() {
        let mut w = wheel_u32(4);
        // Deadlines 4, 10 and 13 land in slots 4, 2 and 5 of 8; a stall to
        // tick 100 walks the slots starting from 5.
        let h10 = w.schedule(ticks(9), 10).unwrap();
        let h13 = w.schedule(ticks(12), 13).unwrap();
        let h4 = w.schedule(ticks(3), 4).unwrap();
        let mut seen = Vec::new();
        w.tick(at(100), |h, v| seen.push((h, v)));
        assert_eq!(seen, vec![(h4, 4), (h10, 10), (h13, 13)]);
        assert!(w.is_empty());
    }

    #[test]
    fn next_deadline_tracks_earliest() {
        let mut w = wheel_u32(4);
        assert_eq!(w.next_deadline(), None);
        let late = w.schedule(ticks(9), 1).unwrap();
        let early = w.schedule(ticks(2), 2).unwrap();
        assert_eq!(w.next_deadline(), Some(at(3)));
        assert!(w.cancel(early));
        assert_eq!(w.next_deadline(), Some(at(10)));
        assert!(w.cancel(late));
        assert_eq!(w.next_deadline(), None);
    }
}
