//! Generational slab allocator for intrusive timer nodes.

use core::marker::PhantomData;
use core::num::NonZeroUsize;

/// Newtype for slab indices to prevent cross-slab misuse.
// Manual Copy/Clone: derive would require T: Copy, but PhantomData is just a marker.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SlabIndex<T>(u32, PhantomData<T>);

impl<T> Copy for SlabIndex<T> {}

impl<T> Clone for SlabIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> SlabIndex<T> {
    #[inline]
    const fn new(idx: u32) -> Self {
        Self(idx, PhantomData)
    }

    #[inline]
    const fn get(self) -> usize {
        self.0 as usize
    }
}

/// Timer node stored in the slab.
pub struct Node<T> {
    /// Timer payload; always `Some` while linked, taken when fired.
    pub payload: Option<T>,
    /// Generation counter for ABA protection.
    pub generation: u32,
    /// Next node in the per-slot timer list.
    pub next: Option<SlabIndex<T>>,
    /// Previous node in the per-slot timer list (`None` for the head).
    pub prev: Option<SlabIndex<T>>,
    /// Absolute deadline in wheel ticks.
    pub deadline: u64,
}

enum Entry<T> {
    Occupied(Node<T>),
    Free {
        next: Option<SlabIndex<T>>,
        generation: u32,
    },
}

/// Fixed-capacity slab with intrusive free list.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlabIndex<T>>,
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with given capacity, all slots free.
    ///
    /// Capacity is clamped to `u32::MAX` entries.
    #[must_use]
    pub fn with_capacity(cap: NonZeroUsize) -> Self {
        let capacity = cap.get().min(u32::MAX as usize);
        let entries = (1..=capacity)
            .map(|next| Entry::Free {
                next: (next < capacity).then(|| SlabIndex::new(next as u32)),
                generation: 0,
            })
            .collect();
        Self {
            entries,
            free_head: Some(SlabIndex::new(0)),
            len: 0,
        }
    }

    /// Allocates a new node, returning its index and mutable ref.
    pub fn alloc(&mut self, payload: T, deadline: u64) -> Option<(SlabIndex<T>, &mut Node<T>)> {
        let head = self.free_head?;
        let entry = &mut self.entries[head.get()];
        let Entry::Free { next, generation } = *entry else {
            unreachable!("free_head must point to a free slot");
        };
        self.free_head = next;
        self.len += 1;

        *entry = Entry::Occupied(Node {
            payload: Some(payload),
            generation,
            next: None,
            prev: None,
            deadline,
        });
        match entry {
            Entry::Occupied(node) => Some((head, node)),
            Entry::Free { .. } => None,
        }
    }

    /// Frees a node by index; returns its generation for handle invalidation.
    pub fn free(&mut self, idx: SlabIndex<T>) -> Option<u32> {
        let entry = &mut self.entries[idx.get()];
        let Entry::Occupied(node) = entry else {
            return None;
        };
        let generation = node.generation;
        *entry = Entry::Free {
            next: self.free_head,
            generation: generation.wrapping_add(1),
        };
        self.free_head = Some(idx);
        self.len -= 1;
        Some(generation)
    }

    /// Gets immutable ref to node by index if occupied.
    #[must_use]
    pub fn get(&self, idx: SlabIndex<T>) -> Option<&Node<T>> {
        match &self.entries[idx.get()] {
            Entry::Occupied(n) => Some(n),
            Entry::Free { .. } => None,
        }
    }

    /// Gets mutable ref to node by index if occupied.
    pub fn get_mut(&mut self, idx: SlabIndex<T>) -> Option<&mut Node<T>> {
        match &mut self.entries[idx.get()] {
            Entry::Occupied(n) => Some(n),
            Entry::Free { .. } => None,
        }
    }

    /// Occupied nodes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Earliest deadline among occupied nodes.
    pub fn min_deadline(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Entry::Occupied(node) => Some(node.deadline),
                Entry::Free { .. } => None,
            })
            .min()
    }
}
