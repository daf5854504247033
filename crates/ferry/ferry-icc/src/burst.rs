//! Bounded FIFO ring of `Copy` entries over a named shared segment.
//!
//! The ring never overwrites: a producer can only claim slots that every
//! consumer has finished with, so a full ring admits nothing and an empty ring
//! yields nothing. Both cases are reported as a short count, never as an
//! error, and no call ever blocks.
//!
//! # Algorithm
//!
//! Each side owns a `head`/`tail` pair of free-running 64-bit counters.
//!
//! ```text
//!   cons.tail   cons.head          prod.tail   prod.head
//!       |  being   |    published      |  being   |
//!       |  read    |    entries        | written  |
//! ──────┴──────────┴───────────────────┴──────────┴──────
//! ```
//!
//! 1. Reserve: move `head` forward by the batch size, bounded by what the
//!    other side's `tail` allows. One CAS per batch in `Multi` mode, a plain
//!    store in `Single` mode.
//! 2. Copy the batch in (or out).
//! 3. Publish: wait until earlier reservations on this side have published
//!    (`tail == old head`), then store the new `tail` with `Release`.
//!
//! A consumer therefore never sees a half-written entry, and a producer
//! never reuses a slot before the consumer that owned it has copied it out.
//!
//! # Thread Safety
//! `Ring` is `Send + Sync`; every shared access goes through the header
//! atomics. `Single` mode is a promise about callers, not handles: at most
//! one thread (in any process) may produce, or consume, at a time.

use crate::error::{IccError, Result};
use crate::ring::{RingConfig, SyncMode, free_entries, ready_entries, seq_to_index};
use crate::shm_layout::{HeadTail, LAYOUT_VERSION, RING_MAGIC, RingHeader, bytes_for_ring, fits_layout};
use ferry_mmap::{Attached, Lifecycle, MmapSegment, Owned, ShmNamespace};
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Behavior {
    /// All requested entries or none.
    Fixed,
    /// As many as possible.
    Variable,
}

pub struct Ring<T: Copy, L: Lifecycle = Attached> {
    seg: MmapSegment<L>,
    mask: u64,
    capacity: u64,
    producer: SyncMode,
    consumer: SyncMode,
    _pd: PhantomData<T>,
}

impl<T: Copy> Ring<T, Owned> {
    /// Creates the ring and publishes it under `name`.
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is taken (a ring is never shared between
    ///   two creators)
    /// - `ResourceExhausted` if the backing memory cannot be obtained
    /// - `InvalidConfig` for a capacity that is not a power of two
    pub fn create(ns: &ShmNamespace, name: &str, cfg: RingConfig) -> Result<Self> {
        check_element::<T>()?;
        if !cfg.capacity.is_power_of_two() {
            return Err(IccError::InvalidConfig("ring capacity must be a power of two"));
        }
        let bytes = bytes_for_ring::<T>(cfg.capacity).ok_or_else(|| IccError::ResourceExhausted {
            name: name.to_string(),
            bytes: usize::MAX,
            source: None,
        })?;

        let seg = MmapSegment::<Owned>::create(ns, name, bytes, |region| {
            // SAFETY: the region is private to us until published, and is at
            // least `size_of::<RingHeader>()` bytes of page-aligned memory.
            unsafe {
                ptr::write(
                    region.as_mut_ptr() as *mut RingHeader,
                    RingHeader {
                        magic: RING_MAGIC,
                        version: LAYOUT_VERSION,
                        capacity: cfg.capacity as u64,
                        elem_size: size_of::<T>() as u64,
                        producer_mode: cfg.producer as u32,
                        consumer_mode: cfg.consumer as u32,
                        prod: HeadTail {
                            head: AtomicU64::new(0),
                            tail: AtomicU64::new(0),
                        },
                        cons: HeadTail {
                            head: AtomicU64::new(0),
                            tail: AtomicU64::new(0),
                        },
                    },
                );
            }
        })
        .map_err(|e| IccError::from_io(name, bytes, e))?;

        tracing::info!(
            name,
            capacity = cfg.capacity,
            producer = ?cfg.producer,
            consumer = ?cfg.consumer,
            "ring created"
        );

        Ok(Self {
            seg,
            mask: cfg.mask(),
            capacity: cfg.capacity as u64,
            producer: cfg.producer,
            consumer: cfg.consumer,
            _pd: PhantomData,
        })
    }
}

impl<T: Copy> Ring<T, Attached> {
    /// Looks up a ring created by another process (or another handle).
    ///
    /// Fails with `NotFound` if the creator has not published it yet; waiting
    /// for it is the caller's business.
    pub fn attach(ns: &ShmNamespace, name: &str) -> Result<Self> {
        check_element::<T>()?;
        let seg = MmapSegment::<Attached>::attach(ns, name).map_err(|e| IccError::from_io(name, 0, e))?;
        if seg.len() < size_of::<RingHeader>() {
            return Err(IccError::InvalidLayout {
                name: name.to_string(),
                reason: "segment shorter than ring header",
            });
        }

        // SAFETY: length checked above; the creator published the segment
        // only after writing the header.
        let h = unsafe { &*(seg.base() as *const RingHeader) };
        h.validate::<T>().map_err(|reason| IccError::InvalidLayout {
            name: name.to_string(),
            reason,
        })?;
        let capacity = h.capacity;
        if bytes_for_ring::<T>(capacity as usize).is_none_or(|bytes| bytes > seg.len()) {
            return Err(IccError::InvalidLayout {
                name: name.to_string(),
                reason: "segment shorter than its slots",
            });
        }
        // validate() rejected unknown modes
        let producer = SyncMode::from_raw(h.producer_mode).unwrap_or_default();
        let consumer = SyncMode::from_raw(h.consumer_mode).unwrap_or_default();

        tracing::info!(name, capacity, ?producer, ?consumer, "ring attached");

        Ok(Self {
            seg,
            mask: capacity - 1,
            capacity,
            producer,
            consumer,
            _pd: PhantomData,
        })
    }
}

fn check_element<T>() -> Result<()> {
    if size_of::<T>() == 0 {
        return Err(IccError::InvalidConfig("ring elements must not be zero-sized"));
    }
    if !fits_layout::<T>() {
        return Err(IccError::InvalidConfig("ring elements must not need more than 64-byte alignment"));
    }
    Ok(())
}

impl<T: Copy, L: Lifecycle> Ring<T, L> {
    #[inline(always)]
    fn header(&self) -> &RingHeader {
        // SAFETY: base points to a validated RingHeader for the lifetime of seg
        unsafe { &*(self.seg.base() as *const RingHeader) }
    }

    #[inline(always)]
    fn slots(&self) -> *mut T {
        // SAFETY: slots start right after the header, inside the mapping
        unsafe { self.seg.base().add(size_of::<RingHeader>()) as *mut T }
    }

    /// Admits as many of `items` as there is room for, front first.
    ///
    /// Returns how many were admitted (`0..=items.len()`). Admitted entries
    /// keep their order. Never blocks.
    #[inline]
    pub fn enqueue_burst(&self, items: &[T]) -> usize {
        self.enqueue_inner(items, Behavior::Variable)
    }

    /// Admits all of `items` or none of them.
    #[inline]
    pub fn enqueue_bulk(&self, items: &[T]) -> bool {
        !items.is_empty() && self.enqueue_inner(items, Behavior::Fixed) == items.len()
    }

    #[inline]
    pub fn enqueue(&self, item: T) -> std::result::Result<(), T> {
        if self.enqueue_inner(std::slice::from_ref(&item), Behavior::Fixed) == 1 {
            Ok(())
        } else {
            Err(item)
        }
    }

    /// Removes up to `out.len()` entries in FIFO order into the front of
    /// `out`, returning how many were written. Never blocks.
    #[inline]
    pub fn dequeue_burst(&self, out: &mut [T]) -> usize {
        // SAFETY: out is valid for out.len() writes of T
        unsafe { self.dequeue_inner(out.as_mut_ptr(), out.len(), Behavior::Variable) }
    }

    /// Fills all of `out` or removes nothing.
    #[inline]
    pub fn dequeue_bulk(&self, out: &mut [T]) -> bool {
        // SAFETY: out is valid for out.len() writes of T
        !out.is_empty() && unsafe { self.dequeue_inner(out.as_mut_ptr(), out.len(), Behavior::Fixed) } == out.len()
    }

    #[inline]
    pub fn dequeue(&self) -> Option<T> {
        let mut v = MaybeUninit::<T>::uninit();
        // SAFETY: v has room for exactly one T and is only read if written
        unsafe {
            if self.dequeue_inner(v.as_mut_ptr(), 1, Behavior::Fixed) == 1 {
                Some(v.assume_init())
            } else {
                None
            }
        }
    }

    fn enqueue_inner(&self, items: &[T], behavior: Behavior) -> usize {
        let requested = items.len() as u64;
        if requested == 0 {
            return 0;
        }
        let h = self.header();

        let mut old_head = h.prod.head.load(Ordering::Relaxed);
        let n = loop {
            let cons_tail = h.cons.tail.load(Ordering::Acquire);
            // A stale head can trail a consumer that already moved on; the
            // CAS below would fail anyway, so just reload.
            if old_head.wrapping_sub(cons_tail) > self.capacity {
                std::hint::spin_loop();
                old_head = h.prod.head.load(Ordering::Relaxed);
                continue;
            }
            let free = free_entries(self.capacity, old_head, cons_tail);
            let n = match behavior {
                Behavior::Fixed if requested > free => 0,
                Behavior::Fixed => requested,
                Behavior::Variable => requested.min(free),
            };
            if n == 0 {
                return 0;
            }
            let new_head = old_head.wrapping_add(n);
            match self.producer {
                SyncMode::Single => {
                    h.prod.head.store(new_head, Ordering::Relaxed);
                    break n;
                }
                SyncMode::Multi => match h.prod.head.compare_exchange_weak(
                    old_head,
                    new_head,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break n,
                    Err(current) => old_head = current,
                },
            }
        };

        // SAFETY: slots [old_head, old_head + n) are reserved for us alone and
        // every consumer has released them (checked against cons.tail).
        unsafe { self.copy_in(old_head, &items[..n as usize]) };
        publish(&h.prod, old_head, old_head.wrapping_add(n), self.producer);
        n as usize
    }

    /// # Safety
    /// `out` must be valid for `max` writes of `T`.
    unsafe fn dequeue_inner(&self, out: *mut T, max: usize, behavior: Behavior) -> usize {
        let requested = max as u64;
        if requested == 0 {
            return 0;
        }
        let h = self.header();

        let mut old_head = h.cons.head.load(Ordering::Relaxed);
        let n = loop {
            let prod_tail = h.prod.tail.load(Ordering::Acquire);
            let entries = ready_entries(prod_tail, old_head);
            if entries > self.capacity {
                std::hint::spin_loop();
                old_head = h.cons.head.load(Ordering::Relaxed);
                continue;
            }
            let n = match behavior {
                Behavior::Fixed if requested > entries => 0,
                Behavior::Fixed => requested,
                Behavior::Variable => requested.min(entries),
            };
            if n == 0 {
                return 0;
            }
            let new_head = old_head.wrapping_add(n);
            match self.consumer {
                SyncMode::Single => {
                    h.cons.head.store(new_head, Ordering::Relaxed);
                    break n;
                }
                SyncMode::Multi => match h.cons.head.compare_exchange_weak(
                    old_head,
                    new_head,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break n,
                    Err(current) => old_head = current,
                },
            }
        };

        // SAFETY: entries [old_head, old_head + n) were published by
        // producers (prod.tail, Acquire) and are now reserved for us.
        unsafe { self.copy_out(old_head, out, n as usize) };
        publish(&h.cons, old_head, old_head.wrapping_add(n), self.consumer);
        n as usize
    }

    /// # Safety
    /// The caller must own the reservation starting at `seq`.
    unsafe fn copy_in(&self, seq: u64, items: &[T]) {
        let start = seq_to_index(seq, self.mask) as usize;
        let first = (self.capacity as usize - start).min(items.len());
        unsafe {
            ptr::copy_nonoverlapping(items.as_ptr(), self.slots().add(start), first);
            ptr::copy_nonoverlapping(items.as_ptr().add(first), self.slots(), items.len() - first);
        }
    }

    /// # Safety
    /// The caller must own the reservation starting at `seq` and `out` must
    /// be valid for `n` writes.
    unsafe fn copy_out(&self, seq: u64, out: *mut T, n: usize) {
        let start = seq_to_index(seq, self.mask) as usize;
        let first = (self.capacity as usize - start).min(n);
        unsafe {
            ptr::copy_nonoverlapping(self.slots().add(start), out, first);
            ptr::copy_nonoverlapping(self.slots(), out.add(first), n - first);
        }
    }

    /// Entries currently resident. Advisory under concurrent use.
    pub fn len(&self) -> usize {
        let h = self.header();
        let cons_tail = h.cons.tail.load(Ordering::Acquire);
        let prod_tail = h.prod.tail.load(Ordering::Acquire);
        prod_tail.wrapping_sub(cons_tail).min(self.capacity) as usize
    }

    /// Slots currently free. Advisory under concurrent use.
    pub fn free_count(&self) -> usize {
        self.capacity as usize - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn name(&self) -> &str {
        self.seg.name()
    }

    pub fn producer_mode(&self) -> SyncMode {
        self.producer
    }

    pub fn consumer_mode(&self) -> SyncMode {
        self.consumer
    }

    pub fn is_owner(&self) -> bool {
        self.seg.is_owner()
    }

    /// True once the owner has removed the ring's name, i.e. the creating
    /// process has shut down. The mapping itself stays valid.
    pub fn is_unlinked(&self) -> bool {
        !self.seg.is_owner() && !self.seg.path().exists()
    }
}

/// Makes a reservation visible to the other side, in reservation order.
///
/// In `Multi` mode the wait acquires the previous reserver's tail, so its
/// slot copies are ordered before our `Release` and travel with it.
#[inline(always)]
fn publish(side: &HeadTail, old: u64, new: u64, mode: SyncMode) {
    if mode == SyncMode::Multi {
        while side.tail.load(Ordering::Acquire) != old {
            std::hint::spin_loop();
        }
    }
    side.tail.store(new, Ordering::Release);
}

impl<T: Copy, L: Lifecycle> std::fmt::Debug for Ring<T, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name())
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("producer", &self.producer)
            .field("consumer", &self.consumer)
            .field("owner", &self.is_owner())
            .finish()
    }
}
