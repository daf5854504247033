//! Fixed-capacity pool of equally sized slots in a named shared segment.
//!
//! All slots are carved out when the pool is created and live until the
//! owner drops it; allocation and release only move slot indices on and off
//! a lock-free free list (a Treiber stack whose head carries an ABA tag), so
//! any number of processes may allocate and release concurrently.
//!
//! A [`Handle`] names one allocation: slot index, the slot's generation at
//! allocation time, and the payload length. Generations make stale handles
//! detectable: releasing or reading through a handle whose slot has since
//! been released (and possibly reallocated) fails instead of corrupting
//! someone else's buffer.

use crate::error::{IccError, Result};
use crate::shm_layout::{
    LAYOUT_VERSION, NIL, POOL_MAGIC, PoolGeometry, PoolHeader, SLOT_IN_USE, SlotMeta, pack_head, unpack_head,
};
use ferry_mmap::{Attached, Lifecycle, MmapSegment, Owned, ShmNamespace};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const GENERATION_MASK: u32 = u32::MAX >> 1;

/// Reference to an allocated pool slot, small and `Copy` so it can travel
/// through rings.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
    /// Payload bytes in use, set by [`Pool::write`] / [`Pool::fill`].
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub slot_size: usize,
    pub slot_count: usize,
}

pub struct Pool<L: Lifecycle = Attached> {
    seg: MmapSegment<L>,
    slot_size: usize,
    stride: usize,
    slot_count: u32,
    data_offset: usize,
}

impl Pool<Owned> {
    /// Pre-allocates `cfg.slot_count` slots of `cfg.slot_size` bytes and
    /// publishes the pool under `name`. Every slot starts on the free list.
    pub fn create(ns: &ShmNamespace, name: &str, cfg: PoolConfig) -> Result<Self> {
        if cfg.slot_size == 0 || cfg.slot_count == 0 {
            return Err(IccError::InvalidConfig("pool slot size and count must be non-zero"));
        }
        if cfg.slot_count >= NIL as usize {
            return Err(IccError::InvalidConfig("pool slot count must fit in 32 bits"));
        }
        let geometry = PoolGeometry::new(cfg.slot_size, cfg.slot_count).ok_or_else(|| {
            IccError::ResourceExhausted {
                name: name.to_string(),
                bytes: usize::MAX,
                source: None,
            }
        })?;
        let count = cfg.slot_count as u32;

        let seg = MmapSegment::<Owned>::create(ns, name, geometry.total, |region| {
            let base = region.as_mut_ptr();
            // SAFETY: the region is private until published and sized by
            // `geometry`, which places the header at 0 and the metadata
            // array right behind it.
            unsafe {
                ptr::write(
                    base as *mut PoolHeader,
                    PoolHeader {
                        magic: POOL_MAGIC,
                        version: LAYOUT_VERSION,
                        slot_size: cfg.slot_size as u64,
                        slot_stride: geometry.stride as u64,
                        slot_count: count as u64,
                        data_offset: geometry.data_offset as u64,
                        free_head: AtomicU64::new(pack_head(0, 0)),
                        free_count: AtomicU64::new(count as u64),
                    },
                );
                let metas = base.add(size_of::<PoolHeader>()) as *mut SlotMeta;
                for i in 0..count {
                    ptr::write(
                        metas.add(i as usize),
                        SlotMeta {
                            next: AtomicU32::new(if i + 1 == count { NIL } else { i + 1 }),
                            state: AtomicU32::new(0),
                            len: AtomicU32::new(0),
                            _reserved: 0,
                        },
                    );
                }
            }
        })
        .map_err(|e| IccError::from_io(name, geometry.total, e))?;

        tracing::info!(
            name,
            slot_size = cfg.slot_size,
            slot_count = cfg.slot_count,
            bytes = geometry.total,
            "pool created"
        );

        Ok(Self {
            seg,
            slot_size: cfg.slot_size,
            stride: geometry.stride,
            slot_count: count,
            data_offset: geometry.data_offset,
        })
    }
}

impl Pool<Attached> {
    /// Locates a pool created by another process.
    pub fn attach(ns: &ShmNamespace, name: &str) -> Result<Self> {
        let seg = MmapSegment::<Attached>::attach(ns, name).map_err(|e| IccError::from_io(name, 0, e))?;
        if seg.len() < size_of::<PoolHeader>() {
            return Err(IccError::InvalidLayout {
                name: name.to_string(),
                reason: "segment shorter than pool header",
            });
        }
        // SAFETY: length checked above; published only after initialisation
        let h = unsafe { &*(seg.base() as *const PoolHeader) };
        h.validate(seg.len()).map_err(|reason| IccError::InvalidLayout {
            name: name.to_string(),
            reason,
        })?;

        tracing::info!(name, slot_size = h.slot_size, slot_count = h.slot_count, "pool attached");

        Ok(Self {
            slot_size: h.slot_size as usize,
            stride: h.slot_stride as usize,
            slot_count: h.slot_count as u32,
            data_offset: h.data_offset as usize,
            seg,
        })
    }
}

impl<L: Lifecycle> Pool<L> {
    #[inline(always)]
    fn header(&self) -> &PoolHeader {
        // SAFETY: base points to a validated PoolHeader for the lifetime of seg
        unsafe { &*(self.seg.base() as *const PoolHeader) }
    }

    /// # Panics
    /// Debug-asserts `index < slot_count`; callers check first.
    #[inline(always)]
    fn meta(&self, index: u32) -> &SlotMeta {
        debug_assert!(index < self.slot_count);
        // SAFETY: index is in bounds, metadata follows the header
        unsafe {
            let metas = self.seg.base().add(size_of::<PoolHeader>()) as *const SlotMeta;
            &*metas.add(index as usize)
        }
    }

    #[inline(always)]
    fn data(&self, index: u32) -> *mut u8 {
        // SAFETY: index is in bounds, each slot owns `stride` bytes
        unsafe {
            self.seg
                .base()
                .add(self.data_offset + index as usize * self.stride)
        }
    }

    /// Takes one slot off the free list.
    ///
    /// `None` means the pool is momentarily empty: backpressure, not failure.
    pub fn allocate(&self) -> Option<Handle> {
        let h = self.header();
        let mut cur = h.free_head.load(Ordering::Acquire);
        let index = loop {
            let (tag, index) = unpack_head(cur);
            if index == NIL {
                return None;
            }
            // May be stale if another process popped `index` meanwhile; the
            // tag makes the CAS fail in that case.
            let next = self.meta(index).next.load(Ordering::Relaxed);
            match h.free_head.compare_exchange_weak(
                cur,
                pack_head(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break index,
                Err(actual) => cur = actual,
            }
        };

        let meta = self.meta(index);
        let state = meta.state.load(Ordering::Acquire);
        debug_assert_eq!(state & SLOT_IN_USE, 0, "slot {index} on free list while in use");
        let generation = ((state >> 1).wrapping_add(1)) & GENERATION_MASK;
        meta.len.store(0, Ordering::Relaxed);
        meta.state.store((generation << 1) | SLOT_IN_USE, Ordering::Release);
        h.free_count.fetch_sub(1, Ordering::Relaxed);

        Some(Handle {
            index,
            generation,
            len: 0,
        })
    }

    /// Allocates up to `out.len()` slots, returning how many were taken.
    pub fn allocate_burst(&self, out: &mut [Handle]) -> usize {
        for (n, slot) in out.iter_mut().enumerate() {
            match self.allocate() {
                Some(handle) => *slot = handle,
                None => return n,
            }
        }
        out.len()
    }

    /// Returns a slot to the free list.
    ///
    /// # Errors
    /// - `InvalidHandle` for an index outside the pool
    /// - `DoubleRelease` if the slot is already free or the handle is stale
    pub fn release(&self, handle: Handle) -> Result<()> {
        self.check_index(handle.index)?;
        let meta = self.meta(handle.index);
        let live = (handle.generation << 1) | SLOT_IN_USE;
        meta.state
            .compare_exchange(live, handle.generation << 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| IccError::DoubleRelease { index: handle.index })?;

        let h = self.header();
        let mut cur = h.free_head.load(Ordering::Relaxed);
        loop {
            let (tag, top) = unpack_head(cur);
            meta.next.store(top, Ordering::Relaxed);
            match h.free_head.compare_exchange_weak(
                cur,
                pack_head(tag.wrapping_add(1), handle.index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        h.free_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copies `bytes` into the slot and returns the handle with its length set.
    pub fn write(&mut self, handle: Handle, bytes: &[u8]) -> Result<Handle> {
        self.fill(handle, |buf| {
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            bytes.len()
        })
    }

    /// Hands the whole slot buffer to `f`, which returns the payload length.
    pub fn fill<F>(&mut self, handle: Handle, f: F) -> Result<Handle>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        self.check_live(&handle)?;
        // SAFETY: the handle is live, so this slot belongs to its holder, and
        // `&mut self` rules out any other borrow through this pool handle.
        let buf = unsafe { std::slice::from_raw_parts_mut(self.data(handle.index), self.slot_size) };
        let len = f(buf);
        if len > self.slot_size {
            return Err(IccError::PayloadTooLarge {
                len,
                slot_size: self.slot_size,
            });
        }
        self.meta(handle.index).len.store(len as u32, Ordering::Release);
        Ok(Handle {
            len: len as u32,
            ..handle
        })
    }

    /// Runs `f` over the payload the handle describes.
    pub fn read<F, R>(&self, handle: &Handle, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.check_live(handle)?;
        let len = handle.len as usize;
        if len > self.slot_size {
            return Err(IccError::PayloadTooLarge {
                len,
                slot_size: self.slot_size,
            });
        }
        // SAFETY: live handle, length within the slot
        let buf = unsafe { std::slice::from_raw_parts(self.data(handle.index) as *const u8, len) };
        Ok(f(buf))
    }

    /// Whether the handle still names the current allocation of its slot.
    pub fn is_live(&self, handle: &Handle) -> bool {
        self.check_live(handle).is_ok()
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.slot_count {
            return Err(IccError::InvalidHandle { index });
        }
        Ok(())
    }

    fn check_live(&self, handle: &Handle) -> Result<()> {
        self.check_index(handle.index)?;
        let live = (handle.generation << 1) | SLOT_IN_USE;
        if self.meta(handle.index).state.load(Ordering::Acquire) != live {
            return Err(IccError::UseAfterRelease { index: handle.index });
        }
        Ok(())
    }

    /// Free slots. Advisory under concurrent use.
    pub fn available(&self) -> usize {
        self.header().free_count.load(Ordering::Relaxed) as usize
    }

    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    pub fn capacity(&self) -> usize {
        self.slot_count as usize
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn name(&self) -> &str {
        self.seg.name()
    }

    pub fn is_owner(&self) -> bool {
        self.seg.is_owner()
    }

    /// Free list from head to tail. Only meaningful while nobody else is
    /// allocating or releasing.
    #[cfg(test)]
    fn free_list(&self) -> Vec<u32> {
        let (_, mut index) = unpack_head(self.header().free_head.load(Ordering::Acquire));
        let mut out = Vec::new();
        while index != NIL && out.len() <= self.capacity() {
            out.push(index);
            index = self.meta(index).next.load(Ordering::Relaxed);
        }
        out
    }
}

impl<L: Lifecycle> std::fmt::Debug for Pool<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("slot_size", &self.slot_size)
            .field("slot_count", &self.slot_count)
            .field("available", &self.available())
            .field("owner", &self.is_owner())
            .finish()
    }
}
