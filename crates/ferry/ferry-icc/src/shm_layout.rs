//! Shared memory layouts for rings, pools and single-slot channels.
//!
//! Every layout starts with a magic number, a format version and the
//! geometry a peer needs to validate before touching anything else. All
//! structures are `#[repr(C)]` because the peers are separately compiled
//! processes.
//!
//! # Ring
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RingHeader: magic │ version │ capacity │ elem_size │ modes   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ prod: head │ tail                          (own cache line)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ cons: head │ tail                          (own cache line)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ T[0] │ T[1] │ ...                                │ T[cap-1]  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Pool
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ PoolHeader: magic │ version │ geometry │ free_head │ free_cnt│
//! ├──────────────────────────────────────────────────────────────┤
//! │ SlotMeta[0] │ SlotMeta[1] │ ...         (next, gen|state, len)│
//! ├──────────────────────────────────────────────────────────────┤
//! │ slot data[0] │ slot data[1] │ ...          (64-byte stride)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::ring::SyncMode;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// "FERRYRNG"
pub const RING_MAGIC: u64 = 0x4645_5252_5952_4E47;
/// "FERRYPOL"
pub const POOL_MAGIC: u64 = 0x4645_5252_5950_4F4C;
/// "FERRYCHN"
pub const CHANNEL_MAGIC: u64 = 0x4645_5252_5943_484E;

/// Current format version of all layouts.
pub const LAYOUT_VERSION: u64 = 1;

pub const CACHE_LINE: usize = 64;

/// Head/tail counter pair of one side of a ring.
///
/// `head` is where the next reservation starts; `tail` is how far
/// reservations have been published to the other side.
#[repr(C, align(64))]
pub struct HeadTail {
    pub head: AtomicU64,
    pub tail: AtomicU64,
}

#[repr(C)]
pub struct RingHeader {
    pub magic: u64,
    pub version: u64,
    /// Number of slots in the ring. Must be a power of 2.
    pub capacity: u64,
    /// Size of each element in bytes. Used to verify type compatibility.
    pub elem_size: u64,
    pub producer_mode: u32,
    pub consumer_mode: u32,
    pub prod: HeadTail,
    pub cons: HeadTail,
}

impl RingHeader {
    pub fn validate<T: Copy>(&self) -> Result<(), &'static str> {
        if self.magic != RING_MAGIC {
            return Err("bad magic");
        }
        if self.version != LAYOUT_VERSION {
            return Err("wrong version");
        }
        if !(self.capacity as usize).is_power_of_two() {
            return Err("capacity must be power of two");
        }
        if self.elem_size as usize != size_of::<T>() {
            return Err("element size mismatch");
        }
        if SyncMode::from_raw(self.producer_mode).is_none()
            || SyncMode::from_raw(self.consumer_mode).is_none()
        {
            return Err("unknown sync mode");
        }
        Ok(())
    }
}

/// Total bytes of a ring region: `header + capacity × size_of::<T>()`.
pub fn bytes_for_ring<T: Copy>(capacity: usize) -> Option<usize> {
    capacity
        .checked_mul(size_of::<T>())?
        .checked_add(size_of::<RingHeader>())
}

/// Low bit of `SlotMeta::state`; the remaining 31 bits are the generation.
pub const SLOT_IN_USE: u32 = 1;

/// End-of-list marker for the free list.
pub const NIL: u32 = u32::MAX;

#[repr(C, align(64))]
pub struct PoolHeader {
    pub magic: u64,
    pub version: u64,
    pub slot_size: u64,
    /// Distance between two slots' data, `slot_size` rounded up to a cache line.
    pub slot_stride: u64,
    pub slot_count: u64,
    pub data_offset: u64,
    /// Tagged free-list head: high 32 bits ABA tag, low 32 bits slot index.
    pub free_head: AtomicU64,
    /// Advisory count of free slots.
    pub free_count: AtomicU64,
}

#[repr(C)]
pub struct SlotMeta {
    /// Next free slot while on the free list.
    pub next: AtomicU32,
    /// `generation << 1 | in_use`, swapped as one word so a release through
    /// a stale handle can never free a newer allocation.
    pub state: AtomicU32,
    pub len: AtomicU32,
    pub _reserved: u32,
}

impl PoolHeader {
    pub fn validate(&self, mapped_len: usize) -> Result<(), &'static str> {
        if self.magic != POOL_MAGIC {
            return Err("bad magic");
        }
        if self.version != LAYOUT_VERSION {
            return Err("wrong version");
        }
        let geometry = PoolGeometry::new(self.slot_size as usize, self.slot_count as usize)
            .ok_or("slot geometry overflows")?;
        if geometry.stride as u64 != self.slot_stride || geometry.data_offset as u64 != self.data_offset {
            return Err("slot geometry mismatch");
        }
        if geometry.total > mapped_len {
            return Err("segment shorter than its slots");
        }
        Ok(())
    }
}

#[inline(always)]
pub fn pack_head(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline(always)]
pub fn unpack_head(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Byte geometry of a pool region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolGeometry {
    pub stride: usize,
    pub data_offset: usize,
    pub total: usize,
}

impl PoolGeometry {
    pub fn new(slot_size: usize, slot_count: usize) -> Option<Self> {
        if slot_size == 0 || slot_count == 0 || slot_count >= NIL as usize {
            return None;
        }
        let stride = align_up(slot_size, CACHE_LINE)?;
        let meta_end = slot_count
            .checked_mul(size_of::<SlotMeta>())?
            .checked_add(size_of::<PoolHeader>())?;
        let data_offset = align_up(meta_end, CACHE_LINE)?;
        let total = slot_count.checked_mul(stride)?.checked_add(data_offset)?;
        Some(Self {
            stride,
            data_offset,
            total,
        })
    }
}

#[repr(C, align(64))]
pub struct ChannelHeader {
    pub magic: u64,
    pub version: u64,
    pub elem_size: u64,
}

impl ChannelHeader {
    pub fn validate<T: Copy>(&self) -> Result<(), &'static str> {
        if self.magic != CHANNEL_MAGIC {
            return Err("bad magic");
        }
        if self.version != LAYOUT_VERSION {
            return Err("wrong version");
        }
        if self.elem_size as usize != size_of::<T>() {
            return Err("payload size mismatch");
        }
        Ok(())
    }
}

/// The payload sits right after the header's cache line.
pub fn bytes_for_channel<T: Copy>() -> usize {
    size_of::<ChannelHeader>() + size_of::<T>().max(1)
}

/// Payload types must not need more than cache-line alignment, since that
/// is all the layouts guarantee past the page-aligned base.
pub const fn fits_layout<T>() -> bool {
    align_of::<T>() <= CACHE_LINE
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_cache_line_multiples() {
        assert_eq!(size_of::<RingHeader>() % CACHE_LINE, 0);
        assert_eq!(size_of::<PoolHeader>(), CACHE_LINE);
        assert_eq!(size_of::<ChannelHeader>(), CACHE_LINE);
        assert_eq!(size_of::<SlotMeta>(), 16);
    }

    #[test]
    fn pool_geometry_rounds_to_cache_lines() {
        let g = PoolGeometry::new(100, 4).unwrap();
        assert_eq!(g.stride, 128);
        assert_eq!(g.data_offset, 128); // 64 header + 4 * 16 meta
        assert_eq!(g.total, 128 + 4 * 128);
        assert!(PoolGeometry::new(0, 4).is_none());
        assert!(PoolGeometry::new(64, 0).is_none());
        assert!(PoolGeometry::new(usize::MAX, 2).is_none());
    }

    #[test]
    fn head_packing_round_trips() {
        let head = pack_head(7, 42);
        assert_eq!(unpack_head(head), (7, 42));
        assert_eq!(unpack_head(pack_head(u32::MAX, NIL)), (u32::MAX, NIL));
    }

    #[test]
    fn ring_bytes_overflow_is_reported() {
        assert_eq!(
            bytes_for_ring::<u64>(8),
            Some(size_of::<RingHeader>() + 64)
        );
        assert!(bytes_for_ring::<u64>(usize::MAX).is_none());
    }
}
