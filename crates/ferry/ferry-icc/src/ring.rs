//! Ring configuration and index arithmetic.
//!
//! Rings are power-of-two sized so that a monotonically increasing sequence
//! number maps to a slot with a mask instead of a modulo.

use crate::error::IccError;

/// Concurrency contract for one side of a ring.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Exactly one enqueuer (or dequeuer) across all processes. The head is
    /// advanced with a plain store.
    Single = 1,
    /// Any number of enqueuers (or dequeuers). The head is advanced with CAS.
    #[default]
    Multi = 2,
}

impl SyncMode {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(SyncMode::Single),
            2 => Some(SyncMode::Multi),
            _ => None,
        }
    }
}

/// Configuration for a ring.
///
/// The capacity must always be a power of 2, enabling efficient index
/// calculations via bitmasking instead of expensive modulo operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots in the ring. Must be a power of 2.
    pub capacity: usize,
    pub producer: SyncMode,
    pub consumer: SyncMode,
}

impl RingConfig {
    /// Creates a multi-producer, multi-consumer configuration.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of 2.
    ///
    /// # Example
    /// ```
    /// use ferry_icc::RingConfig;
    /// let cfg = RingConfig::new(1024); // OK: 1024 = 2^10
    /// // RingConfig::new(1000);        // Would panic: not a power of 2
    /// ```
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "Capacity must be power of 2");
        Self {
            capacity,
            producer: SyncMode::Multi,
            consumer: SyncMode::Multi,
        }
    }

    /// Checked variant of [`RingConfig::new`].
    pub fn try_new(capacity: usize) -> Result<Self, IccError> {
        if !capacity.is_power_of_two() {
            return Err(IccError::InvalidConfig("ring capacity must be a power of two"));
        }
        if capacity > u32::MAX as usize {
            return Err(IccError::InvalidConfig("ring capacity must fit in 32 bits"));
        }
        Ok(Self::new(capacity))
    }

    pub fn single_producer(mut self) -> Self {
        self.producer = SyncMode::Single;
        self
    }

    pub fn single_consumer(mut self) -> Self {
        self.consumer = SyncMode::Single;
        self
    }

    pub fn with_modes(mut self, producer: SyncMode, consumer: SyncMode) -> Self {
        self.producer = producer;
        self.consumer = consumer;
        self
    }

    /// Returns the bitmask for index calculation.
    ///
    /// # Example
    /// ```
    /// use ferry_icc::RingConfig;
    /// let cfg = RingConfig::new(8);
    /// assert_eq!(cfg.mask(), 7);  // 0b111 in binary
    /// ```
    #[inline(always)]
    pub fn mask(&self) -> u64 {
        (self.capacity as u64) - 1
    }
}

/// Converts a sequence number to a slot index.
///
/// With `capacity = 8` (mask = 7 = `0b111`):
/// ```text
/// seq =  0 → 0 & 7 = 0
/// seq =  8 → 8 & 7 = 0  (wraps around)
/// seq = 15 → 15 & 7 = 7
/// ```
#[inline(always)]
pub fn seq_to_index(seq: u64, mask: u64) -> u64 {
    seq & mask
}

/// Number of slots a producer may still claim.
///
/// `prod_head` and `cons_tail` are free-running counters; their distance is
/// the number of entries reserved or resident, which is never more than
/// `capacity`, so head == tail is unambiguous (empty) and a distance of
/// `capacity` is full.
#[inline(always)]
pub fn free_entries(capacity: u64, prod_head: u64, cons_tail: u64) -> u64 {
    capacity - prod_head.wrapping_sub(cons_tail)
}

/// Number of published entries a consumer may still claim.
#[inline(always)]
pub fn ready_entries(prod_tail: u64, cons_head: u64) -> u64 {
    prod_tail.wrapping_sub(cons_head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_wraps_sequence() {
        let cfg = RingConfig::new(4);
        let idx: Vec<u64> = (0..9).map(|s| seq_to_index(s, cfg.mask())).collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn try_new_rejects_non_power_of_two() {
        assert!(matches!(RingConfig::try_new(6), Err(IccError::InvalidConfig(_))));
        assert!(matches!(RingConfig::try_new(0), Err(IccError::InvalidConfig(_))));
        assert_eq!(RingConfig::try_new(2048).unwrap().capacity, 2048);
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn new_panics_on_bad_capacity() {
        RingConfig::new(1000);
    }

    #[test]
    fn counters_disambiguate_full_and_empty() {
        assert_eq!(free_entries(4, 0, 0), 4);
        assert_eq!(free_entries(4, 4, 0), 0);
        assert_eq!(free_entries(4, 6, 2), 0);
        assert_eq!(ready_entries(6, 2), 4);
        // counters keep working across u64 wrap
        assert_eq!(free_entries(4, 1, u64::MAX), 2);
        assert_eq!(ready_entries(1, u64::MAX), 2);
    }

    #[test]
    fn builder_sets_modes() {
        let cfg = RingConfig::new(16).single_producer().single_consumer();
        assert_eq!(cfg.producer, SyncMode::Single);
        assert_eq!(cfg.consumer, SyncMode::Single);
        assert_eq!(RingConfig::new(16).producer, SyncMode::Multi);
    }
}
