//! What a forwarding loop pulls from, pushes to, and hands refused items back to.

use ferry_icc::{Handle, Lifecycle, Pool, Ring};
use std::collections::VecDeque;

/// Yields bursts of items without blocking.
pub trait BurstSource<T> {
    /// Fills the front of `out` and returns how many items were written.
    /// Zero means nothing is available right now.
    fn recv_burst(&mut self, out: &mut [T]) -> usize;
}

/// Accepts bursts of items without blocking.
pub trait BurstSink<T> {
    /// Takes a prefix of `items` and returns its length. A short count is
    /// backpressure, not failure.
    fn send_burst(&mut self, items: &[T]) -> usize;

    /// True when nothing will ever be accepted again.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Takes ownership of items that could not be delivered.
pub trait Reclaim<T> {
    fn reclaim(&mut self, items: &[T]);
}

impl<T: Copy, L: Lifecycle> BurstSource<T> for Ring<T, L> {
    #[inline]
    fn recv_burst(&mut self, out: &mut [T]) -> usize {
        self.dequeue_burst(out)
    }
}

impl<T: Copy, L: Lifecycle> BurstSource<T> for &Ring<T, L> {
    #[inline]
    fn recv_burst(&mut self, out: &mut [T]) -> usize {
        self.dequeue_burst(out)
    }
}

impl<T: Copy, L: Lifecycle> BurstSink<T> for Ring<T, L> {
    #[inline]
    fn send_burst(&mut self, items: &[T]) -> usize {
        self.enqueue_burst(items)
    }

    fn is_closed(&self) -> bool {
        self.is_unlinked()
    }
}

impl<T: Copy, L: Lifecycle> BurstSink<T> for &Ring<T, L> {
    #[inline]
    fn send_burst(&mut self, items: &[T]) -> usize {
        self.enqueue_burst(items)
    }

    fn is_closed(&self) -> bool {
        self.is_unlinked()
    }
}

fn release_all<L: Lifecycle>(pool: &Pool<L>, handles: &[Handle]) {
    for h in handles {
        if let Err(e) = pool.release(*h) {
            tracing::warn!(pool = pool.name(), index = h.index, error = %e, "reclaim skipped a handle");
        }
    }
}

impl<L: Lifecycle> Reclaim<Handle> for Pool<L> {
    fn reclaim(&mut self, items: &[Handle]) {
        release_all(self, items);
    }
}

impl<L: Lifecycle> Reclaim<Handle> for &Pool<L> {
    fn reclaim(&mut self, items: &[Handle]) {
        release_all(self, items);
    }
}

impl<T: Copy> BurstSource<T> for VecDeque<T> {
    fn recv_burst(&mut self, out: &mut [T]) -> usize {
        let n = out.len().min(self.len());
        for (slot, item) in out.iter_mut().zip(self.drain(..n)) {
            *slot = item;
        }
        n
    }
}

/// Unbounded sink, mostly for tests and for collecting results.
impl<T: Copy> BurstSink<T> for Vec<T> {
    fn send_burst(&mut self, items: &[T]) -> usize {
        self.extend_from_slice(items);
        items.len()
    }
}

impl<T: Copy> Reclaim<T> for Vec<T> {
    fn reclaim(&mut self, items: &[T]) {
        self.extend_from_slice(items);
    }
}

impl<T, S: BurstSource<T> + ?Sized> BurstSource<T> for &mut S {
    fn recv_burst(&mut self, out: &mut [T]) -> usize {
        (**self).recv_burst(out)
    }
}

impl<T, K: BurstSink<T> + ?Sized> BurstSink<T> for &mut K {
    fn send_burst(&mut self, items: &[T]) -> usize {
        (**self).send_burst(items)
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

impl<T, R: Reclaim<T> + ?Sized> Reclaim<T> for &mut R {
    fn reclaim(&mut self, items: &[T]) {
        (**self).reclaim(items)
    }
}
