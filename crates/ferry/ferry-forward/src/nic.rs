//! Stand-ins for the network-facing collaborators: a receive side that
//! produces frames out of the pool and a transmit side that consumes them.

use crate::transport::{BurstSink, BurstSource};
use ferry_icc::{Handle, Lifecycle, Pool};

const SEQ_BYTES: usize = std::mem::size_of::<u64>();

/// Writes a frame of `frame_len` bytes (clamped to the slot) carrying `seq`
/// in its first eight bytes and the low byte of `seq` after that.
fn stamp(buf: &mut [u8], seq: u64, frame_len: usize) -> usize {
    let len = frame_len.clamp(SEQ_BYTES.min(buf.len()), buf.len());
    let head = SEQ_BYTES.min(len);
    buf[..head].copy_from_slice(&seq.to_le_bytes()[..head]);
    buf[head..len].fill(seq as u8);
    len
}

/// Sequence number of a frame produced by [`Generator`].
pub fn frame_seq(frame: &[u8]) -> Option<u64> {
    let bytes: [u8; SEQ_BYTES] = frame.get(..SEQ_BYTES)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Receive side: every burst allocates pool slots and fills them with
/// numbered frames. An exhausted pool yields an empty burst.
pub struct Generator<L: Lifecycle> {
    pool: Pool<L>,
    next_seq: u64,
    frame_len: usize,
}

impl<L: Lifecycle> Generator<L> {
    pub fn new(pool: Pool<L>, frame_len: usize) -> Self {
        Self {
            pool,
            next_seq: 0,
            frame_len,
        }
    }

    pub fn generated(&self) -> u64 {
        self.next_seq
    }
}

impl<L: Lifecycle> BurstSource<Handle> for Generator<L> {
    fn recv_burst(&mut self, out: &mut [Handle]) -> usize {
        let n = self.pool.allocate_burst(out);
        let mut kept = 0;
        for i in 0..n {
            let (seq, frame_len) = (self.next_seq, self.frame_len);
            match self.pool.fill(out[i], |buf| stamp(buf, seq, frame_len)) {
                Ok(h) => {
                    out[kept] = h;
                    kept += 1;
                    self.next_seq += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping frame");
                    if let Err(e) = self.pool.release(out[i]) {
                        tracing::warn!(error = %e, "could not release dropped frame");
                    }
                }
            }
        }
        kept
    }
}

/// Transmit side: reads and releases every accepted frame. An optional
/// per-call limit models a transmit queue that takes only part of a burst.
pub struct Discard<'a, L: Lifecycle> {
    pool: &'a Pool<L>,
    tx_limit: Option<usize>,
    frames: u64,
    bytes: u64,
    last_seq: Option<u64>,
}

impl<'a, L: Lifecycle> Discard<'a, L> {
    pub fn new(pool: &'a Pool<L>) -> Self {
        Self {
            pool,
            tx_limit: None,
            frames: 0,
            bytes: 0,
            last_seq: None,
        }
    }

    pub fn with_tx_limit(mut self, limit: usize) -> Self {
        self.tx_limit = Some(limit);
        self
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Sequence number of the last generated frame seen.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}

impl<L: Lifecycle> BurstSink<Handle> for Discard<'_, L> {
    fn send_burst(&mut self, items: &[Handle]) -> usize {
        let n = self.tx_limit.map_or(items.len(), |limit| limit.min(items.len()));
        for h in &items[..n] {
            match self.pool.read(h, |frame| (frame.len(), frame_seq(frame))) {
                Ok((len, seq)) => {
                    self.bytes += len as u64;
                    if seq.is_some() {
                        self.last_seq = seq;
                    }
                }
                Err(e) => tracing::warn!(index = h.index, error = %e, "unreadable frame"),
            }
            if let Err(e) = self.pool.release(*h) {
                tracing::warn!(index = h.index, error = %e, "could not release frame");
            }
            self.frames += 1;
        }
        n
    }
}
