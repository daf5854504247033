//! Single-slot channel: one shared value handed back and forth between one
//! writer and one reader under two named semaphores.
//!
//! ```text
//!            write_turn()                      read_turn()
//!   FreeForWriter ──────────► (writer owns) ─commit─► DataReady
//!         ▲                                               │
//!         └──────finish─── (reader owns) ◄────────────────┘
//! ```
//!
//! `free` starts at 1 so the writer goes first; `ready` starts at 0.
//!
//! Whoever publishes the region first owns the channel and is the only one
//! to create the semaphores. Everyone else opens them, waiting briefly for
//! the owner to finish creating them. Nothing on this path unlinks a name;
//! leftovers of a crashed owner are removed with [`SlotChannel::purge`].

use crate::error::{IccError, Result};
use crate::semaphore::NamedSemaphore;
use crate::shm_layout::{CHANNEL_MAGIC, ChannelHeader, LAYOUT_VERSION, bytes_for_channel, fits_layout};
use ferry_mmap::{Attached, MmapSegment, Owned, ShmNamespace};
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;
use std::ptr;
use std::time::{Duration, Instant};

/// How long an opener waits for the owner to create the semaphores.
const SEMAPHORE_WAIT: Duration = Duration::from_secs(1);

enum Region {
    Owned(MmapSegment<Owned>),
    Attached(MmapSegment<Attached>),
}

impl Region {
    fn base(&self) -> *mut u8 {
        match self {
            Region::Owned(seg) => seg.base(),
            Region::Attached(seg) => seg.base(),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Region::Owned(seg) => seg.path(),
            Region::Attached(seg) => seg.path(),
        }
    }
}

/// Opens a semaphore the channel owner may still be creating.
fn open_semaphore(name: &str) -> Result<NamedSemaphore> {
    let deadline = Instant::now() + SEMAPHORE_WAIT;
    let mut delay = Duration::from_millis(1);
    loop {
        match NamedSemaphore::open(name) {
            Err(e) if e.is_not_found() && Instant::now() < deadline => {
                std::thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_millis(50));
            }
            other => return other,
        }
    }
}

pub fn ready_semaphore_name(channel: &str) -> String {
    format!("/{channel}.ready")
}

pub fn free_semaphore_name(channel: &str) -> String {
    format!("/{channel}.free")
}

pub struct SlotChannel<T: Copy> {
    region: Region,
    /// Posted by the writer once a value is in the slot.
    ready: NamedSemaphore,
    /// Posted by the reader once the slot may be overwritten.
    free: NamedSemaphore,
    name: String,
    _pd: PhantomData<T>,
}

// SAFETY: the slot is only touched while holding a turn, and turns are
// handed out by the semaphores one at a time.
unsafe impl<T: Copy + Send> Sync for SlotChannel<T> {}

impl<T: Copy> SlotChannel<T> {
    /// Attaches to `name` if it exists, otherwise creates it and becomes the
    /// owner. Only the owner unlinks the region and semaphore names on drop.
    pub fn create_or_open(ns: &ShmNamespace, name: &str) -> Result<Self> {
        if size_of::<T>() == 0 || !fits_layout::<T>() {
            return Err(IccError::InvalidConfig("channel payload must be sized and at most cache-line aligned"));
        }
        if ns.exists(name) {
            return Self::open(ns, name);
        }
        match Self::publish(ns, name) {
            Ok(seg) => Self::create(seg, name),
            // lost the race to another creator
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Self::open(ns, name),
            Err(e) => Err(IccError::from_io(name, bytes_for_channel::<T>(), e)),
        }
    }

    /// Links the region under `name`. Exactly one concurrent caller wins.
    fn publish(ns: &ShmNamespace, name: &str) -> std::io::Result<MmapSegment<Owned>> {
        MmapSegment::<Owned>::create(ns, name, bytes_for_channel::<T>(), |region| {
            // SAFETY: region is at least one header long and private until published
            unsafe {
                ptr::write(
                    region.as_mut_ptr() as *mut ChannelHeader,
                    ChannelHeader {
                        magic: CHANNEL_MAGIC,
                        version: LAYOUT_VERSION,
                        elem_size: size_of::<T>() as u64,
                    },
                );
            }
        })
    }

    /// Creates the semaphores for a region this process has published. A
    /// failure drops `seg`, which unlinks the region again.
    fn create(seg: MmapSegment<Owned>, name: &str) -> Result<Self> {
        let ready = NamedSemaphore::create(&ready_semaphore_name(name), 0)?;
        let free = NamedSemaphore::create(&free_semaphore_name(name), 1)?;

        tracing::info!(name, payload = size_of::<T>(), "channel created");

        Ok(Self {
            region: Region::Owned(seg),
            ready,
            free,
            name: name.to_string(),
            _pd: PhantomData,
        })
    }

    fn open(ns: &ShmNamespace, name: &str) -> Result<Self> {
        let seg = MmapSegment::<Attached>::attach(ns, name).map_err(|e| IccError::from_io(name, 0, e))?;
        if seg.len() < bytes_for_channel::<T>() {
            return Err(IccError::InvalidLayout {
                name: name.to_string(),
                reason: "segment shorter than channel layout",
            });
        }
        // SAFETY: length checked above
        let header = unsafe { &*(seg.base() as *const ChannelHeader) };
        header.validate::<T>().map_err(|reason| IccError::InvalidLayout {
            name: name.to_string(),
            reason,
        })?;

        let ready = open_semaphore(&ready_semaphore_name(name))?;
        let free = open_semaphore(&free_semaphore_name(name))?;

        tracing::info!(name, "channel attached");

        Ok(Self {
            region: Region::Attached(seg),
            ready,
            free,
            name: name.to_string(),
            _pd: PhantomData,
        })
    }

    #[inline(always)]
    fn slot(&self) -> *mut T {
        // SAFETY: validated length; payload follows the 64-byte header
        unsafe { self.region.base().add(size_of::<ChannelHeader>()) as *mut T }
    }

    /// Blocks until the slot is free for writing.
    pub fn write_turn(&self) -> Result<WriteTurn<'_, T>> {
        self.free.wait()?;
        Ok(WriteTurn {
            chan: self,
            committed: false,
        })
    }

    /// Like [`write_turn`](Self::write_turn), giving up after `timeout`.
    pub fn write_turn_timeout(&self, timeout: Duration) -> Result<Option<WriteTurn<'_, T>>> {
        if !self.free.wait_timeout(timeout)? {
            return Ok(None);
        }
        Ok(Some(WriteTurn {
            chan: self,
            committed: false,
        }))
    }

    /// Blocks until a value is ready.
    pub fn read_turn(&self) -> Result<ReadTurn<'_, T>> {
        self.ready.wait()?;
        Ok(ReadTurn {
            chan: self,
            finished: false,
        })
    }

    pub fn read_turn_timeout(&self, timeout: Duration) -> Result<Option<ReadTurn<'_, T>>> {
        if !self.ready.wait_timeout(timeout)? {
            return Ok(None);
        }
        Ok(Some(ReadTurn {
            chan: self,
            finished: false,
        }))
    }

    /// Hands `value` to the reader. Blocks while a previous value is unread.
    pub fn send(&self, value: T) -> Result<()> {
        let mut turn = self.write_turn()?;
        turn.write(value);
        turn.commit()
    }

    /// `Ok(false)` if the reader did not free the slot within `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<bool> {
        match self.write_turn_timeout(timeout)? {
            Some(mut turn) => {
                turn.write(value);
                turn.commit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Takes the pending value, blocking until there is one.
    pub fn receive(&self) -> Result<T> {
        let turn = self.read_turn()?;
        let value = turn.read();
        turn.finish()?;
        Ok(value)
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.read_turn_timeout(timeout)? {
            Some(turn) => {
                let value = turn.read();
                turn.finish()?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        matches!(self.region, Region::Owned(_))
    }

    /// True once the owner has removed the channel's name. Nobody will
    /// take another turn on the other side.
    pub fn is_unlinked(&self) -> bool {
        !self.is_owner() && !self.region.path().exists()
    }

    /// Removes the region and semaphore names of a channel whose owner died.
    pub fn purge(ns: &ShmNamespace, name: &str) -> Result<bool> {
        let region = ns.remove(name).map_err(|e| IccError::from_io(name, 0, e))?;
        let ready = NamedSemaphore::unlink(&ready_semaphore_name(name))?;
        let free = NamedSemaphore::unlink(&free_semaphore_name(name))?;
        Ok(region || ready || free)
    }
}

impl<T: Copy> Drop for SlotChannel<T> {
    fn drop(&mut self) {
        tracing::info!(name = %self.name, owner = self.is_owner(), "channel closed");
    }
}

/// Exclusive right to write the slot. Dropping it without
/// [`commit`](WriteTurn::commit) gives the turn back to writers.
pub struct WriteTurn<'a, T: Copy> {
    chan: &'a SlotChannel<T>,
    committed: bool,
}

impl<T: Copy> WriteTurn<'_, T> {
    pub fn write(&mut self, value: T) {
        // SAFETY: holding the write turn, nobody else touches the slot
        unsafe { ptr::write(self.chan.slot(), value) }
    }

    /// Publishes the slot to the reader.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.chan.ready.post()
    }
}

impl<T: Copy> Drop for WriteTurn<'_, T> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.chan.free.post() {
                tracing::error!(error = %e, "could not hand back write turn");
            }
        }
    }
}

/// Exclusive right to read the slot. Dropping it without
/// [`finish`](ReadTurn::finish) leaves the value pending.
pub struct ReadTurn<'a, T: Copy> {
    chan: &'a SlotChannel<T>,
    finished: bool,
}

impl<T: Copy> ReadTurn<'_, T> {
    pub fn read(&self) -> T {
        // SAFETY: holding the read turn, the writer has committed a value
        unsafe { ptr::read(self.chan.slot()) }
    }

    /// Frees the slot for the writer.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.chan.free.post()
    }
}

impl<T: Copy> Drop for ReadTurn<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.chan.ready.post() {
                tracing::error!(error = %e, "could not hand back read turn");
            }
        }
    }
}
