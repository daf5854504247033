//! Named, memory-mapped shared segments.
//!
//! A segment is a file inside a [`ShmNamespace`] directory (by default
//! `/dev/shm`, so names line up with POSIX shared-memory names) mapped
//! read-write and `MAP_SHARED` into every process that opens it.
//!
//! The lifecycle of a mapping is part of its type:
//!
//! ```text
//! MmapSegment<Owned>      MmapSegment<Attached>
//!        |                        |
//!      Drop                     Drop
//!        |                        |
//!     munmap                   munmap
//!     unlink name              (name left to the owner)
//! ```
//!
//! Creation is staged: the creator sizes and initialises the segment under a
//! private name and only then links it under its public name, so an attacher
//! never maps a half-written header.

use memmap2::MmapMut;
use std::{
    fs::{self, File, OpenOptions},
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

/// Directory backing POSIX shared memory on Linux.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Longest file name the namespace directory accepts.
pub const NAME_MAX: usize = 255;

/// Bytes the staging name `.{name}.{pid}.{seq}.staging` adds around `name`,
/// with a `u32` pid and a `u64` sequence number at full width.
const STAGING_OVERHEAD: usize = ".".len() + ".".len() + 10 + ".".len() + 20 + ".staging".len();

/// Longest accepted segment name: its staging name must fit `NAME_MAX` too.
pub const MAX_NAME_LEN: usize = NAME_MAX - STAGING_OVERHEAD;

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Directory in which named segments live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNamespace {
    root: PathBuf,
}

impl Default for ShmNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_DIR)
    }
}

impl ShmNamespace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a segment name to its backing path.
    pub fn path_of(&self, name: &str) -> io::Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Remove a name left behind by a creator that never cleaned up.
    ///
    /// Returns `Ok(false)` if there was nothing to remove.
    pub fn remove(&self, name: &str) -> io::Result<bool> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(name, path = %path.display(), "removed stale segment");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Checks that `name` is usable as a single path component and as a POSIX
/// IPC name once prefixed with `/`.
pub fn validate_name(name: &str) -> io::Result<()> {
    let reason = if name.is_empty() {
        "name must not be empty"
    } else if name.len() > MAX_NAME_LEN {
        "name is too long"
    } else if name.contains('/') {
        "name must not contain '/'"
    } else if name.contains('\0') {
        "name must not contain NUL"
    } else if name == "." || name == ".." {
        "name must not be a relative path component"
    } else {
        return Ok(());
    };
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid segment name '{name}': {reason}"),
    ))
}

/// Backs every page of `file` up front. A sparse tmpfs file would otherwise
/// map fine and raise SIGBUS on the first touch of a page the namespace has
/// no room for.
#[cfg(target_os = "linux")]
fn reserve(file: &File, len: usize) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let len = libc::off_t::try_from(len).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
    loop {
        // SAFETY: the descriptor is open for writing for the whole call
        match unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) } {
            0 => return Ok(()),
            libc::EINTR => continue,
            err => return Err(io::Error::from_raw_os_error(err)),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn reserve(_file: &File, _len: usize) -> io::Result<()> {
    Ok(())
}

/// Cleanup behaviour of a mapping, chosen at compile time.
pub trait Lifecycle {
    /// Whether dropping the mapping also removes the name.
    const UNLINK_ON_DROP: bool;
}

/// The process that created the segment. Unlinks the name on drop.
pub struct Owned;

impl Lifecycle for Owned {
    const UNLINK_ON_DROP: bool = true;
}

/// A process that opened someone else's segment. Only unmaps on drop.
pub struct Attached;

impl Lifecycle for Attached {
    const UNLINK_ON_DROP: bool = false;
}

pub struct MmapSegment<L: Lifecycle> {
    _file: File,
    mmap: MmapMut,
    base: *mut u8,
    name: String,
    path: PathBuf,
    _lifecycle: PhantomData<L>,
}

// SAFETY: the mapping is plain shared memory; all cross-thread and
// cross-process access goes through the atomics of the layouts placed in it.
unsafe impl<L: Lifecycle> Send for MmapSegment<L> {}
unsafe impl<L: Lifecycle> Sync for MmapSegment<L> {}

/// Removes the staging file unless the segment was published.
struct Staging {
    path: PathBuf,
}

impl Drop for Staging {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl MmapSegment<Owned> {
    /// Create a new segment of `size_bytes`, run `init` over its bytes and
    /// publish it under `name`.
    ///
    /// Fails with `AlreadyExists` if the name is taken.
    pub fn create<F>(ns: &ShmNamespace, name: &str, size_bytes: usize, init: F) -> io::Result<Self>
    where
        F: FnOnce(&mut [u8]),
    {
        let path = ns.path_of(name)?;
        if size_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size must be non-zero",
            ));
        }

        let staging = Staging {
            path: ns.root.join(format!(
                ".{name}.{}.{}.staging",
                std::process::id(),
                STAGE_SEQ.fetch_add(1, Ordering::Relaxed)
            )),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&staging.path)?;
        file.set_len(size_bytes as u64)?;
        reserve(&file, size_bytes)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        init(&mut mmap[..]);

        // No-clobber publish: fails if another creator won the name.
        fs::hard_link(&staging.path, &path)?;
        drop(staging);

        let base = mmap.as_mut_ptr();
        tracing::debug!(name, bytes = size_bytes, path = %path.display(), "segment created");
        Ok(Self {
            _file: file,
            mmap,
            base,
            name: name.to_string(),
            path,
            _lifecycle: PhantomData,
        })
    }
}

impl MmapSegment<Attached> {
    /// Map an existing segment read-write.
    pub fn attach(ns: &ShmNamespace, name: &str) -> io::Result<Self> {
        let path = ns.path_of(name)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        tracing::debug!(name, bytes = mmap.len(), "segment attached");
        Ok(Self {
            _file: file,
            mmap,
            base,
            name: name.to_string(),
            path,
            _lifecycle: PhantomData,
        })
    }
}

impl<L: Lifecycle> MmapSegment<L> {
    /// Return raw pointer to start of the mapped segment
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        L::UNLINK_ON_DROP
    }
}

impl<L: Lifecycle> Drop for MmapSegment<L> {
    fn drop(&mut self) {
        if L::UNLINK_ON_DROP {
            match fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(name = %self.name, "segment unlinked"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(name = %self.name, error = %e, "failed to unlink segment"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> (tempfile::TempDir, ShmNamespace) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ns = ShmNamespace::new(dir.path());
        (dir, ns)
    }

    #[test]
    fn attacher_sees_initialised_bytes() {
        let (_dir, ns) = ns();
        let owner = MmapSegment::<Owned>::create(&ns, "seg", 64, |b| b[..4].copy_from_slice(b"ferr"))
            .expect("create");
        let peer = MmapSegment::<Attached>::attach(&ns, "seg").expect("attach");

        assert_eq!(peer.len(), 64);
        let head = unsafe { std::slice::from_raw_parts(peer.base(), 4) };
        assert_eq!(head, b"ferr");

        unsafe { *owner.base().add(8) = 7 };
        assert_eq!(unsafe { *peer.base().add(8) }, 7);
    }

    #[test]
    fn second_creator_collides() {
        let (_dir, ns) = ns();
        let _owner = MmapSegment::<Owned>::create(&ns, "seg", 64, |_| {}).expect("create");
        let err = MmapSegment::<Owned>::create(&ns, "seg", 64, |_| {}).err().expect("collision");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn attach_missing_is_not_found() {
        let (_dir, ns) = ns();
        let err = MmapSegment::<Attached>::attach(&ns, "missing").err().expect("missing");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn only_owner_unlinks() {
        let (_dir, ns) = ns();
        let owner = MmapSegment::<Owned>::create(&ns, "seg", 64, |_| {}).expect("create");
        let peer = MmapSegment::<Attached>::attach(&ns, "seg").expect("attach");

        drop(peer);
        assert!(ns.exists("seg"));
        drop(owner);
        assert!(!ns.exists("seg"));
    }

    #[test]
    fn no_staging_files_left_behind() {
        let (dir, ns) = ns();
        let _owner = MmapSegment::<Owned>::create(&ns, "seg", 128, |_| {}).expect("create");
        let _ = MmapSegment::<Owned>::create(&ns, "seg", 128, |_| {});

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["seg".to_string()]);
    }

    #[test]
    fn rejects_bad_names() {
        for bad in ["", "a/b", "..", "x\0y"] {
            assert_eq!(
                validate_name(bad).unwrap_err().kind(),
                io::ErrorKind::InvalidInput,
                "{bad:?}"
            );
        }
        assert!(validate_name(&"n".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name("ferry_pri_2_sec").is_ok());
    }

    #[test]
    fn longest_name_still_stages() {
        let (_dir, ns) = ns();
        let longest = "n".repeat(MAX_NAME_LEN);
        let seg = MmapSegment::<Owned>::create(&ns, &longest, 64, |_| {}).expect("create");
        assert_eq!(seg.name(), longest);

        let err = MmapSegment::<Owned>::create(&ns, &"n".repeat(MAX_NAME_LEN + 1), 64, |_| {})
            .err()
            .expect("too long");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn remove_reports_whether_anything_was_there() {
        let (_dir, ns) = ns();
        let owner = MmapSegment::<Owned>::create(&ns, "seg", 64, |_| {}).expect("create");
        std::mem::forget(owner);
        assert!(ns.remove("seg").unwrap());
        assert!(!ns.remove("seg").unwrap());
    }
}
