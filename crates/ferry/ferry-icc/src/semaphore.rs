//! Named POSIX counting semaphores.
//!
//! Thin wrapper around `sem_open` & co. The creating side owns the name and
//! unlinks it on drop; openers only close their descriptor.

use crate::error::{IccError, Result};
use std::ffi::CString;
use std::io;
use std::time::Duration;

pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
}

// SAFETY: sem_wait/sem_post/sem_close are thread-safe on a valid sem_t
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() < 2 {
        return Err(IccError::InvalidName {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "semaphore names are '/' plus one component"),
        });
    }
    CString::new(name).map_err(|e| IccError::InvalidName {
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

impl NamedSemaphore {
    /// Creates `name` with `initial` permits.
    ///
    /// Fails with `AlreadyExists` if the name is taken, including by a stale
    /// semaphore of a crashed run; [`unlink`](Self::unlink) removes those.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let cname = c_name(name)?;
        // SAFETY: variadic args are mode and value, promoted as C expects
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Self::open_error(name, io::Error::last_os_error()));
        }
        tracing::debug!(name, initial, "semaphore created");
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Opens a semaphore someone else created.
    pub fn open(name: &str) -> Result<Self> {
        let cname = c_name(name)?;
        // SAFETY: cname is a valid C string
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(Self::open_error(name, io::Error::last_os_error()));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: false,
        })
    }

    fn open_error(name: &str, err: io::Error) -> IccError {
        match err.kind() {
            io::ErrorKind::NotFound => IccError::NotFound { name: name.to_string() },
            io::ErrorKind::AlreadyExists => IccError::AlreadyExists { name: name.to_string() },
            _ => IccError::SyncPrimitive {
                op: "sem_open",
                name: name.to_string(),
                source: err,
            },
        }
    }

    fn failure(&self, op: &'static str, source: io::Error) -> IccError {
        IccError::SyncPrimitive {
            op,
            name: self.name.clone(),
            source,
        }
    }

    /// Blocks until a permit is available. Signal interruptions are retried.
    pub fn wait(&self) -> Result<()> {
        loop {
            // SAFETY: sem is valid until drop
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(self.failure("sem_wait", err));
            }
        }
    }

    /// Takes a permit if one is available right now.
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            // SAFETY: sem is valid until drop
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(self.failure("sem_trywait", err)),
            }
        }
    }

    /// Waits at most `timeout` for a permit. `Ok(false)` on timeout.
    #[cfg(target_os = "linux")]
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: now is a valid out pointer
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let deadline = libc::timespec {
            tv_sec: now
                .tv_sec
                .saturating_add(timeout.as_secs().min(i32::MAX as u64) as libc::time_t)
                .saturating_add((nanos / 1_000_000_000) as libc::time_t),
            tv_nsec: (nanos % 1_000_000_000) as _,
        };
        loop {
            // SAFETY: sem is valid until drop, deadline is a valid timespec
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(self.failure("sem_timedwait", err)),
            }
        }
    }

    /// Waits at most `timeout` for a permit. `Ok(false)` on timeout.
    #[cfg(not(target_os = "linux"))]
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    pub fn post(&self) -> Result<()> {
        // SAFETY: sem is valid until drop
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(self.failure("sem_post", io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Removes a semaphore name left behind by a process that died without
    /// cleaning up. Returns whether anything was removed.
    pub fn unlink(name: &str) -> Result<bool> {
        let cname = c_name(name)?;
        // SAFETY: cname is a valid C string
        if unsafe { libc::sem_unlink(cname.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            return Ok(false);
        }
        Err(IccError::SyncPrimitive {
            op: "sem_unlink",
            name: name.to_string(),
            source: err,
        })
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: sem came from a successful sem_open and is closed once
        unsafe {
            libc::sem_close(self.sem);
        }
        if self.owner {
            if let Err(e) = Self::unlink(&self.name) {
                tracing::warn!(name = %self.name, error = %e, "semaphore unlink failed");
            }
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}
