use std::io;

/// Failures of the shared transports.
///
/// Backpressure is never an error: an empty pool, a full ring or an empty
/// ring are reported as `None` or as a short count.
#[derive(Debug, thiserror::Error)]
pub enum IccError {
    /// The named object does not exist (yet). Attachers retry.
    #[error("'{name}' does not exist")]
    NotFound { name: String },

    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    /// Backing memory for a pool, ring or channel could not be obtained.
    #[error("could not allocate {bytes} bytes for '{name}'")]
    ResourceExhausted {
        name: String,
        bytes: usize,
        #[source]
        source: Option<io::Error>,
    },

    #[error("invalid name '{name}'")]
    InvalidName {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The segment exists but does not hold the expected structure.
    #[error("'{name}' has an incompatible layout: {reason}")]
    InvalidLayout { name: String, reason: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("slot index {index} is outside the pool")]
    InvalidHandle { index: u32 },

    #[error("payload of {len} bytes does not fit a {slot_size} byte slot")]
    PayloadTooLarge { len: usize, slot_size: usize },

    /// A slot was released while already free, or through a stale handle.
    #[error("slot {index} released twice")]
    DoubleRelease { index: u32 },

    #[error("slot {index} accessed after release")]
    UseAfterRelease { index: u32 },

    /// A semaphore wait or post failed at the OS level. Unrecoverable.
    #[error("{op} on semaphore '{name}' failed")]
    SyncPrimitive {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O on '{name}' failed")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl IccError {
    /// Classify an I/O error raised while creating or attaching `name`.
    pub(crate) fn from_io(name: &str, bytes: usize, source: io::Error) -> Self {
        let name = name.to_string();
        match source.kind() {
            io::ErrorKind::NotFound => IccError::NotFound { name },
            io::ErrorKind::AlreadyExists => IccError::AlreadyExists { name },
            io::ErrorKind::InvalidInput => IccError::InvalidName { name, source },
            io::ErrorKind::OutOfMemory | io::ErrorKind::StorageFull => {
                IccError::ResourceExhausted {
                    name,
                    bytes,
                    source: Some(source),
                }
            }
            _ if matches!(source.raw_os_error(), Some(libc::ENOMEM | libc::ENOSPC | libc::EFBIG)) => {
                IccError::ResourceExhausted {
                    name,
                    bytes,
                    source: Some(source),
                }
            }
            _ => IccError::Io { name, source },
        }
    }

    /// True for the startup race where the creating process is not up yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IccError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, IccError>;
