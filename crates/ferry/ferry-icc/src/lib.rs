mod burst;
mod channel;
mod error;
mod pool;
mod ring;
mod semaphore;
mod shm_layout;

pub use burst::Ring;
pub use channel::{ReadTurn, SlotChannel, WriteTurn, free_semaphore_name, ready_semaphore_name};
pub use error::{IccError, Result};
pub use pool::{Handle, Pool, PoolConfig};
pub use ring::{RingConfig, SyncMode};
pub use semaphore::NamedSemaphore;

pub use ferry_mmap::{Attached, Lifecycle, Owned, ShmNamespace};
