mod arena;
mod shm_layout;
mod shmtx;
mod store;

pub use arena::{ArenaError, ArenaUsage};
pub use shmtx::{DEFAULT_SPIN, ShmMutex};
pub use store::{
    ConfigStore, InstallReport, Release, StoreError, StoreOptions, StoreStats, Superseded,
};
