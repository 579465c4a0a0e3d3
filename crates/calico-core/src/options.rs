//! Database open options.

use calico_pager::SyncMode;
use calico_types::PageSize;

/// File locking discipline for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Shared file lock; other connections may read and write.
    #[default]
    Normal,
    /// Exclusive file lock for the life of the connection.
    Exclusive,
}

/// Options accepted by [`crate::Db::open`].
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Create the database file when it does not exist.
    pub create_if_missing: bool,
    /// Fail if the database file already exists.
    pub error_if_exists: bool,
    /// Page size for newly created databases; existing databases keep
    /// the size they were created with.
    pub page_size: PageSize,
    /// Page cache capacity in frames.
    pub cache_size: usize,
    pub sync_mode: SyncMode,
    /// Passive-checkpoint threshold in WAL frames; 0 disables.
    pub auto_checkpoint: u32,
    pub lock_mode: LockMode,
    /// How long lock acquisition keeps retrying before surfacing
    /// `Busy`, in microseconds. 0 fails immediately.
    pub busy_timeout: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            page_size: PageSize::DEFAULT,
            cache_size: 1024,
            sync_mode: SyncMode::default(),
            auto_checkpoint: 1000,
            lock_mode: LockMode::default(),
            busy_timeout: 0,
        }
    }
}
