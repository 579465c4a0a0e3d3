//! CalicoDB: an embeddable, single-file, transactional key-value
//! store.
//!
//! A database is an ordered mapping from byte keys to byte values,
//! organized into named buckets (which nest). Readers run against
//! stable snapshots; one writer at a time appends committed pages to a
//! write-ahead log that checkpoints back into the database file.
//!
//! ```
//! use calicodb::{Db, MemEnv, Options};
//! use std::sync::Arc;
//!
//! let env = Arc::new(MemEnv::new());
//! let db = Db::open(env, "app.db", &Options::default()).unwrap();
//! let mut tx = db.begin(true).unwrap();
//! let accounts = tx.create_bucket(b"accounts").unwrap();
//! tx.put(accounts, b"alice", b"100").unwrap();
//! tx.commit().unwrap();
//!
//! let tx = db.begin(false).unwrap();
//! let accounts = tx.open_bucket(b"accounts").unwrap();
//! assert_eq!(tx.get(accounts, b"alice").unwrap(), Some(b"100".to_vec()));
//! ```

pub use calico_core::{Bucket, Cursor, Db, LockMode, Options, Stats, Tx};
pub use calico_env::{Env, File, Logger, MemEnv, OpenMode};
pub use calico_error::{CalicoError, Result};
pub use calico_pager::SyncMode;
pub use calico_types::{PageId, PageSize};
pub use calico_wal::CheckpointMode;
