//! Engine core: the database handle, transactions, buckets, and the
//! schema/vacuum machinery tying the pager and tree together.

mod db;
mod options;
mod schema;
mod tx;

pub use db::{Db, Stats};
pub use options::{LockMode, Options};
pub use tx::{Bucket, Cursor, Tx};
