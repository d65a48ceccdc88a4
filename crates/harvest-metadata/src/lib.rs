//! SQLite stores for Harvest collections and segments.

mod collection_store;
mod rows;
mod segment_store;
mod util;

pub use collection_store::SqliteCollectionStore;
pub use segment_store::SqliteSegmentStore;
pub use util::{create_sqlite_pool, run_migrations};

/// Embedded SQL migrations for the metadata database.
pub const MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
