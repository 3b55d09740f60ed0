//! SQLite-backed persistence.

pub mod book;
pub mod pool;
pub mod run;

pub use book::SqliteBookCatalog;
pub use pool::{DatabasePool, default_data_dir, default_database_url};
pub use run::SqliteRunRepository;
