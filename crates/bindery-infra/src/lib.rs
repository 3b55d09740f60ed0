//! Infrastructure layer for bindery.
//!
//! SQLite implementations of the core repository traits, plus the
//! shared database pool. Nothing above this crate touches sqlx.

pub mod sqlite;
