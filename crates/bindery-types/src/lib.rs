//! Shared domain types for bindery.
//!
//! This crate contains the core domain types used across the bindery
//! workspace: the run status state machine, the checkpoint document, the
//! cross-step context value, and the repository error kinds.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono,
//! thiserror.

pub mod checkpoint;
pub mod error;
pub mod run;
pub mod value;
