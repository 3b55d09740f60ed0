//! Core workflow engine for bindery.
//!
//! Hosts the run repository trait, the workflow definition graph, the
//! checkpoint store, and the execution engine. Everything here is
//! storage-agnostic: the infrastructure layer (bindery-infra) supplies
//! the SQLite-backed [`repository::RunRepository`] implementation.

pub mod repository;
pub mod workflow;
