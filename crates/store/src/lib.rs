//! Store implementations for Keyspan
//!
//! This crate implements the [`KeyValueStore`] contract from
//! `keyspan-core`:
//! - MemoryStore: DashMap table registry with per-table RwLock row maps
//!
//! The memory store exists for tests and for embedding: it honors every
//! part of the contract the engine depends on, including condition
//! failures that report current item state and an all-or-nothing
//! `transact_write` with a configurable item ceiling.
//!
//! [`KeyValueStore`]: keyspan_core::KeyValueStore

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;

pub use memory::MemoryStore;
