//! Transaction engine for Keyspan
//!
//! This crate orchestrates the protocol stores into a usable engine:
//! - TxCoordinator: begin/resume/commit/rollback and the request pipeline
//! - Quick path: record-free atomic writes within the native limit
//! - Batching: oversized op sets split into ordered requests
//! - Isolated reads: read-uncommitted and read-committed services
//! - Sweeper: house-keeping over abandoned and finished transactions
//!
//! The engine is the only component that reasons across stores; the
//! protocol stores in `keyspan-txn` each know one table.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod quick;
pub mod read;
pub mod sweeper;

pub use batch::chunk_ops;
pub use config::{EngineConfig, RetryConfig};
pub use coordinator::{CoordinatorStats, TxCoordinator, TxHandle};
pub use read::{CommittedReads, IsolatedReads, IsolationLevel, UncommittedReads};
pub use sweeper::{SweepAction, SweepOutcome, Sweeper, SweeperHandle};
