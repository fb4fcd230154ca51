//! # chainstate - Deterministic Game-State Storage
//!
//! `chainstate` is a SQLite-backed storage engine for games whose state is
//! driven by a blockchain. A host indexer feeds block events (forward or
//! rewind) into the engine; the engine keeps the authoritative game-state
//! database, records per-block undo information so any block can be rolled
//! back on a reorg, and serves consistent point-in-time read snapshots while
//! the writer advances.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Host Indexer                             │
//! │     (block feed, transaction bracket, single writer thread)     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        GameDb<L>                                │
//! │                                                                 │
//! │  ┌─────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │ state-tag   │  │  change      │  │  auto-id scope         │  │
//! │  │ checks      │  │  recorder    │  │  (named counters)      │  │
//! │  └─────────────┘  └──────────────┘  └────────────────────────┘  │
//! │                 ▲ callbacks into GameLogic ▲                    │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Storage  (current rows, undo rows, savepoint bracket)         │
//! │   DbHandle (writer connection, WAL, statement cache)            │──► snapshots
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Deterministic evolution**: replaying the same blocks over the same
//!    initial state always produces the same database.
//! 2. **Exactly-once undo**: every forward step yields a changeset blob that,
//!    inverted, undoes exactly that step; rewinds must be conflict-free.
//! 3. **Tag honesty**: no state-dependent operation runs unless the caller's
//!    state tag matches the stored block hash.
//! 4. **Snapshot stability**: a snapshot sees the database as of its
//!    creation, regardless of later writer commits; the writer cannot close
//!    while snapshots are outstanding.
//! 5. **Counter durability**: auto-id counters never move backwards within a
//!    forward run and are flushed exactly once per scope, inside the
//!    recorded changeset.
//!
//! ## Module Organization
//!
//! - [`error`]: the single error enum and result alias
//! - [`types`]: block hashes, state tags, blocks, undo blobs
//! - `schema`: DDL for the engine's own tables
//! - [`db`]: connection ownership, statement cache, snapshots
//! - [`storage`]: the transactional key/value face and snapshot hand-out
//! - [`recorder`]: undo capture and rewind via SQLite sessions
//! - [`ids`]: scoped persistent id counters
//! - [`game`]: the [`GameLogic`] callback trait and the block drivers
//! - [`txbatch`]: transaction batching for catch-up phases

pub mod db;
pub mod error;
pub mod game;
pub mod ids;
pub mod recorder;
mod schema;
pub mod storage;
pub mod txbatch;
pub mod types;

pub use db::DbHandle;
pub use error::{Error, Result};
pub use game::{GameDb, GameLogic};
pub use ids::{AutoId, AutoIdScope, StateContext, EMPTY_ID};
pub use recorder::InvertedChangeset;
pub use storage::{Storage, MEMORY_DB};
pub use txbatch::TransactionBatcher;
pub use types::{Block, BlockHash, StateTag, UndoData};
