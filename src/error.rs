//! # Error Handling
//!
//! A single error enum covers every failure mode of the engine. The engine
//! distinguishes two tiers of failure:
//!
//! 1. **Unrecoverable conditions reported as [`Error`]**: SQLite failures,
//!    state-tag mismatches, changeset conflicts, missing required rows.
//!    The host has typically already committed to advancing state when these
//!    occur, so it must treat them as fatal; they are still surfaced as
//!    `Err` so the host controls how the process dies.
//! 2. **Caller bugs reported as panics**: double `begin_transaction`,
//!    committing without a transaction, preparing write statements on a
//!    read-only snapshot, nesting auto-id scopes, snapshot-count underflow.
//!    These cannot happen in a correct embedding and are asserted.
//!
//! The individual entry points document which panics apply under `# Panics`.

use thiserror::Error;

/// All errors that can occur in engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An underlying SQLite operation failed.
    ///
    /// The engine treats these as unrecoverable: a failed statement in the
    /// middle of a block step leaves no state that could be reasoned about.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem operation failed (only possible during [`clear`]).
    ///
    /// [`clear`]: crate::Storage::clear
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A block hash was not a valid 64-character hex string / 32-byte blob.
    #[error("invalid block hash: {0}")]
    InvalidBlockHash(String),

    /// A state tag was neither `"initial"` nor `"block <hash>"`.
    #[error("invalid state tag: {0}")]
    InvalidStateTag(String),

    /// A block structure was missing `block.hash`, `block.parent` or
    /// `block.height`.
    #[error("invalid block data: {0}")]
    InvalidBlock(String),

    /// The claimed state tag does not match the block hash stored in the
    /// database.
    ///
    /// Every state-dependent entry point verifies its tag first; a mismatch
    /// means the host and the database disagree about which block the state
    /// corresponds to, and no further progress is possible.
    #[error("claimed game state '{claimed}' does not match the database")]
    StateMismatch {
        /// The textual form of the tag the caller claimed.
        claimed: String,
    },

    /// `xayagame_current.gamestate` has no row although the caller
    /// guaranteed its presence.
    #[error("no current game state stored in the database")]
    MissingGameState,

    /// Stored engine rows violate an internal invariant (wrong blob size,
    /// missing singleton row, reserved sentinel value).
    #[error("database corruption: {0}")]
    Corrupt(String),

    /// Inverting a stored undo changeset failed.
    #[error("failed to invert undo changeset (sqlite error code {0})")]
    ChangesetInvert(i32),

    /// Applying an inverted changeset hit a conflict.
    ///
    /// Rewinds undo exactly the last recorded block, so a conflict means the
    /// undo blob does not correspond to the current database contents.
    #[error("conflict while applying undo changeset: {0}")]
    ChangesetConflict(String),

    /// An application callback failed.
    ///
    /// The engine propagates this unchanged; for the initial-state install
    /// the enclosing savepoint is rolled back first.
    #[error("game logic error: {0}")]
    Logic(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an application-level error for propagation through the engine.
    pub fn logic(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Logic(err.into())
    }
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
