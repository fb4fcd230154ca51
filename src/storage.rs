//! # Storage Base
//!
//! [`Storage`] presents the fixed key/value face of the game-state database:
//! the current block hash, the current game-state tag, and the per-block undo
//! blobs. It owns the writer connection, brackets each block's mutations in a
//! named savepoint, hands out read snapshots, and gates closing on
//! outstanding snapshots.
//!
//! ## Writer Discipline
//!
//! The writer side is strictly single-threaded: the host serializes all calls
//! to `Storage` for the duration of a block step. All mutating entry points
//! take `&mut self`; snapshot handles own their separate connections and can
//! be read from other threads concurrently.
//!
//! ## Transaction Bracket
//!
//! The host wraps every block step:
//!
//! ```text
//! begin_transaction()
//!     process forward / backward (driver)
//!     set_current_game_state(...)
//!     add_undo_data(...) / release_undo_data(...)
//! commit_transaction()          (or rollback_transaction())
//! ```
//!
//! The bracket is a named savepoint rather than `BEGIN`/`COMMIT` so the host
//! can layer its own batching on top (see
//! [`TransactionBatcher`](crate::TransactionBatcher)). Nested begins are a
//! caller bug and panic.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::db::{DbHandle, SnapshotGate};
use crate::error::{Error, Result};
use crate::schema;
use crate::types::{BlockHash, StateTag, UndoData};

/// Filename sentinel for a temporary in-memory database.
pub const MEMORY_DB: &str = ":memory:";

/// Savepoint bracketing one block's worth of mutations.
const SAVEPOINT_BLOCK: &str = "chainstate_block";

/// Nested savepoint around the two-row current-state replacement.
const SAVEPOINT_SET_CURRENT: &str = "chainstate_setcurrent";

// =============================================================================
// Storage
// =============================================================================

/// The transactional key/value face over the writer connection.
///
/// Construct with [`Storage::new`], then call a setup method
/// ([`initialise`](Self::initialise) directly, or let
/// [`GameDb`](crate::GameDb) drive it so the game schema is installed too).
pub struct Storage {
    filename: PathBuf,
    db: Option<DbHandle>,
    gate: Arc<SnapshotGate>,
    started_transaction: bool,
}

impl Storage {
    /// Creates a storage for the given database file (not yet opened).
    ///
    /// Use [`MEMORY_DB`] for a temporary in-memory database; such a database
    /// cannot serve snapshots and is simply dropped by [`clear`](Self::clear).
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            db: None,
            gate: Arc::new(SnapshotGate::new()),
            started_transaction: false,
        }
    }

    /// Opens the writer connection and installs the base schema.
    ///
    /// Idempotent: a second call on an already-open storage is a no-op.
    pub fn initialise(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.open_with(|_| Ok(()))
    }

    /// Opens the writer connection, installs the base schema and then runs
    /// `setup` (the glue layer's game schema and application schema).
    ///
    /// # Panics
    ///
    /// Panics if the database is already open.
    pub(crate) fn open_with(
        &mut self,
        setup: impl FnOnce(&DbHandle) -> Result<()>,
    ) -> Result<()> {
        assert!(self.db.is_none(), "database is already open");

        let db = DbHandle::open(
            &self.filename,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        schema::setup_base_schema(db.conn())?;
        setup(&db)?;

        self.db = Some(db);
        Ok(())
    }

    /// Whether the writer connection is currently open.
    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// The writer handle.
    ///
    /// # Panics
    ///
    /// Panics if the database is not open.
    pub fn handle(&self) -> &DbHandle {
        self.db.as_ref().expect("database is not open")
    }

    /// Closes the writer connection, waiting until all outstanding snapshots
    /// have been released first.
    ///
    /// # Panics
    ///
    /// Panics if the database is not open.
    pub fn close_database(&mut self) {
        assert!(self.db.is_some(), "database is not open");
        if self.started_transaction {
            debug!("closing with an open transaction; the connection drop rolls it back");
            self.started_transaction = false;
        }
        self.gate.wait_until_idle();
        self.db = None;
        info!("closed game-state database");
    }

    /// Closes the database, removes the file and reopens it, running `setup`
    /// again after the base schema.
    ///
    /// In-memory databases are simply dropped and recreated.
    pub(crate) fn clear_with(
        &mut self,
        setup: impl FnOnce(&DbHandle) -> Result<()>,
    ) -> Result<()> {
        self.close_database();

        if self.filename.to_str() == Some(MEMORY_DB) {
            info!("in-memory database is temporary, nothing to remove");
        } else {
            info!("removing file to clear database: {}", self.filename.display());
            std::fs::remove_file(&self.filename)?;
        }

        self.open_with(setup)
    }

    /// Closes the database, removes the file and reopens it with the base
    /// schema only.
    pub fn clear(&mut self) -> Result<()> {
        self.clear_with(|_| Ok(()))
    }

    // =========================================================================
    // Current State Rows
    // =========================================================================

    /// Returns the currently stored block hash, if any.
    pub fn get_current_block_hash(&self) -> Result<Option<BlockHash>> {
        current_block_hash(self.handle())
    }

    /// Returns the currently stored game-state tag.
    ///
    /// The caller guarantees a state is present; an absent row is an error.
    pub fn get_current_game_state(&self) -> Result<StateTag> {
        let blob: Option<Vec<u8>> = self
            .handle()
            .prepare_ro("SELECT `value` FROM `xayagame_current` WHERE `key` = 'gamestate'")?
            .query_row([], |row| row.get(0))
            .optional()?;
        match blob {
            Some(blob) => StateTag::from_wire(&blob),
            None => Err(Error::MissingGameState),
        }
    }

    /// Atomically replaces the current block hash and game-state tag.
    ///
    /// Runs inside its own nested savepoint so the two-row replacement is
    /// atomic independently of the outer bracket.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn set_current_game_state(&mut self, hash: &BlockHash, state: &StateTag) -> Result<()> {
        assert!(
            self.started_transaction,
            "set_current_game_state requires an open transaction"
        );
        let db = self.handle();

        db.prepare(&format!("SAVEPOINT `{SAVEPOINT_SET_CURRENT}`"))?
            .execute([])?;
        db.prepare(
            "INSERT OR REPLACE INTO `xayagame_current` (`key`, `value`)
             VALUES ('blockhash', ?1)",
        )?
        .execute(params![hash.as_bytes().as_slice()])?;
        db.prepare(
            "INSERT OR REPLACE INTO `xayagame_current` (`key`, `value`)
             VALUES ('gamestate', ?1)",
        )?
        .execute(params![state.to_wire().into_bytes()])?;
        db.prepare(&format!("RELEASE `{SAVEPOINT_SET_CURRENT}`"))?
            .execute([])?;

        Ok(())
    }

    // =========================================================================
    // Undo Rows
    // =========================================================================

    /// Stores (or replaces) the undo blob for the given block.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn add_undo_data(&mut self, hash: &BlockHash, height: u64, data: &UndoData) -> Result<()> {
        assert!(
            self.started_transaction,
            "add_undo_data requires an open transaction"
        );
        self.handle()
            .prepare(
                "INSERT OR REPLACE INTO `xayagame_undo` (`hash`, `data`, `height`)
                 VALUES (?1, ?2, ?3)",
            )?
            .execute(params![
                hash.as_bytes().as_slice(),
                data.as_bytes(),
                height as i64
            ])?;
        Ok(())
    }

    /// Returns the undo blob for the given block, if one is stored.
    pub fn get_undo_data(&self, hash: &BlockHash) -> Result<Option<UndoData>> {
        let blob: Option<Vec<u8>> = self
            .handle()
            .prepare_ro("SELECT `data` FROM `xayagame_undo` WHERE `hash` = ?1")?
            .query_row(params![hash.as_bytes().as_slice()], |row| row.get(0))
            .optional()?;
        Ok(blob.map(UndoData::new))
    }

    /// Deletes the undo blob for the given block.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn release_undo_data(&mut self, hash: &BlockHash) -> Result<()> {
        assert!(
            self.started_transaction,
            "release_undo_data requires an open transaction"
        );
        self.handle()
            .prepare("DELETE FROM `xayagame_undo` WHERE `hash` = ?1")?
            .execute(params![hash.as_bytes().as_slice()])?;
        Ok(())
    }

    /// Deletes all undo blobs up to and including the given block height.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn prune_undo_data(&mut self, height: u64) -> Result<()> {
        assert!(
            self.started_transaction,
            "prune_undo_data requires an open transaction"
        );
        self.handle()
            .prepare("DELETE FROM `xayagame_undo` WHERE `height` <= ?1")?
            .execute(params![height as i64])?;
        Ok(())
    }

    // =========================================================================
    // Transaction Bracket
    // =========================================================================

    /// Opens the savepoint bracketing one block's mutations.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already open.
    pub fn begin_transaction(&mut self) -> Result<()> {
        assert!(!self.started_transaction, "transaction already started");
        self.handle()
            .prepare(&format!("SAVEPOINT `{SAVEPOINT_BLOCK}`"))?
            .execute([])?;
        self.started_transaction = true;
        Ok(())
    }

    /// Releases the block savepoint, making its mutations durable.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn commit_transaction(&mut self) -> Result<()> {
        assert!(self.started_transaction, "no transaction to commit");
        self.handle()
            .prepare(&format!("RELEASE `{SAVEPOINT_BLOCK}`"))?
            .execute([])?;
        self.started_transaction = false;
        Ok(())
    }

    /// Rolls back and discards the block savepoint.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn rollback_transaction(&mut self) -> Result<()> {
        assert!(self.started_transaction, "no transaction to roll back");
        let db = self.handle();
        // ROLLBACK TO undoes the changes but keeps the savepoint on the
        // stack; the RELEASE afterwards actually ends the bracket.
        db.prepare(&format!("ROLLBACK TO `{SAVEPOINT_BLOCK}`"))?
            .execute([])?;
        db.prepare(&format!("RELEASE `{SAVEPOINT_BLOCK}`"))?
            .execute([])?;
        self.started_transaction = false;
        Ok(())
    }

    /// Whether a block transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.started_transaction
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Opens a read-only point-in-time snapshot of the database.
    ///
    /// Returns `None` when the database is not in WAL mode (in particular for
    /// in-memory databases). The snapshot sees all state committed before the
    /// call and none committed after; it keeps
    /// [`close_database`](Self::close_database) blocked until dropped.
    pub fn get_snapshot(&self) -> Result<Option<DbHandle>> {
        let db = self.handle();
        if !db.is_wal() {
            warn!("snapshot is not possible for non-WAL database");
            return Ok(None);
        }

        self.gate.acquire();
        match DbHandle::open_snapshot(&self.filename, Arc::clone(&self.gate)) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                // The handle never took ownership of the reference.
                self.gate.release();
                Err(err)
            }
        }
    }

    /// Number of currently outstanding snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.gate.active()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.db.is_some() {
            self.close_database();
        }
    }
}

/// Reads the current block hash through an arbitrary handle (writer or
/// snapshot).
pub(crate) fn current_block_hash(db: &DbHandle) -> Result<Option<BlockHash>> {
    let blob: Option<Vec<u8>> = db
        .prepare_ro("SELECT `value` FROM `xayagame_current` WHERE `key` = 'blockhash'")?
        .query_row([], |row| row.get(0))
        .optional()?;
    match blob {
        Some(blob) => Ok(Some(BlockHash::from_blob(&blob)?)),
        None => Ok(None),
    }
}

// =============================================================================
// Tests
// =============================================================================
