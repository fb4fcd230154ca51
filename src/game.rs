//! # Game Glue and Block Drivers
//!
//! [`GameDb`] ties a concrete game to the storage layer. It installs the
//! game-glue schema on top of the base tables, verifies state tags against
//! the database before every state-dependent operation, performs the one-shot
//! initial-state install, and drives forward and backward block steps:
//!
//! ```text
//! host                          GameDb                        game logic
//! ────────────────────────────────────────────────────────────────────────
//! begin_transaction()
//! process_forward(tag, block) ─► verify tag
//!                                start change recorder
//!                                open auto-id scope ────────► update_state(ctx, block)
//!                                flush auto-ids
//!                                extract undo blob
//!                   (new tag, undo) ◄─
//! set_current_game_state(hash, new tag)
//! add_undo_data(hash, height, undo)
//! commit_transaction()
//! ```
//!
//! A backward step verifies the tag, inverts the stored undo blob and applies
//! it; auto-id counters need no special handling there because their rows are
//! part of the recorded changeset.
//!
//! ## State-Tag Verification
//!
//! Every state-dependent entry point receives the tag the host believes the
//! database holds. For a `block` tag the stored block hash must match the
//! tag's hash; for the `initial` tag it must match the genesis hash declared
//! by the game logic. On a match the database must also be marked as
//! initialised; a mismatch is [`Error::StateMismatch`].

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rusqlite::ffi;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::db::DbHandle;
use crate::error::{Error, Result};
use crate::ids::{AutoIdScope, StateContext};
use crate::recorder::{ChangeRecorder, InvertedChangeset};
use crate::schema;
use crate::storage::{current_block_hash, Storage};
use crate::types::{Block, BlockHash, StateTag, UndoData};

/// Savepoint around the one-shot initial-state install.
const SAVEPOINT_STATE_INIT: &str = "chainstate_stateinit";

// =============================================================================
// GameLogic
// =============================================================================

/// The callback interface a game implements on top of the engine.
///
/// All state lives in the database; the callbacks run SQL through the handle
/// or context they are given and must be deterministic functions of the
/// database state and the block payload.
pub trait GameLogic {
    /// Creates the game's own tables. Must be idempotent; runs on every open.
    fn setup_schema(&mut self, db: &DbHandle) -> Result<()>;

    /// The block height and hash at which the game starts.
    fn initial_state_block(&self) -> Result<(u64, BlockHash)>;

    /// Populates the initial game state. Invoked at most once per database.
    fn initialise_state(&mut self, ctx: &mut StateContext<'_>) -> Result<()>;

    /// Advances the game state by one block.
    fn update_state(&mut self, ctx: &mut StateContext<'_>, block: &Block) -> Result<()>;

    /// Renders the current state as JSON (read-only).
    fn state_as_json(&self, db: &DbHandle) -> Result<JsonValue>;
}

// =============================================================================
// GameDb
// =============================================================================

/// The game-state database: storage base plus game glue plus the
/// forward/backward drivers.
pub struct GameDb<L: GameLogic> {
    storage: Storage,
    logic: L,
    /// Single per-database auto-id scope slot (at most one scope at a time).
    ids_gate: Arc<AtomicBool>,
    unordered_selects: bool,
}

impl<L: GameLogic> GameDb<L> {
    /// Creates the database wrapper for the given game and file (not yet
    /// opened).
    pub fn new(logic: L, filename: impl Into<PathBuf>) -> Self {
        Self {
            storage: Storage::new(filename),
            logic,
            ids_gate: Arc::new(AtomicBool::new(false)),
            unordered_selects: false,
        }
    }

    /// Makes SQLite return unordered `SELECT` results in reverse order.
    ///
    /// Test aid: game logic must not depend on unspecified row ordering, and
    /// running a test suite with this enabled surfaces such bugs.
    ///
    /// # Panics
    ///
    /// Panics if the database has already been opened.
    pub fn set_unordered_selects(&mut self, value: bool) {
        assert!(
            !self.storage.is_open(),
            "unordered selects must be configured before the database is opened"
        );
        self.unordered_selects = value;
    }

    /// Opens the database file and installs the full schema: base tables,
    /// game-glue tables, then the game's own `setup_schema`.
    ///
    /// Idempotent: a second call on an already-open database is a no-op.
    pub fn initialise(&mut self) -> Result<()> {
        if self.storage.is_open() {
            return Ok(());
        }
        let logic = &mut self.logic;
        let unordered = self.unordered_selects;
        self.storage
            .open_with(|db| Self::install_game_schema(db, logic, unordered))
    }

    /// Closes the database, deletes the file and reopens with the full
    /// schema; the game state is uninitialised afterwards.
    pub fn clear(&mut self) -> Result<()> {
        let logic = &mut self.logic;
        let unordered = self.unordered_selects;
        self.storage
            .clear_with(|db| Self::install_game_schema(db, logic, unordered))
    }

    fn install_game_schema(db: &DbHandle, logic: &mut L, unordered: bool) -> Result<()> {
        schema::setup_game_schema(db.conn())?;

        // Undo capture records the session of the "main" database only, so
        // the whole game state must live there: forbid attached databases.
        //
        // Safety: the raw handle is only passed to sqlite3_limit and not
        // retained.
        unsafe {
            ffi::sqlite3_limit(db.conn().handle(), ffi::SQLITE_LIMIT_ATTACHED, 0);
        }
        info!("set allowed number of attached databases to zero");

        if unordered {
            db.conn()
                .execute_batch("PRAGMA `reverse_unordered_selects` = 1")?;
            info!("enabled reverse unordered selects");
        }

        logic.setup_schema(db)
    }

    // =========================================================================
    // State-Tag Verification
    // =========================================================================

    fn is_initialised(db: &DbHandle) -> Result<bool> {
        use rusqlite::OptionalExtension;

        let flag: Option<i64> = db
            .prepare_ro("SELECT `gamestate_initialised` FROM `xayagame_gamevars`")?
            .query_row([], |row| row.get(0))
            .optional()?;
        match flag {
            Some(value) => Ok(value != 0),
            None => Err(Error::Corrupt(
                "xayagame_gamevars singleton row is missing".to_string(),
            )),
        }
    }

    /// Checks whether the database contents (seen through `db`, which may be
    /// a snapshot) correspond to the claimed state tag.
    fn check_state(&self, db: &DbHandle, claimed: &StateTag) -> Result<bool> {
        debug!("checking whether database matches game state: {claimed}");

        // State-dependent entry points are only legal once a current state
        // exists in the storage.
        let Some(stored) = current_block_hash(db)? else {
            debug!("no current block hash in the database");
            return Ok(false);
        };

        let expected = match claimed {
            StateTag::Block(hash) => *hash,
            StateTag::Initial => {
                let (_, genesis) = self.logic.initial_state_block()?;
                genesis
            }
        };
        if stored != expected {
            debug!(
                "current best block in the database ({stored}) does not match \
                 claimed game state"
            );
            return Ok(false);
        }

        if !Self::is_initialised(db)? {
            return Err(Error::Corrupt(
                "current block hash is set but the game state is not initialised".to_string(),
            ));
        }
        Ok(true)
    }

    /// Verifies that the claimed state tag matches the database; any mismatch
    /// is an error and the database is left untouched.
    pub fn ensure_current_state(&self, claimed: &StateTag) -> Result<()> {
        if self.check_state(self.storage.handle(), claimed)? {
            Ok(())
        } else {
            Err(Error::StateMismatch {
                claimed: claimed.to_string(),
            })
        }
    }

    // =========================================================================
    // Initial State
    // =========================================================================

    /// Installs the game's initial state if that has not happened yet.
    ///
    /// The install runs inside its own savepoint together with an auto-id
    /// scope; on failure the savepoint is rolled back, leaving the database
    /// schema-complete but uninitialised, and the error is propagated.
    fn initialise_game(&mut self) -> Result<()> {
        let logic = &mut self.logic;
        let db = self.storage.handle();

        if Self::is_initialised(db)? {
            debug!("game state is already initialised in the database");
            return Ok(());
        }

        info!("setting initial state in the database");
        db.prepare(&format!("SAVEPOINT `{SAVEPOINT_STATE_INIT}`"))?
            .execute([])?;

        let mut ids = AutoIdScope::new(Arc::clone(&self.ids_gate));
        let installed = (|| -> Result<()> {
            {
                let mut ctx = StateContext::new(db, &mut ids);
                logic.initialise_state(&mut ctx)?;
            }
            ids.flush(db)?;
            db.prepare("UPDATE `xayagame_gamevars` SET `gamestate_initialised` = 1")?
                .execute([])?;
            Ok(())
        })();

        match installed {
            Ok(()) => {
                db.prepare(&format!("RELEASE `{SAVEPOINT_STATE_INIT}`"))?
                    .execute([])?;
                info!("initialised the database state successfully");
                Ok(())
            }
            Err(err) => {
                ids.abandon();
                error!("initialising state failed, rolling back the change");
                db.prepare(&format!("ROLLBACK TO `{SAVEPOINT_STATE_INIT}`"))?
                    .execute([])?;
                db.prepare(&format!("RELEASE `{SAVEPOINT_STATE_INIT}`"))?
                    .execute([])?;
                Err(err)
            }
        }
    }

    /// Returns the genesis height and hash declared by the game and makes
    /// sure the initial state is installed, yielding the `initial` tag.
    pub fn initial_state(&mut self) -> Result<(u64, BlockHash, StateTag)> {
        let (height, hash) = self.logic.initial_state_block()?;
        self.initialise_game()?;
        Ok((height, hash, StateTag::Initial))
    }

    // =========================================================================
    // Forward / Backward Drivers
    // =========================================================================

    /// Advances the state by one block.
    ///
    /// Verifies `old_state`, records all mutations made by the game logic,
    /// flushes minted auto-ids, and returns the new state tag together with
    /// the undo blob for the block. The host brackets the call in
    /// `begin_transaction` / `commit_transaction` and persists the results
    /// via `set_current_game_state` and `add_undo_data`.
    pub fn process_forward(
        &mut self,
        old_state: &StateTag,
        block: &Block,
    ) -> Result<(StateTag, UndoData)> {
        self.ensure_current_state(old_state)?;

        let logic = &mut self.logic;
        let db = self.storage.handle();

        let mut recorder = ChangeRecorder::new(db)?;
        let mut ids = AutoIdScope::new(Arc::clone(&self.ids_gate));

        let updated = {
            let mut ctx = StateContext::new(db, &mut ids);
            logic.update_state(&mut ctx, block)
        };
        match updated {
            // Flush before extracting, so counter updates are part of the
            // undo blob and get rolled back on rewind.
            Ok(()) => ids.flush(db)?,
            Err(err) => {
                ids.abandon();
                return Err(err);
            }
        }
        drop(ids);

        let undo = recorder.extract_changeset()?;
        Ok((StateTag::Block(block.hash()), undo))
    }

    /// Rewinds the state by one block using the stored undo blob.
    ///
    /// Verifies `new_state` (the state being rewound *from*), applies the
    /// inverse of the forward changeset and returns the parent block's tag.
    /// The host brackets the call in a transaction just like a forward step.
    pub fn process_backward(
        &mut self,
        new_state: &StateTag,
        block: &Block,
        undo: &UndoData,
    ) -> Result<StateTag> {
        self.ensure_current_state(new_state)?;

        let inverted = InvertedChangeset::new(undo)?;
        inverted.apply(self.storage.handle())?;

        Ok(StateTag::Block(block.parent()))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Renders the game state for the claimed tag as JSON.
    pub fn game_state_to_json(&self, state: &StateTag) -> Result<JsonValue> {
        self.ensure_current_state(state)?;
        self.logic.state_as_json(self.storage.handle())
    }

    /// Runs a read-only callback against the state claimed by `state`.
    ///
    /// Preferably the callback runs on a fresh snapshot whose contents match
    /// the tag, so it cannot block or be blocked by the writer. When no
    /// matching snapshot is available (non-WAL database, or the snapshot
    /// already diverged from the claimed tag), the writer connection is
    /// verified and used instead.
    pub fn custom_state_data<T>(
        &self,
        state: &StateTag,
        cb: impl FnOnce(&DbHandle) -> Result<T>,
    ) -> Result<T> {
        if let Some(snapshot) = self.storage.get_snapshot()? {
            if self.check_state(&snapshot, state)? {
                return cb(&snapshot);
            }
        }

        warn!("using main database connection for custom state read");
        self.ensure_current_state(state)?;
        cb(self.storage.handle())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The underlying storage face (transaction bracket, current rows, undo
    /// rows, snapshots).
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Mutable access to the storage face.
    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// The game logic instance.
    pub fn logic(&self) -> &L {
        &self.logic
    }

    /// Mutable access to the game logic instance.
    pub fn logic_mut(&mut self) -> &mut L {
        &mut self.logic
    }

    /// Direct access to the writer handle, for tests of embedding games.
    pub fn database_for_testing(&self) -> &DbHandle {
        self.storage.handle()
    }
}
