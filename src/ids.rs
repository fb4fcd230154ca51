//! # Auto-Increment ID Counters
//!
//! Games need fresh numeric identifiers while processing moves (for newly
//! created objects, matches, orders and so on). [`AutoId`] is a named,
//! persistently stored monotonic counter backed by the `xayagame_autoids`
//! table.
//!
//! Counters are only available through an [`AutoIdScope`], which the drivers
//! open around the game-logic callbacks:
//!
//! - `get` lazily loads a counter from the database on first use (a fresh
//!   counter starts at 1; 0 is the reserved "never issued" sentinel);
//! - the game logic advances counters freely via the [`StateContext`];
//! - when the scope closes, every counter whose value moved is written back
//!   exactly once, in the order the counters were first used.
//!
//! At most one scope may exist per database at any time; because the flush
//! happens while the change recorder is still live, counter updates land in
//! the undo blob and are rolled back by a rewind like any other state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::db::DbHandle;
use crate::error::{Error, Result};

/// Reserved sentinel meaning "no id ever issued". Never returned by
/// [`AutoId::next_id`].
pub const EMPTY_ID: u64 = 0;

// =============================================================================
// AutoId
// =============================================================================

/// A named monotonic counter.
///
/// `next_value` is the id the next call to [`next_id`](Self::next_id) will
/// hand out; `db_value` mirrors what the database currently stores. The two
/// are equal right after loading and right after a flush; anything else means
/// the counter is dirty and will be written back when its scope closes.
pub struct AutoId {
    next_value: u64,
    db_value: u64,
}

impl AutoId {
    fn load(db: &DbHandle, key: &str) -> Result<Self> {
        let stored: Option<i64> = db
            .prepare_ro("SELECT `nextid` FROM `xayagame_autoids` WHERE `key` = ?1")?
            .query_row(params![key], |row| row.get(0))
            .optional()?;

        let value = match stored {
            Some(value) => {
                debug!("fetched next value {value} for auto-id {key}");
                value as u64
            }
            None => {
                debug!("no stored next value for auto-id {key}");
                1
            }
        };
        if value == EMPTY_ID {
            return Err(Error::Corrupt(format!(
                "auto-id '{key}' stores the reserved sentinel value"
            )));
        }

        Ok(Self {
            next_value: value,
            db_value: value,
        })
    }

    /// Issues the next id and advances the counter.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_value;
        self.next_value += 1;
        id
    }

    /// The id the next call to [`next_id`](Self::next_id) would issue.
    pub fn peek(&self) -> u64 {
        self.next_value
    }

    /// Reserves `count` ids at once, returning the first of the reserved
    /// range.
    pub fn reserve(&mut self, count: u64) -> u64 {
        let first = self.next_value;
        self.next_value += count;
        first
    }

    fn dirty(&self) -> bool {
        self.next_value != self.db_value
    }

    fn sync(&mut self, db: &DbHandle, key: &str) -> Result<()> {
        if !self.dirty() {
            debug!("no need to sync auto-id {key}");
            return Ok(());
        }
        db.prepare(
            "INSERT OR REPLACE INTO `xayagame_autoids` (`key`, `nextid`)
             VALUES (?1, ?2)",
        )?
        .execute(params![key, self.next_value as i64])?;
        debug!("synced auto-id {key} to {}", self.next_value);
        self.db_value = self.next_value;
        Ok(())
    }
}

// =============================================================================
// AutoIdScope
// =============================================================================

/// The set of counters live during one game-logic invocation.
///
/// Opened by the drivers around `initialise_state` / `update_state`; at most
/// one scope may exist per database at a time. The driver closes the scope by
/// flushing it (success) or abandoning it (the enclosing transaction is about
/// to be rolled back). Dropping a scope that still holds unflushed counters
/// without either is a bug.
pub struct AutoIdScope {
    gate: Arc<AtomicBool>,
    /// Insertion-ordered so the flush writes counters in first-use order.
    entries: Vec<(String, AutoId)>,
    closed: bool,
}

impl AutoIdScope {
    /// Opens the scope, claiming the per-database slot.
    ///
    /// # Panics
    ///
    /// Panics if another scope is already active for the same database.
    pub(crate) fn new(gate: Arc<AtomicBool>) -> Self {
        assert!(
            !gate.swap(true, Ordering::SeqCst),
            "an auto-id scope is already active for this database"
        );
        Self {
            gate,
            entries: Vec::new(),
            closed: false,
        }
    }

    /// Returns the counter for `key`, loading it from the database on first
    /// use within this scope.
    pub fn get(&mut self, db: &DbHandle, key: &str) -> Result<&mut AutoId> {
        if let Some(index) = self.entries.iter().position(|(k, _)| k == key) {
            return Ok(&mut self.entries[index].1);
        }

        let index = self.entries.len();
        let id = AutoId::load(db, key)?;
        self.entries.push((key.to_string(), id));
        Ok(&mut self.entries[index].1)
    }

    /// Writes back every dirty counter, in first-use order, and closes the
    /// scope.
    ///
    /// The scope counts as closed even if a write fails: the caller treats
    /// such a failure as unrecoverable and rolls back the enclosing
    /// transaction.
    pub(crate) fn flush(&mut self, db: &DbHandle) -> Result<()> {
        self.closed = true;
        for (key, id) in &mut self.entries {
            id.sync(db, key)?;
        }
        Ok(())
    }

    /// Discards all counters and closes the scope without writing.
    ///
    /// Used when the game-logic callback failed and the enclosing
    /// transaction is about to be rolled back anyway.
    pub(crate) fn abandon(&mut self) {
        debug!("abandoning auto-id scope with {} counter(s)", self.entries.len());
        self.entries.clear();
        self.closed = true;
    }
}

impl Drop for AutoIdScope {
    fn drop(&mut self) {
        self.gate.store(false, Ordering::SeqCst);
        if !self.closed && !std::thread::panicking() {
            assert!(
                !self.entries.iter().any(|(_, id)| id.dirty()),
                "auto-id scope dropped with unflushed counters"
            );
        }
    }
}

// =============================================================================
// StateContext
// =============================================================================

/// Execution context handed to the game-logic callbacks.
///
/// Bundles the writer handle with the live [`AutoIdScope`], so game code can
/// both run SQL and mint ids without any global state.
pub struct StateContext<'a> {
    db: &'a DbHandle,
    ids: &'a mut AutoIdScope,
}

impl<'a> StateContext<'a> {
    pub(crate) fn new(db: &'a DbHandle, ids: &'a mut AutoIdScope) -> Self {
        Self { db, ids }
    }

    /// The writer database handle.
    pub fn db(&self) -> &'a DbHandle {
        self.db
    }

    /// The counter registered under `key`.
    pub fn ids(&mut self, key: &str) -> Result<&mut AutoId> {
        self.ids.get(self.db, key)
    }
}

// =============================================================================
// Tests
// =============================================================================
