//! # Transaction Batching
//!
//! While the host is catching up with a long chain, committing every block
//! individually wastes most of the time on fsync. [`TransactionBatcher`]
//! wraps the storage's transaction bracket and coalesces a configurable
//! number of logical commits into one underlying savepoint bracket:
//!
//! ```text
//! batch size 3:
//!     begin ─► SAVEPOINT          (first logical tx opens the bracket)
//!     commit                       (batched, nothing hits the storage)
//!     begin / commit               (batched)
//!     begin / commit ─► RELEASE    (third commit flushes the batch)
//! ```
//!
//! A rollback always aborts the entire open batch: batched commits are
//! logical only and cannot be separated from the failed transaction anymore.
//! With batch size 1 (the default) the batcher is a transparent pass-through.

use tracing::debug;

use crate::error::Result;
use crate::storage::Storage;

/// Coalesces logical transactions into batches on the underlying storage.
///
/// The batcher holds only counters; the storage is passed into every call,
/// so it can be shared with the rest of the host between steps.
pub struct TransactionBatcher {
    /// Desired batch size; 1 disables batching.
    batch_size: u32,
    /// Logical commits accumulated in the currently open underlying bracket.
    batched_commits: u32,
    /// Whether a logical transaction is open on the batcher.
    in_transaction: bool,
}

impl TransactionBatcher {
    /// Creates a pass-through batcher (batch size 1).
    pub fn new() -> Self {
        Self {
            batch_size: 1,
            batched_commits: 0,
            in_transaction: false,
        }
    }

    /// Changes the batch size.
    ///
    /// If the already-accumulated commits reach the new size, the batch is
    /// flushed right away.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or a logical transaction is open.
    pub fn set_batch_size(&mut self, storage: &mut Storage, size: u32) -> Result<()> {
        assert!(size >= 1, "batch size must be at least one");
        assert!(
            !self.in_transaction,
            "batch size cannot change mid-transaction"
        );
        self.batch_size = size;
        if self.batched_commits >= self.batch_size {
            self.flush_batch(storage)?;
        }
        Ok(())
    }

    /// Starts a logical transaction, opening the underlying bracket if this
    /// is the first one of a batch.
    ///
    /// # Panics
    ///
    /// Panics if a logical transaction is already open.
    pub fn begin_transaction(&mut self, storage: &mut Storage) -> Result<()> {
        assert!(!self.in_transaction, "logical transaction already started");
        if self.batched_commits == 0 {
            storage.begin_transaction()?;
        }
        self.in_transaction = true;
        Ok(())
    }

    /// Commits the logical transaction; the underlying bracket is released
    /// once the batch is full.
    ///
    /// # Panics
    ///
    /// Panics if no logical transaction is open.
    pub fn commit_transaction(&mut self, storage: &mut Storage) -> Result<()> {
        assert!(self.in_transaction, "no logical transaction to commit");
        self.in_transaction = false;
        self.batched_commits += 1;
        if self.batched_commits >= self.batch_size {
            self.flush_batch(storage)?;
        }
        Ok(())
    }

    /// Rolls back the logical transaction together with the whole batch it
    /// is part of.
    ///
    /// # Panics
    ///
    /// Panics if no logical transaction is open.
    pub fn rollback_transaction(&mut self, storage: &mut Storage) -> Result<()> {
        assert!(self.in_transaction, "no logical transaction to roll back");
        debug!(
            "rolling back batch of {} committed transaction(s) plus the current one",
            self.batched_commits
        );
        self.in_transaction = false;
        self.batched_commits = 0;
        storage.rollback_transaction()
    }

    /// Flushes any batched commits to the storage.
    ///
    /// # Panics
    ///
    /// Panics if a logical transaction is open.
    pub fn flush(&mut self, storage: &mut Storage) -> Result<()> {
        assert!(!self.in_transaction, "flush must not run mid-transaction");
        self.flush_batch(storage)
    }

    /// Number of logical commits waiting in the open batch.
    pub fn pending_commits(&self) -> u32 {
        self.batched_commits
    }

    fn flush_batch(&mut self, storage: &mut Storage) -> Result<()> {
        if self.batched_commits == 0 {
            return Ok(());
        }
        debug!("committing batch of {} transaction(s)", self.batched_commits);
        self.batched_commits = 0;
        storage.commit_transaction()
    }
}

impl Default for TransactionBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransactionBatcher {
    fn drop(&mut self) {
        // Batched commits can only be flushed with the storage at hand;
        // dropping them silently would lose acknowledged transactions.
        if !std::thread::panicking() {
            assert!(
                !self.in_transaction && self.batched_commits == 0,
                "transaction batcher dropped with pending transactions; call flush first"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
