//! # Undo Capture and Rewind
//!
//! Undo information is captured with SQLite's session extension rather than
//! by hand: a [`ChangeRecorder`] opens a session on the writer connection,
//! attached to *all* tables, and every row-level mutation made while it lives
//! is recorded. At the end of a forward step the raw forward changeset is
//! extracted and stored as the block's undo blob.
//!
//! On a reorg the stored blob is inverted ([`InvertedChangeset`]) and applied
//! back onto the database. Storing the forward form and inverting lazily is
//! deliberate: most blocks are never rewound, so the inversion cost is paid
//! only when a rewind actually happens.
//!
//! Rewinds always unwind exactly the last recorded block, so applying the
//! inverse must never conflict; a conflict aborts the application and is
//! reported as [`Error::ChangesetConflict`].

use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::ffi;
use rusqlite::session::{ConflictAction, Session};
use tracing::{debug, error};

use crate::db::DbHandle;
use crate::error::{Error, Result};
use crate::types::UndoData;

// =============================================================================
// ChangeRecorder
// =============================================================================

/// Records all row-level mutations on the writer connection while it lives.
///
/// Scoped resource: the session is released when the recorder is dropped.
pub struct ChangeRecorder<'conn> {
    session: Session<'conn>,
}

impl<'conn> ChangeRecorder<'conn> {
    /// Starts recording on the "main" database, attached to all tables.
    pub(crate) fn new(db: &'conn DbHandle) -> Result<Self> {
        debug!("starting session to record undo data");
        let mut session = Session::new(db.conn())?;
        session.attach(None)?;
        Ok(Self { session })
    }

    /// Serializes the changes recorded so far into an undo blob.
    pub(crate) fn extract_changeset(&mut self) -> Result<UndoData> {
        debug!("extracting recorded undo data from session");
        let mut raw = Vec::new();
        self.session.changeset_strm(&mut raw)?;
        Ok(UndoData::new(raw))
    }
}

// =============================================================================
// InvertedChangeset
// =============================================================================

/// The inverse of a stored forward changeset, ready to be applied for a
/// rewind.
pub struct InvertedChangeset {
    data: Vec<u8>,
}

impl InvertedChangeset {
    /// Inverts the raw forward changeset held in `undo`.
    pub fn new(undo: &UndoData) -> Result<Self> {
        Ok(Self {
            data: invert_raw(undo.as_bytes())?,
        })
    }

    /// Applies the inverted changeset to the given connection.
    ///
    /// Any conflict aborts the application; the host is expected to be
    /// unwinding exactly the last recorded block, for which conflicts cannot
    /// occur.
    pub fn apply(&self, db: &DbHandle) -> Result<()> {
        if self.data.is_empty() {
            debug!("inverted changeset is empty, nothing to apply");
            return Ok(());
        }

        let conflicted = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&conflicted);

        let mut input: &[u8] = &self.data;
        let applied = db.conn().apply_strm(
            &mut input,
            None::<fn(&str) -> bool>,
            move |conflict_type, _item| {
                error!("changeset application has a conflict of type {:?}", conflict_type);
                seen.store(true, Ordering::SeqCst);
                ConflictAction::SQLITE_CHANGESET_ABORT
            },
        );

        match applied {
            Ok(()) => Ok(()),
            Err(err) if conflicted.load(Ordering::SeqCst) => {
                Err(Error::ChangesetConflict(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Inverts raw changeset bytes via the session extension's inversion
/// primitive.
///
/// The safe wrapper only inverts changesets it produced itself; blobs loaded
/// back from the undo table exist only as bytes, so this goes through the C
/// entry point directly.
fn invert_raw(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let mut out_size: c_int = 0;
    let mut out_ptr: *mut c_void = std::ptr::null_mut();
    // Safety: `raw` is a valid buffer for the duration of the call; on
    // success SQLite hands back an allocation that is copied and freed below.
    let rc = unsafe {
        ffi::sqlite3changeset_invert(
            raw.len() as c_int,
            raw.as_ptr() as *const c_void,
            &mut out_size,
            &mut out_ptr,
        )
    };
    if rc != ffi::SQLITE_OK {
        return Err(Error::ChangesetInvert(rc));
    }

    let inverted = if out_ptr.is_null() || out_size <= 0 {
        Vec::new()
    } else {
        // Safety: on SQLITE_OK the output pointer holds exactly `out_size`
        // bytes.
        unsafe { std::slice::from_raw_parts(out_ptr as *const u8, out_size as usize) }.to_vec()
    };
    // Safety: the buffer was allocated by SQLite; freeing a null pointer is
    // a no-op.
    unsafe { ffi::sqlite3_free(out_ptr) };

    Ok(inverted)
}

// =============================================================================
// Tests
// =============================================================================
