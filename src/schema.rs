//! # Engine Schema
//!
//! DDL for the tables the engine itself owns. Application tables are created
//! by the game logic's `setup_schema` callback on top of these and are opaque
//! to the engine.
//!
//! ```text
//! xayagame_current            xayagame_undo
//! ┌──────────────────┐        ┌──────────────────┐
//! │ key TEXT (PK)    │        │ hash BLOB (PK)   │
//! │ value BLOB       │        │ data BLOB        │
//! └──────────────────┘        │ height INTEGER   │
//!   'blockhash' | 'gamestate' └──────────────────┘
//!
//! xayagame_gamevars           xayagame_autoids
//! ┌─────────────────────────┐ ┌──────────────────┐
//! │ onlyonerow INTEGER (PK) │ │ key TEXT (PK)    │
//! │ gamestate_initialised   │ │ nextid INTEGER   │
//! └─────────────────────────┘ └──────────────────┘
//! ```
//!
//! All setup is idempotent (`CREATE TABLE IF NOT EXISTS` plus an
//! `INSERT OR IGNORE` seed), so it can run on every open, including the
//! reopen after [`Storage::clear`].
//!
//! [`Storage::clear`]: crate::Storage::clear

use rusqlite::Connection;

use crate::error::Result;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `xayagame_current` table holds the latest block hash and game-state
/// tag under the keys `'blockhash'` and `'gamestate'`.
///
/// Between any two block operations it contains exactly one `blockhash` row
/// iff the game state has been initialised.
const CREATE_CURRENT: &str = r#"
CREATE TABLE IF NOT EXISTS `xayagame_current` (
    `key`   TEXT PRIMARY KEY,
    `value` BLOB
)
"#;

/// The `xayagame_undo` table holds one raw forward changeset per processed
/// block, keyed by the 32-byte block hash.
///
/// `height` exists solely so old undo rows can be pruned by block height.
const CREATE_UNDO: &str = r#"
CREATE TABLE IF NOT EXISTS `xayagame_undo` (
    `hash`   BLOB PRIMARY KEY,
    `data`   BLOB,
    `height` INTEGER
)
"#;

/// Single-row bookkeeping table with the one-shot initialised flag.
///
/// `onlyonerow` is always 1; the `INSERT OR IGNORE` seed below guarantees the
/// row exists from the moment the schema is set up.
const CREATE_GAMEVARS: &str = r#"
CREATE TABLE IF NOT EXISTS `xayagame_gamevars` (
    `onlyonerow`            INTEGER PRIMARY KEY,
    `gamestate_initialised` INTEGER
)
"#;

/// Seed for `xayagame_gamevars`: not yet initialised.
const SEED_GAMEVARS: &str = r#"
INSERT OR IGNORE INTO `xayagame_gamevars`
    (`onlyonerow`, `gamestate_initialised`) VALUES (1, 0)
"#;

/// Persistent monotonic counters minted by the game logic during state
/// transitions.
const CREATE_AUTOIDS: &str = r#"
CREATE TABLE IF NOT EXISTS `xayagame_autoids` (
    `key`    TEXT PRIMARY KEY,
    `nextid` INTEGER
)
"#;

// =============================================================================
// Setup
// =============================================================================

/// Creates the key/value storage tables (`xayagame_current`,
/// `xayagame_undo`). Run on every open of the writer connection.
pub(crate) fn setup_base_schema(conn: &Connection) -> Result<()> {
    tracing::info!("setting up base database schema if it does not exist yet");
    conn.execute_batch(CREATE_CURRENT)?;
    conn.execute_batch(CREATE_UNDO)?;
    Ok(())
}

/// Creates the game-glue tables (`xayagame_gamevars`, `xayagame_autoids`)
/// and seeds the gamevars singleton row.
pub(crate) fn setup_game_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_GAMEVARS)?;
    conn.execute_batch(SEED_GAMEVARS)?;
    conn.execute_batch(CREATE_AUTOIDS)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
