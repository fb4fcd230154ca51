#![allow(dead_code)]

//! Shared test fixtures: a small key/value game driven by block payloads,
//! plus helpers that play the role of the host indexer (transaction bracket,
//! current-state row maintenance, undo bookkeeping).

use std::path::PathBuf;

use rusqlite::params;
use serde_json::{json, Value as JsonValue};

use chainstate::{
    Block, BlockHash, DbHandle, GameDb, GameLogic, Result, StateContext, StateTag, UndoData,
};

/// Height of the game's genesis block.
pub const GENESIS_HEIGHT: u64 = 10;

/// Hash of the game's genesis block (`00...01`).
pub fn genesis_hash() -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[31] = 0x01;
    BlockHash::from_bytes(bytes)
}

/// A hash filled with the given byte, for block identities in tests.
pub fn test_hash(fill: u8) -> BlockHash {
    BlockHash::from_bytes([fill; 32])
}

// =============================================================================
// TestGame
// =============================================================================

/// A deterministic key/value game.
///
/// State is one table `game_kv (k TEXT PRIMARY KEY, v INTEGER)`. Each block's
/// payload may carry a `moves` array of:
///
/// - `{"set": ["key", value]}` - upsert a row
/// - `{"delete": "key"}` - delete a row
/// - `{"spawn": n}` - mint `n` ids from the `players` counter and insert
///   `("player<id>", id)` rows
pub struct TestGame {
    /// How often `initialise_state` ran (must stay at most 1 per database).
    pub init_calls: usize,
    /// Fail the next `initialise_state` call.
    pub fail_init: bool,
    /// Mint one `matches` id during `initialise_state`.
    pub mint_on_init: bool,
}

impl TestGame {
    pub fn new() -> Self {
        Self {
            init_calls: 0,
            fail_init: false,
            mint_on_init: false,
        }
    }
}

impl GameLogic for TestGame {
    fn setup_schema(&mut self, db: &DbHandle) -> Result<()> {
        db.prepare(
            "CREATE TABLE IF NOT EXISTS `game_kv` (
                `k` TEXT PRIMARY KEY,
                `v` INTEGER
            )",
        )?
        .execute([])?;
        Ok(())
    }

    fn initial_state_block(&self) -> Result<(u64, BlockHash)> {
        Ok((GENESIS_HEIGHT, genesis_hash()))
    }

    fn initialise_state(&mut self, ctx: &mut StateContext<'_>) -> Result<()> {
        self.init_calls += 1;
        if self.fail_init {
            return Err(chainstate::Error::logic("injected initialisation failure"));
        }

        ctx.db()
            .prepare("INSERT INTO `game_kv` (`k`, `v`) VALUES ('genesis', ?1)")?
            .execute(params![GENESIS_HEIGHT as i64])?;

        if self.mint_on_init {
            let id = ctx.ids("matches")?.next_id();
            ctx.db()
                .prepare("INSERT INTO `game_kv` (`k`, `v`) VALUES ('first_match', ?1)")?
                .execute(params![id as i64])?;
        }
        Ok(())
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>, block: &Block) -> Result<()> {
        let moves = block
            .payload()
            .get("moves")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();

        for mv in &moves {
            if let Some(set) = mv.get("set").and_then(JsonValue::as_array) {
                let key = set[0].as_str().expect("set key");
                let value = set[1].as_i64().expect("set value");
                ctx.db()
                    .prepare("INSERT OR REPLACE INTO `game_kv` (`k`, `v`) VALUES (?1, ?2)")?
                    .execute(params![key, value])?;
            } else if let Some(key) = mv.get("delete").and_then(JsonValue::as_str) {
                ctx.db()
                    .prepare("DELETE FROM `game_kv` WHERE `k` = ?1")?
                    .execute(params![key])?;
            } else if let Some(count) = mv.get("spawn").and_then(JsonValue::as_u64) {
                for _ in 0..count {
                    let id = ctx.ids("players")?.next_id();
                    ctx.db()
                        .prepare("INSERT INTO `game_kv` (`k`, `v`) VALUES (?1, ?2)")?
                        .execute(params![format!("player{id}"), id as i64])?;
                }
            } else if mv.get("fail").is_some() {
                return Err(chainstate::Error::logic("injected move failure"));
            }
        }
        Ok(())
    }

    fn state_as_json(&self, db: &DbHandle) -> Result<JsonValue> {
        let mut stmt = db.prepare_ro("SELECT `k`, `v` FROM `game_kv` ORDER BY `k`")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut state = serde_json::Map::new();
        for row in rows {
            let (key, value) = row?;
            state.insert(key, json!(value));
        }
        Ok(JsonValue::Object(state))
    }
}

// =============================================================================
// Host-Side Helpers
// =============================================================================

/// Opens a file-backed game database in a fresh temp directory.
pub fn open_game(name: &str) -> (tempfile::TempDir, GameDb<TestGame>) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path: PathBuf = dir.path().join(name);
    let mut game = GameDb::new(TestGame::new(), path);
    game.initialise().expect("initialise game database");
    (dir, game)
}

/// Opens an in-memory game database (no snapshots available).
pub fn open_memory_game() -> GameDb<TestGame> {
    let mut game = GameDb::new(TestGame::new(), chainstate::MEMORY_DB);
    game.initialise().expect("initialise game database");
    game
}

/// Installs the initial state and records it as current, the way the host
/// does after `initial_state`.
pub fn install_initial(game: &mut GameDb<TestGame>) -> StateTag {
    let (height, hash, tag) = game.initial_state().expect("install initial state");
    assert_eq!(height, GENESIS_HEIGHT);
    assert_eq!(hash, genesis_hash());

    let storage = game.storage_mut();
    storage.begin_transaction().expect("begin");
    storage
        .set_current_game_state(&hash, &tag)
        .expect("set current state");
    storage.commit_transaction().expect("commit");
    tag
}

/// Builds a block with the given identity and moves payload.
pub fn block(hash: BlockHash, parent: BlockHash, height: u64, moves: JsonValue) -> Block {
    Block::from_json(json!({
        "block": {
            "hash": hash.to_hex(),
            "parent": parent.to_hex(),
            "height": height,
        },
        "moves": moves,
    }))
    .expect("build block")
}

/// Plays one forward step the way the host does: bracket, driver, current
/// rows, undo row.
pub fn forward(game: &mut GameDb<TestGame>, tag: &StateTag, blk: &Block) -> (StateTag, UndoData) {
    game.storage_mut().begin_transaction().expect("begin");
    let (new_tag, undo) = game.process_forward(tag, blk).expect("process forward");

    let hash = blk.hash();
    let storage = game.storage_mut();
    storage
        .set_current_game_state(&hash, &new_tag)
        .expect("set current state");
    storage
        .add_undo_data(&hash, blk.height(), &undo)
        .expect("add undo data");
    storage.commit_transaction().expect("commit");
    (new_tag, undo)
}

/// Rewinds one step using the stored undo blob, restoring the parent as the
/// current state.
pub fn rewind(game: &mut GameDb<TestGame>, tag: &StateTag, blk: &Block) -> StateTag {
    let undo = game
        .storage()
        .get_undo_data(&blk.hash())
        .expect("get undo data")
        .expect("undo data present for rewound block");

    game.storage_mut().begin_transaction().expect("begin");
    let prev_tag = game
        .process_backward(tag, blk, &undo)
        .expect("process backward");

    let parent = blk.parent();
    let storage = game.storage_mut();
    storage
        .set_current_game_state(&parent, &prev_tag)
        .expect("set current state");
    storage
        .release_undo_data(&blk.hash())
        .expect("release undo data");
    storage.commit_transaction().expect("commit");
    prev_tag
}

// =============================================================================
// State Inspection
// =============================================================================

/// All rows of the game's key/value table, ordered.
pub fn read_kv(db: &DbHandle) -> Vec<(String, i64)> {
    let mut stmt = db
        .prepare_ro("SELECT `k`, `v` FROM `game_kv` ORDER BY `k`")
        .expect("prepare kv select");
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .expect("query kv rows");
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .expect("collect kv rows")
}

/// A textual fingerprint of the full game-relevant database contents:
/// application rows, auto-id counters, undo rows and the current block hash.
///
/// (The textual `gamestate` tag is not included: rewinding to the game's
/// first block legitimately stores `block <genesis>` where the fresh install
/// stored `initial`, while both label the same state.)
pub fn fingerprint(db: &DbHandle) -> Vec<String> {
    let mut lines = Vec::new();

    for (key, value) in read_kv(db) {
        lines.push(format!("kv|{key}|{value}"));
    }

    let mut stmt = db
        .prepare_ro("SELECT `key`, `nextid` FROM `xayagame_autoids` ORDER BY `key`")
        .expect("prepare autoids select");
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .expect("query autoids");
    for row in rows {
        let (key, next) = row.expect("autoid row");
        lines.push(format!("autoid|{key}|{next}"));
    }

    let mut stmt = db
        .prepare_ro("SELECT `hash`, `height` FROM `xayagame_undo` ORDER BY `hash`")
        .expect("prepare undo select");
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
        })
        .expect("query undo rows");
    for row in rows {
        let (hash, height) = row.expect("undo row");
        lines.push(format!("undo|{}|{height}", hex::encode(hash)));
    }

    let current: Option<Vec<u8>> = {
        use rusqlite::OptionalExtension;
        db.prepare_ro("SELECT `value` FROM `xayagame_current` WHERE `key` = 'blockhash'")
            .expect("prepare current select")
            .query_row([], |row| row.get(0))
            .optional()
            .expect("query current hash")
    };
    if let Some(hash) = current {
        lines.push(format!("current|{}", hex::encode(hash)));
    }

    lines
}
