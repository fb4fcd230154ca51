//! # Domain Types
//!
//! Core types shared across the engine: block hashes, state tags, blocks and
//! undo blobs. Uses the newtype pattern throughout so the compiler keeps the
//! different byte-string roles apart.
//!
//! ## State Tags
//!
//! The writer labels the logical state it believes the database holds with a
//! short tag. In memory this is the [`StateTag`] sum type; at the storage
//! boundary it is serialized to one of two textual forms:
//!
//! ```text
//! "initial"                      the pre-genesis state installed by the game
//! "block <64 hex chars>"         the state after processing that block
//! ```
//!
//! Any other textual value found in the database is corruption.

use std::fmt;
use std::str::FromStr;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// Keyword string for the initial game state.
const INITIAL_STATE: &str = "initial";

/// Prefix for the block-hash state tags.
const BLOCKHASH_STATE: &str = "block ";

// =============================================================================
// BlockHash
// =============================================================================

/// A 256-bit block hash.
///
/// Stored as a 32-byte BLOB in the database and rendered as 64 lowercase hex
/// characters everywhere else (state tags, logs, block JSON).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash([u8; Self::NUM_BYTES]);

impl BlockHash {
    /// Number of raw bytes in a block hash.
    pub const NUM_BYTES: usize = 32;

    /// Constructs a hash from its raw bytes.
    pub const fn from_bytes(bytes: [u8; Self::NUM_BYTES]) -> Self {
        Self(bytes)
    }

    /// Constructs a hash from a database BLOB, verifying the size.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let bytes: [u8; Self::NUM_BYTES] = blob.try_into().map_err(|_| {
            Error::Corrupt(format!(
                "block hash blob has {} bytes, expected {}",
                blob.len(),
                Self::NUM_BYTES
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Parses a hash from a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|_| Error::InvalidBlockHash(hex_str.to_string()))?;
        let bytes: [u8; Self::NUM_BYTES] = bytes
            .try_into()
            .map_err(|_| Error::InvalidBlockHash(hex_str.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; Self::NUM_BYTES] {
        &self.0
    }

    /// Returns the lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

// =============================================================================
// StateTag
// =============================================================================

/// Label for the logical state the database currently holds.
///
/// Every state-dependent entry point takes a tag and refuses to proceed if it
/// does not match the stored block hash (for [`StateTag::Initial`], the
/// game's declared genesis hash).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateTag {
    /// The initial state installed by the game before any block.
    Initial,
    /// The state after processing the block with this hash.
    Block(BlockHash),
}

impl StateTag {
    /// Serializes the tag to its textual wire form.
    pub fn to_wire(self) -> String {
        self.to_string()
    }

    /// Parses a tag from the bytes stored in `xayagame_current.gamestate`.
    pub fn from_wire(blob: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(blob)
            .map_err(|_| Error::InvalidStateTag(format!("{blob:?}")))?;
        text.parse()
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => f.write_str(INITIAL_STATE),
            Self::Block(hash) => write!(f, "{BLOCKHASH_STATE}{hash}"),
        }
    }
}

impl FromStr for StateTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == INITIAL_STATE {
            return Ok(Self::Initial);
        }
        match s.strip_prefix(BLOCKHASH_STATE) {
            Some(hex_str) => Ok(Self::Block(BlockHash::from_hex(hex_str)?)),
            None => Err(Error::InvalidStateTag(s.to_string())),
        }
    }
}

// =============================================================================
// UndoData
// =============================================================================

/// Opaque per-block undo blob.
///
/// Holds the raw *forward* changeset captured by the recorder while the block
/// was processed. Inversion is deferred to rewind time, since most undo blobs
/// are never used.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct UndoData(Vec<u8>);

impl UndoData {
    /// Wraps raw changeset bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw changeset bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the blob, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Number of bytes in the blob.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the captured changeset was empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for UndoData {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

// =============================================================================
// Block
// =============================================================================

/// One block as delivered by the host indexer.
///
/// The engine interprets only `block.hash`, `block.parent` and
/// `block.height`; the full JSON payload is passed through to the game logic
/// untouched (it typically carries the moves for the block).
#[derive(Clone, Debug)]
pub struct Block {
    hash: BlockHash,
    parent: BlockHash,
    height: u64,
    payload: JsonValue,
}

impl Block {
    /// Parses a block from the host's JSON form.
    ///
    /// Expects at least:
    ///
    /// ```json
    /// {"block": {"hash": "<hex>", "parent": "<hex>", "height": 10}}
    /// ```
    pub fn from_json(payload: JsonValue) -> Result<Self> {
        let header = payload
            .get("block")
            .ok_or_else(|| Error::InvalidBlock("missing 'block' field".to_string()))?;

        let hash = Self::hash_field(header, "hash")?;
        let parent = Self::hash_field(header, "parent")?;
        let height = header
            .get("height")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| Error::InvalidBlock("missing 'block.height' field".to_string()))?;

        Ok(Self {
            hash,
            parent,
            height,
            payload,
        })
    }

    fn hash_field(header: &JsonValue, field: &str) -> Result<BlockHash> {
        let hex_str = header
            .get(field)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::InvalidBlock(format!("missing 'block.{field}' field")))?;
        BlockHash::from_hex(hex_str)
    }

    /// Hash of this block.
    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Hash of the parent block.
    pub fn parent(&self) -> BlockHash {
        self.parent
    }

    /// Height of this block.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// The full JSON payload as delivered by the host.
    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }
}

// =============================================================================
// Tests
// =============================================================================
