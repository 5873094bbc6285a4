//! # Core Types and Status Codes
//!
//! Shared identifiers and the closed status taxonomy used across the engine.
//!
//! ## Status Codes
//!
//! Every operation on the data surface reports its outcome through
//! [`OpStatus`], a small closed set rather than an open-ended error type.
//! `KeyNotFound`, `WrongType` and `Invalid` are expected user-facing
//! outcomes. `OutOfMemory` is raised only in non-caching mode when an insert
//! cannot satisfy the memory budget after garbage collection and eviction.
//! `WrongKeyEpoch` signals that a table position captured earlier is stale
//! because the table changed structurally underneath it.
//!
//! Infrastructure failures (file IO in tiered storage, thread spawn) use
//! `eyre::Result` instead; they never leak into `OpStatus`.
//!
//! ## Identifiers
//!
//! - `DbIndex`: logical database number within a shard
//! - `ShardId`: index of a shard thread
//! - `TxId`: monotonically increasing transaction id assigned by coordinators

use std::fmt;

pub type DbIndex = u32;
pub type ShardId = u32;
pub type TxId = u64;

/// Closed set of operation outcomes surfaced by the data engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Ok,
    KeyNotFound,
    WrongType,
    OutOfMemory,
    WrongKeyEpoch,
    Invalid,
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpStatus::Ok => "ok",
            OpStatus::KeyNotFound => "key not found",
            OpStatus::WrongType => "wrong type",
            OpStatus::OutOfMemory => "out of memory",
            OpStatus::WrongKeyEpoch => "wrong key epoch",
            OpStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

pub type OpResult<T> = Result<T, OpStatus>;

/// Logical object types supported by the value layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
}

impl ObjType {
    pub fn name(&self) -> &'static str {
        match self {
            ObjType::String => "string",
            ObjType::List => "list",
            ObjType::Set => "set",
            ObjType::ZSet => "zset",
            ObjType::Hash => "hash",
            ObjType::Stream => "stream",
        }
    }
}

/// Lock arguments passed by multi-key commands.
///
/// `key_step` lets commands with key/value interleaving (MSET-style) index
/// only the keys: positions `0, key_step, 2*key_step, ...` of `keys` are
/// treated as keys, the rest are skipped.
#[derive(Debug, Clone)]
pub struct KeyLockArgs {
    pub db_index: DbIndex,
    pub keys: Vec<Vec<u8>>,
    pub key_step: usize,
}

impl KeyLockArgs {
    pub fn new(db_index: DbIndex, keys: Vec<Vec<u8>>) -> Self {
        Self { db_index, keys, key_step: 1 }
    }

    pub fn with_step(db_index: DbIndex, keys: Vec<Vec<u8>>, key_step: usize) -> Self {
        debug_assert!(key_step > 0);
        Self { db_index, keys, key_step }
    }
}

/// Context handed to every shard-local operation by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct OpArgs {
    pub shard: ShardId,
    pub txid: TxId,
    pub db_index: DbIndex,
}

/// Parses a human readable byte count such as `4G`, `512M` or `1.5k`.
///
/// At most one suffix character follows the number: `K`/`k`, `M`, `G`,
/// `T`, `P`, `E` scale by powers of 1024, a bare `B` means bytes. Anything
/// longer (`512MB`) or malformed returns `None`, as does overflow.
pub fn parse_human_bytes(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let neg = s.starts_with('-');
    let body = if neg { &s[1..] } else { s };

    let digits_end = body
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(body.len());
    let (num, suffix) = body.split_at(digits_end);
    let value: f64 = num.parse().ok()?;

    let scale: i64 = match suffix {
        "" | "B" => 1,
        "K" | "k" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        "P" => 1 << 50,
        "E" => 1 << 60,
        _ => return None,
    };

    let scaled = value * scale as f64;
    if scaled.is_nan() || scaled >= i64::MAX as f64 || scaled < 0.0 {
        return None;
    }

    let bytes = (scaled + 0.5) as i64;
    Some(if neg { -bytes } else { bytes })
}
