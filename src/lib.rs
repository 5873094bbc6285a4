//! # SwiftKV - Shard-Per-Core In-Memory Key-Value Engine
//!
//! SwiftKV is the storage and execution core of a shared-nothing in-memory
//! datastore speaking a Redis-compatible command surface. This crate is
//! the shard-local data engine; the wire protocol, command families,
//! snapshotting and replication live in their own layers and talk to the
//! core through the interfaces exported here.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        ShardSet                           │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐  │
//! │  │ shard thread 0│  │ shard thread 1│  │ shard thread N│  │
//! │  │  EngineShard  │  │  EngineShard  │  │  EngineShard  │  │
//! │  │  ├ task queue │  │      ...      │  │      ...      │  │
//! │  │  ├ heartbeat  │  └───────────────┘  └───────────────┘  │
//! │  │  ├ TxQueue    │                                        │
//! │  │  └ DbSlice    │                                        │
//! │  │     ├ prime / expire / mcflag tables (segmented)       │
//! │  │     ├ intent-lock table                                │
//! │  │     ├ watched keys + change callbacks                  │
//! │  │     └ eviction & TTL policies                          │
//! │  └───────────────┘                                        │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Each shard owns a disjoint partition of the keyspace (stable key hash)
//! and is touched by exactly one OS thread. Cross-shard work moves as
//! closures through bounded task queues; transactions are ordered by a
//! per-shard queue with out-of-order and continuation fast paths.
//!
//! ## Module Overview
//!
//! - [`config`]: runtime options and centralized constants
//! - [`object`]: compact key and value representations
//! - [`table`]: segmented open-addressed tables with eviction hooks
//! - [`slice`]: `DbSlice`, the per-shard data surface
//! - [`lock`]: intent locks and the compatibility matrix
//! - [`txn`] / [`txq`]: transaction state machine and ordering queue
//! - [`shard`]: shard threads, heartbeat, execution poll, `ShardSet`
//! - [`blocking`]: parking and waking of blocking commands
//! - [`tiered`]: tiered-storage backing-file hook

pub mod blocking;
pub mod config;
pub mod lock;
pub mod object;
pub mod shard;
pub mod slice;
pub mod table;
pub mod tiered;
pub mod txn;
pub mod txq;
pub mod types;

pub use config::EngineConfig;
pub use object::{ExternalPtr, KeyObj, ValueObj};
pub use shard::set::ShardSet;
pub use shard::{EngineShard, ShardHandle};
pub use slice::{ChangeReq, DbSlice, ExecWatcher};
pub use types::{DbIndex, ObjType, OpResult, OpStatus, ShardId, TxId};
