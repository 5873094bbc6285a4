//! # Key and Value Objects
//!
//! Compact storage representations for table entries. Keys inline short
//! byte strings into the slot and share heap allocations through a bounded
//! intern pool; values pick a physical encoding per logical type and can
//! reference payloads offloaded to tiered storage.
//!
//! - [`key`]: `KeyObj` with sticky / has-expire flags, `InternPool`
//! - [`value`]: `ValueObj` encodings, `ExternalPtr`, `StreamId`

pub mod key;
pub mod value;

pub use key::{InternPool, KeyObj};
pub use value::{ExternalPtr, StreamId, ValueObj};
