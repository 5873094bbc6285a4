//! # Compact Key Objects
//!
//! A key is a byte string stored in the most compact representation its
//! length allows:
//!
//! - up to [`KEY_INLINE_CAP`] bytes: inline inside the table slot, no heap
//!   allocation at all
//! - longer keys: a shared `Arc<[u8]>` heap allocation; short heap keys
//!   (up to [`KEY_INTERN_MAX`]) are deduplicated through a bounded
//!   shard-local intern pool
//!
//! Cloning a key is always cheap: inline keys copy, heap keys bump the Arc
//! refcount. The expire and flag side tables hold such clones, so a heap
//! allocation is shared between all tables that reference the same key.
//!
//! ## Flags
//!
//! Each key carries two flags that travel with the prime-table entry:
//!
//! - `sticky`: the entry is exempt from every eviction policy
//! - `has_expire`: a matching entry exists in the expire table
//!
//! Flags are deliberately excluded from equality and hashing; two keys with
//! the same bytes are the same key regardless of entry state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::HashSet;

use crate::config::{KEY_INLINE_CAP, KEY_INTERN_MAX, KEY_INTERN_POOL_BYTES};

const FLAG_STICKY: u8 = 1 << 0;
const FLAG_HAS_EXPIRE: u8 = 1 << 1;

#[derive(Clone)]
enum KeyRepr {
    Inline { len: u8, buf: [u8; KEY_INLINE_CAP] },
    Heap(Arc<[u8]>),
}

/// Compact representation of a byte-string key.
#[derive(Clone)]
pub struct KeyObj {
    flags: u8,
    repr: KeyRepr,
}

impl KeyObj {
    /// Builds a key without interning. Prefer [`KeyObj::with_pool`] on the
    /// insert path so short heap keys are deduplicated.
    pub fn new(bytes: &[u8]) -> Self {
        let repr = if bytes.len() <= KEY_INLINE_CAP {
            let mut buf = [0u8; KEY_INLINE_CAP];
            buf[..bytes.len()].copy_from_slice(bytes);
            KeyRepr::Inline { len: bytes.len() as u8, buf }
        } else {
            KeyRepr::Heap(Arc::from(bytes))
        };
        Self { flags: 0, repr }
    }

    /// Builds a key, routing short heap keys through the intern pool.
    pub fn with_pool(bytes: &[u8], pool: &mut InternPool) -> Self {
        if bytes.len() <= KEY_INLINE_CAP {
            return Self::new(bytes);
        }
        if bytes.len() <= KEY_INTERN_MAX {
            return Self { flags: 0, repr: KeyRepr::Heap(pool.intern(bytes)) };
        }
        Self::new(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.repr {
            KeyRepr::Inline { len, buf } => &buf[..*len as usize],
            KeyRepr::Heap(b) => b,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_inline(&self) -> bool {
        matches!(self.repr, KeyRepr::Inline { .. })
    }

    /// Heap bytes attributable to this key. Shared interned allocations are
    /// still counted once per referencing entry, mirroring how the stats
    /// counters treat every entry contribution independently.
    pub fn mem_usage(&self) -> usize {
        match &self.repr {
            KeyRepr::Inline { .. } => 0,
            KeyRepr::Heap(b) => b.len(),
        }
    }

    #[inline]
    pub fn sticky(&self) -> bool {
        self.flags & FLAG_STICKY != 0
    }

    pub fn set_sticky(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_STICKY;
        } else {
            self.flags &= !FLAG_STICKY;
        }
    }

    #[inline]
    pub fn has_expire(&self) -> bool {
        self.flags & FLAG_HAS_EXPIRE != 0
    }

    pub fn set_has_expire(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_HAS_EXPIRE;
        } else {
            self.flags &= !FLAG_HAS_EXPIRE;
        }
    }

    /// Clone carrying only the bytes, not the entry flags. Side tables hold
    /// these so flag updates on the prime entry never alias.
    pub fn clone_bytes(&self) -> Self {
        Self { flags: 0, repr: self.repr.clone() }
    }
}

impl PartialEq for KeyObj {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for KeyObj {}

impl Hash for KeyObj {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl AsRef<[u8]> for KeyObj {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for KeyObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyObj({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl From<&[u8]> for KeyObj {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

/// Bounded pool deduplicating short heap-allocated key strings.
///
/// The pool holds strong references, so pooled allocations outlive the
/// entries that use them; the byte budget keeps that retention bounded.
/// When the budget is exhausted new keys simply skip interning.
pub struct InternPool {
    set: HashSet<Arc<[u8]>>,
    bytes: usize,
}

impl InternPool {
    pub fn new() -> Self {
        Self { set: HashSet::new(), bytes: 0 }
    }

    pub fn intern(&mut self, bytes: &[u8]) -> Arc<[u8]> {
        debug_assert!(bytes.len() <= KEY_INTERN_MAX);
        if let Some(existing) = self.set.get(bytes) {
            return existing.clone();
        }
        let arc: Arc<[u8]> = Arc::from(bytes);
        if self.bytes + bytes.len() <= KEY_INTERN_POOL_BYTES {
            self.bytes += bytes.len();
            self.set.insert(arc.clone());
        }
        arc
    }

    /// Total bytes retained by the pool, reported as `small_string_bytes`.
    pub fn small_string_bytes(&self) -> usize {
        self.bytes
    }
}

impl Default for InternPool {
    fn default() -> Self {
        Self::new()
    }
}
