//! # Intent Locks
//!
//! Reference-counted intent locks keyed by key bytes, with the classic
//! two-mode compatibility matrix: SHARED is compatible with SHARED,
//! EXCLUSIVE is compatible with nothing.
//!
//! Locks are associated with keys, not entries: a lock record may exist
//! without a prime-table entry and vice versa. `acquire` always takes the
//! count and reports whether the request was *immediately granted*; a
//! false return means the caller must wait or suspend, but the count is
//! held and must be released either way. Records are created on first
//! acquire and erased by the slice once both counters return to zero.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn name(&self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

/// Per-key intent-lock record.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntentLock {
    shared: u32,
    exclusive: u32,
}

impl IntentLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the count in `mode` and reports whether the request is
    /// immediately granted under the compatibility matrix.
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => {
                self.shared += 1;
                self.exclusive == 0
            }
            LockMode::Exclusive => {
                self.exclusive += 1;
                self.shared == 0 && self.exclusive == 1
            }
        }
    }

    /// Non-mutating grantability check.
    pub fn check(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive == 0,
            LockMode::Exclusive => self.shared == 0 && self.exclusive == 0,
        }
    }

    pub fn release(&mut self, mode: LockMode) {
        self.release_count(mode, 1);
    }

    pub fn release_count(&mut self, mode: LockMode, count: u32) {
        match mode {
            LockMode::Shared => {
                assert!(self.shared >= count, "shared lock count underflow");
                self.shared -= count;
            }
            LockMode::Exclusive => {
                assert!(self.exclusive >= count, "exclusive lock count underflow");
                self.exclusive -= count;
            }
        }
    }

    pub fn is_free(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }
}
