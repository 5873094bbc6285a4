//! # Tiered Storage Hook
//!
//! Values can be offloaded to a per-shard backing file; the in-memory
//! entry then holds only an `(offset, size)` reference. This module owns
//! that file and a block-grained range allocator over it. The offload
//! policy itself (what to write and when) belongs to the storage backend
//! and is out of scope; the engine only needs `reserve`, `free` and the
//! read/write plumbing.
//!
//! Each shard opens `<prefix>-<shard, 4 digits>.ssd`. Allocations are
//! rounded up to [`TIERED_BLOCK_SIZE`]; freed ranges coalesce with their
//! neighbors so the free list stays short. The file grows by doubling when
//! no free range fits.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use crate::config::{TIERED_BLOCK_SIZE, TIERED_INITIAL_CAPACITY};
use crate::types::{DbIndex, ShardId};

/// Aggregated counters exposed to the stats surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct TieredStats {
    pub external_reads: u64,
    pub external_writes: u64,
    pub storage_capacity: u64,
    pub storage_reserved: u64,
}

impl std::ops::AddAssign for TieredStats {
    fn add_assign(&mut self, o: Self) {
        self.external_reads += o.external_reads;
        self.external_writes += o.external_writes;
        self.storage_capacity += o.storage_capacity;
        self.storage_reserved += o.storage_reserved;
    }
}

/// Per-shard backing file with a block-grained range allocator.
pub struct TieredStorage {
    path: PathBuf,
    file: File,
    capacity: u64,
    /// Sorted, non-adjacent free ranges as (offset, len).
    free_ranges: Vec<(u64, u64)>,
    stats: TieredStats,
}

impl TieredStorage {
    /// Opens (or creates) the backing file for `shard_id` under `prefix`.
    pub fn open(prefix: &Path, shard_id: ShardId) -> Result<Self> {
        let path = PathBuf::from(format!("{}-{:04}.ssd", prefix.display(), shard_id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("opening tiered backing file {}", path.display()))?;
        file.set_len(TIERED_INITIAL_CAPACITY)?;

        debug!(path = %path.display(), capacity = TIERED_INITIAL_CAPACITY, "tiered storage open");
        Ok(Self {
            path,
            file,
            capacity: TIERED_INITIAL_CAPACITY,
            free_ranges: vec![(0, TIERED_INITIAL_CAPACITY)],
            stats: TieredStats {
                storage_capacity: TIERED_INITIAL_CAPACITY,
                ..Default::default()
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> TieredStats {
        self.stats
    }

    fn blocks(size: u32) -> u64 {
        let size = size.max(1) as u64;
        size.div_ceil(TIERED_BLOCK_SIZE) * TIERED_BLOCK_SIZE
    }

    /// Reserves room for `size` bytes, growing the file if needed. Returns
    /// the offset of the reservation.
    pub fn reserve(&mut self, size: u32) -> Result<u64> {
        let want = Self::blocks(size);

        if let Some(pos) = self.free_ranges.iter().position(|&(_, len)| len >= want) {
            let (offset, len) = self.free_ranges[pos];
            if len == want {
                self.free_ranges.remove(pos);
            } else {
                self.free_ranges[pos] = (offset + want, len - want);
            }
            self.stats.storage_reserved += want;
            return Ok(offset);
        }

        // No fitting range: double the file until the tail range fits.
        let grow_from = self.capacity;
        let mut new_capacity = self.capacity * 2;
        while new_capacity - grow_from < want {
            new_capacity *= 2;
        }
        self.file
            .set_len(new_capacity)
            .wrap_err("growing tiered backing file")?;
        self.capacity = new_capacity;
        self.stats.storage_capacity = new_capacity;
        self.free_ranges.push((grow_from, new_capacity - grow_from));
        self.coalesce();

        self.reserve(size)
    }

    /// Returns a previously reserved range to the allocator. Called by the
    /// slice in `pre_update` when an externalized value is overwritten.
    pub fn free(&mut self, db: DbIndex, offset: u64, size: u32) {
        let len = Self::blocks(size);
        debug!(db, offset, len, "tiered free");
        debug_assert!(offset + len <= self.capacity);
        self.stats.storage_reserved = self.stats.storage_reserved.saturating_sub(len);
        self.free_ranges.push((offset, len));
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.free_ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.free_ranges.len());
        for &(offset, len) in &self.free_ranges {
            match merged.last_mut() {
                Some((last_off, last_len)) if *last_off + *last_len == offset => {
                    *last_len += len;
                }
                _ => merged.push((offset, len)),
            }
        }
        self.free_ranges = merged;
    }

    pub fn write(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        ensure!(
            offset + payload.len() as u64 <= self.capacity,
            "write past tiered capacity"
        );
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(payload)?;
        self.stats.external_writes += 1;
        Ok(())
    }

    pub fn read(&mut self, offset: u64, size: u32) -> Result<Vec<u8>> {
        ensure!(
            offset + size as u64 <= self.capacity,
            "read past tiered capacity"
        );
        let mut buf = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        self.stats.external_reads += 1;
        Ok(buf)
    }
}
