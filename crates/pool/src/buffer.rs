//! Tiered buffer pool: fixed-size byte buffers reused across read
//! loops instead of allocated fresh per chunk.
//!
//! Tiers are 4/8/16/32/64 KiB. `acquire` picks the smallest tier that
//! fits the requested size; `release` zero-fills before returning the
//! buffer to its tier (the bytes may have carried tenant data) and is
//! a no-op once that tier is already at capacity.

use std::sync::Arc;

use parking_lot::Mutex;

const TIER_SIZES: [usize; 5] = [4 * 1024, 8 * 1024, 16 * 1024, 32 * 1024, 64 * 1024];
const DEFAULT_MAX_PER_TIER: usize = 32;

struct Tier {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

/// A bounded set of per-size free lists.
pub struct BufferPool {
    tiers: Vec<Tier>,
    max_per_tier: usize,
}

impl BufferPool {
    /// Build a pool with the standard 4/8/16/32/64 KiB tiers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_per_tier(DEFAULT_MAX_PER_TIER)
    }

    /// Build a pool with a custom per-tier cap (exercised by tests).
    #[must_use]
    pub fn with_max_per_tier(max_per_tier: usize) -> Self {
        Self {
            tiers: TIER_SIZES
                .iter()
                .map(|&size| Tier {
                    size,
                    free: Mutex::new(Vec::new()),
                })
                .collect(),
            max_per_tier,
        }
    }

    /// Borrow a buffer of at least `min_size` bytes. Sizes larger than
    /// the biggest tier get a one-off allocation that is never
    /// returned to a free list.
    pub fn acquire(self: &Arc<Self>, min_size: usize) -> PooledBuffer {
        let tier_index = self.tiers.iter().position(|t| t.size >= min_size);

        let buf = match tier_index {
            Some(idx) => {
                let mut free = self.tiers[idx].free.lock();
                free.pop().unwrap_or_else(|| vec![0u8; self.tiers[idx].size])
            }
            None => vec![0u8; min_size],
        };

        PooledBuffer {
            pool: self.clone(),
            tier_index,
            buf: Some(buf),
        }
    }

    fn release(&self, tier_index: Option<usize>, mut buf: Vec<u8>) {
        let Some(idx) = tier_index else { return };
        buf.iter_mut().for_each(|b| *b = 0);
        let mut free = self.tiers[idx].free.lock();
        if free.len() < self.max_per_tier {
            free.push(buf);
        }
    }

    /// Number of buffers currently idle in each tier, smallest first.
    /// Exposed for tests and diagnostics.
    #[must_use]
    pub fn idle_counts(&self) -> Vec<usize> {
        self.tiers.iter().map(|t| t.free.lock().len()).collect()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of a [`BufferPool`]. Zero-filled and returned
/// to its tier's free list on drop, unless the tier is full.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    tier_index: Option<usize>,
    buf: Option<Vec<u8>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(self.tier_index, buf);
        }
    }
}
