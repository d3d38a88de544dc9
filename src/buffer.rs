//! Fixed-pool buffer manager.
//!
//! A manager is configured once with an ordered list of bins. At setup the
//! backing allocator is asked for one region large enough for every slot of
//! every bin; the region is then carved into fixed-size slots that are handed
//! out as move-only [`Buffer`] descriptors and pushed back onto their bin's
//! free list when returned. The allocator is not touched again until
//! [`BufferManager::teardown`].
//!
//! Bin selection: the smallest bin whose element size fits the request and
//! still has a free slot. Bins with equal element size are tried in
//! configuration order.

use bytes::BytesMut;
use heapless::Vec as BoundedVec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const MAX_BINS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinConfig {
    pub buffer_size: usize,
    pub num_buffers: usize,
}

impl BinConfig {
    pub const fn new(buffer_size: usize, num_buffers: usize) -> Self {
        Self { buffer_size, num_buffers }
    }
}

/// Why an allocation could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exhaustion {
    /// Every bin large enough is currently empty.
    NoFreeSlot,
    /// No configured bin is large enough; a configuration defect.
    NoBinLargeEnough,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("out of buffers for a {requested} byte request ({reason:?})")]
    OutOfBuffers { requested: usize, reason: Exhaustion },
    #[error("buffer of manager {owner} (bin {bin}, slot {slot}) returned to manager {manager}")]
    ForeignDescriptor {
        manager: u32,
        owner: u32,
        bin: usize,
        slot: usize,
    },
    #[error("{requested} bytes do not fit a buffer of {capacity} bytes")]
    Overflow { requested: usize, capacity: usize },
    #[error("invalid bin configuration: {0}")]
    InvalidBins(&'static str),
    #[error("backing allocator refused {bytes} bytes")]
    AllocatorFailed { bytes: usize },
    #[error("buffer manager {0} has been torn down")]
    TornDown(u32),
}

/// Handle describing the region reserved from a [`BackingAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandle {
    pub id: u32,
    pub bytes: usize,
}

/// Memory source consulted once at setup and once at teardown.
pub trait BackingAllocator: Send + Sync {
    fn allocate(&self, id: u32, bytes: usize) -> Option<BytesMut>;
    fn free(&self, region: RegionHandle);
}

/// Heap-backed allocator that keeps count of what it handed out.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    outstanding: AtomicUsize,
    allocations: AtomicU32,
    frees: AtomicU32,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn allocation_count(&self) -> u32 {
        self.allocations.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> u32 {
        self.frees.load(Ordering::Acquire)
    }
}

impl BackingAllocator for HeapAllocator {
    fn allocate(&self, id: u32, bytes: usize) -> Option<BytesMut> {
        debug!(id, bytes, "reserving backing region");
        self.outstanding.fetch_add(bytes, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        Some(BytesMut::zeroed(bytes))
    }

    fn free(&self, region: RegionHandle) {
        debug!(id = region.id, bytes = region.bytes, "releasing backing region");
        self.outstanding.fetch_sub(region.bytes, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::AcqRel);
    }
}

/// Move-only descriptor for one pooled slot.
///
/// `len()` is the number of bytes in use, `capacity()` the slot size. The
/// descriptor must travel back to the manager that issued it.
#[derive(Debug)]
pub struct Buffer {
    manager: u32,
    bin: usize,
    slot: usize,
    size: usize,
    context: u32,
    data: BytesMut,
}

assert_not_impl_any!(Buffer: Clone, Copy);
assert_impl_all!(Buffer: Send);

impl Buffer {
    pub fn manager_id(&self) -> u32 {
        self.manager
    }

    pub fn bin(&self) -> usize {
        self.bin
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn set_context(&mut self, context: u32) {
        self.context = context;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    /// Whole slot, regardless of the in-use size.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub fn set_size(&mut self, size: usize) -> Result<(), BufferError> {
        if size > self.capacity() {
            return Err(BufferError::Overflow {
                requested: size,
                capacity: self.capacity(),
            });
        }
        self.size = size;
        Ok(())
    }

    /// Copies `bytes` into the slot and sets the in-use size to match.
    pub fn fill_from(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.set_size(bytes.len())?;
        self.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferManagerStats {
    pub total_buffers: u32,
    pub current_allocated: u32,
    pub high_water: u32,
    pub allocations: u32,
    pub no_free_slot: u32,
    pub oversize_requests: u32,
    pub foreign_returns: u32,
}

#[derive(Debug)]
struct Bin {
    config: BinConfig,
    free: Vec<(usize, BytesMut)>,
    in_use: Vec<bool>,
}

#[derive(Debug)]
struct Pool {
    bins: Vec<Bin>,
    order: BoundedVec<usize, MAX_BINS>,
    region: Option<RegionHandle>,
    torn_down: bool,
    stats: BufferManagerStats,
}

pub struct BufferManager {
    id: u32,
    allocator: Arc<dyn BackingAllocator>,
    pool: Mutex<Pool>,
}

assert_impl_all!(BufferManager: Send, Sync);

impl core::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferManager")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferManager {
    /// Reserves `Σ buffer_size × num_buffers` bytes from `allocator` and
    /// partitions them into slots.
    pub fn setup(
        id: u32,
        allocator: Arc<dyn BackingAllocator>,
        bins: &[BinConfig],
    ) -> Result<Self, BufferError> {
        if bins.is_empty() {
            return Err(BufferError::InvalidBins("no bins configured"));
        }
        if bins.len() > MAX_BINS {
            return Err(BufferError::InvalidBins("too many bins"));
        }
        if bins.iter().any(|b| b.buffer_size == 0 || b.num_buffers == 0) {
            return Err(BufferError::InvalidBins("bins need a non-zero size and count"));
        }

        let mut total: usize = 0;
        for bin in bins {
            total = bin
                .buffer_size
                .checked_mul(bin.num_buffers)
                .and_then(|bytes| total.checked_add(bytes))
                .ok_or(BufferError::InvalidBins("bin sizes overflow"))?;
        }

        let mut region = allocator
            .allocate(id, total)
            .ok_or(BufferError::AllocatorFailed { bytes: total })?;
        if region.len() < total {
            return Err(BufferError::AllocatorFailed { bytes: total });
        }

        let mut carved = Vec::with_capacity(bins.len());
        let mut total_buffers: u32 = 0;
        for config in bins {
            let mut free = Vec::with_capacity(config.num_buffers);
            for slot in 0..config.num_buffers {
                free.push((slot, region.split_to(config.buffer_size)));
            }
            // Pop order hands out slot 0 first.
            free.reverse();
            total_buffers += config.num_buffers as u32;
            carved.push(Bin {
                config: *config,
                free,
                in_use: vec![false; config.num_buffers],
            });
        }

        let mut order: BoundedVec<usize, MAX_BINS> = (0..bins.len()).collect();
        order.sort_by_key(|&index| (bins[index].buffer_size, index));

        info!(id, bins = bins.len(), bytes = total, "buffer manager ready");

        Ok(Self {
            id,
            allocator,
            pool: Mutex::new(Pool {
                bins: carved,
                order,
                region: Some(RegionHandle { id, bytes: total }),
                torn_down: false,
                stats: BufferManagerStats {
                    total_buffers,
                    ..BufferManagerStats::default()
                },
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn allocate(&self, size: usize) -> Result<Buffer, BufferError> {
        let mut guard = self.pool.lock();
        let pool = &mut *guard;
        if pool.torn_down {
            return Err(BufferError::TornDown(self.id));
        }

        let mut fits = false;
        for &index in pool.order.iter() {
            let bin = &mut pool.bins[index];
            if bin.config.buffer_size < size {
                continue;
            }
            fits = true;
            if let Some((slot, data)) = bin.free.pop() {
                bin.in_use[slot] = true;
                pool.stats.allocations = pool.stats.allocations.wrapping_add(1);
                pool.stats.current_allocated += 1;
                pool.stats.high_water = pool.stats.high_water.max(pool.stats.current_allocated);

                debug_assert!(
                    pool.stats.current_allocated <= pool.stats.total_buffers,
                    "allocated {} of {} buffers",
                    pool.stats.current_allocated,
                    pool.stats.total_buffers
                );

                return Ok(Buffer {
                    manager: self.id,
                    bin: index,
                    slot,
                    size,
                    context: 0,
                    data,
                });
            }
        }

        let reason = if fits {
            pool.stats.no_free_slot = pool.stats.no_free_slot.wrapping_add(1);
            Exhaustion::NoFreeSlot
        } else {
            pool.stats.oversize_requests = pool.stats.oversize_requests.wrapping_add(1);
            error!(id = self.id, size, "no bin large enough");
            Exhaustion::NoBinLargeEnough
        };
        warn!(id = self.id, size, ?reason, "buffer allocation failed");
        Err(BufferError::OutOfBuffers {
            requested: size,
            reason,
        })
    }

    pub fn deallocate(&self, buffer: Buffer) -> Result<(), BufferError> {
        let mut guard = self.pool.lock();
        let pool = &mut *guard;

        let foreign = BufferError::ForeignDescriptor {
            manager: self.id,
            owner: buffer.manager,
            bin: buffer.bin,
            slot: buffer.slot,
        };
        if buffer.manager != self.id {
            pool.stats.foreign_returns = pool.stats.foreign_returns.wrapping_add(1);
            error!(%foreign, "rejected buffer return");
            return Err(foreign);
        }
        if pool.torn_down {
            return Err(BufferError::TornDown(self.id));
        }

        let owned = pool.bins.get(buffer.bin).map_or(false, |bin| {
            bin.in_use.get(buffer.slot).copied().unwrap_or(false)
                && buffer.data.len() == bin.config.buffer_size
        });
        if !owned {
            pool.stats.foreign_returns = pool.stats.foreign_returns.wrapping_add(1);
            error!(%foreign, "rejected buffer return");
            return Err(foreign);
        }

        let bin = &mut pool.bins[buffer.bin];
        bin.in_use[buffer.slot] = false;
        bin.free.push((buffer.slot, buffer.data));
        pool.stats.current_allocated -= 1;
        Ok(())
    }

    /// Releases the backing region. Idempotent; only the first call reaches
    /// the allocator.
    pub fn teardown(&self) {
        let mut guard = self.pool.lock();
        if guard.torn_down {
            return;
        }
        if guard.stats.current_allocated > 0 {
            warn!(
                id = self.id,
                outstanding = guard.stats.current_allocated,
                "tearing down with buffers still in use"
            );
        }
        for bin in &mut guard.bins {
            bin.free.clear();
        }
        guard.torn_down = true;
        if let Some(region) = guard.region.take() {
            self.allocator.free(region);
        }
        info!(id = self.id, "buffer manager torn down");
    }

    pub fn stats(&self) -> BufferManagerStats {
        self.pool.lock().stats
    }

    /// Free slots per bin, in configuration order.
    pub fn free_counts(&self) -> Vec<usize> {
        self.pool.lock().bins.iter().map(|bin| bin.free.len()).collect()
    }

    pub fn bins(&self) -> Vec<BinConfig> {
        self.pool.lock().bins.iter().map(|bin| bin.config).collect()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
