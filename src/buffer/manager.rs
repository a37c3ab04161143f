//! Fixed-size buffer pools for pipeline attachment points
//!
//! One `BufferManager` owns the hardware buffers for a single attachment point
//! ("ISP output", "JPEG output", ...). The pool is created once at
//! stream-configuration time and deinitialized at teardown; individual slots
//! circulate continuously while streaming. At most one in-flight frame may
//! hold a given slot; every return goes through [`BufferManager::release`],
//! which rejects double returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffer::alloc::{AllocError, BufferAllocator, HeapAllocator, MappedAllocator, PlaneMemory};
use crate::error::{PipelineError, Result};

/// How slot memory is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AllocMode {
    /// Allocate `max_count` slots up front at `allocate()` time.
    AllAtOnce,
    /// Allocate `min_count` up front, grow lazily on acquire up to `max_count`.
    OnDemand,
}

/// Kind of backing memory behind the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PoolType {
    Heap,
    Mapped,
    /// Contiguous/reserved memory for hardware DMA. Availability is transient
    /// and contended, so allocation is retried on a bounded budget.
    Reserved,
}

/// Pool geometry and policy, fixed at configure time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    pub plane_count: usize,
    pub plane_sizes: Vec<usize>,
    pub bytes_per_line: Vec<usize>,
    pub min_count: usize,
    pub max_count: usize,
    pub batch_size: usize,
    pub pool_type: PoolType,
    pub alloc_mode: AllocMode,
    /// Append a metadata plane (per-frame shot metadata) after the pixel planes.
    pub attach_meta_plane: bool,
    /// Bounded retry budget for reserved-memory allocation.
    pub alloc_retry_count: u32,
    pub alloc_retry_delay: Duration,
}

/// Size of the appended metadata plane.
pub const META_PLANE_SIZE: usize = 4096;

/// Default reserved-memory retry policy: availability is transient across
/// camera instances, so a short bounded wait usually succeeds.
pub const RESERVED_ALLOC_RETRY_COUNT: u32 = 20;
pub const RESERVED_ALLOC_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Poll quantum for [`BufferManager::wait_for_available`].
const AVAILABLE_POLL_QUANTUM: Duration = Duration::from_millis(20);

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            plane_count: 1,
            plane_sizes: vec![0],
            bytes_per_line: vec![0],
            min_count: 0,
            max_count: 0,
            batch_size: 1,
            pool_type: PoolType::Heap,
            alloc_mode: AllocMode::AllAtOnce,
            attach_meta_plane: false,
            alloc_retry_count: RESERVED_ALLOC_RETRY_COUNT,
            alloc_retry_delay: RESERVED_ALLOC_RETRY_DELAY,
        }
    }
}

/// Lightweight handle to one pool slot, bound into frames while in flight.
/// The backing memory stays inside the owning manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub index: usize,
    pub plane_sizes: Vec<usize>,
    /// Index of the metadata plane within `plane_sizes`, when attached.
    pub meta_plane: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Available, content undefined.
    Free,
    /// Held by exactly one in-flight frame.
    InUse,
    /// Returned via the cancel path: available again, content preserved.
    /// Preferred for reuse so display-visible contents survive.
    Cancelled,
}

struct Slot {
    planes: Vec<PlaneMemory>,
    state: SlotState,
}

struct Inner {
    config: Option<PoolConfig>,
    slots: Vec<Slot>,
}

/// Owner of a fixed pool of hardware buffers for one attachment point.
pub struct BufferManager {
    name: String,
    allocator: Box<dyn BufferAllocator>,
    inner: Mutex<Inner>,
}

impl BufferManager {
    /// Pool with an allocator chosen from the configured [`PoolType`] at
    /// `configure` time. Reserved pools use the heap allocator here; the real
    /// DMA allocator is injected via [`BufferManager::with_allocator`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allocator: Box::new(HeapAllocator),
            inner: Mutex::new(Inner {
                config: None,
                slots: Vec::new(),
            }),
        }
    }

    pub fn with_allocator(name: impl Into<String>, allocator: Box<dyn BufferAllocator>) -> Self {
        Self {
            name: name.into(),
            allocator,
            inner: Mutex::new(Inner {
                config: None,
                slots: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate and store pool geometry. Fails on inconsistent plane layout
    /// or an inverted count range; nothing is allocated yet.
    pub fn configure(&self, mut config: PoolConfig) -> Result<()> {
        if config.plane_count == 0 {
            return Err(PipelineError::Config(format!(
                "pool '{}': plane_count is zero",
                self.name
            )));
        }
        if config.plane_sizes.len() != config.plane_count {
            return Err(PipelineError::Config(format!(
                "pool '{}': {} plane sizes for {} planes",
                self.name,
                config.plane_sizes.len(),
                config.plane_count
            )));
        }
        if config.plane_sizes.iter().any(|&s| s == 0) {
            return Err(PipelineError::Config(format!(
                "pool '{}': zero-sized plane",
                self.name
            )));
        }
        if !config.bytes_per_line.is_empty() && config.bytes_per_line.len() != config.plane_count {
            return Err(PipelineError::Config(format!(
                "pool '{}': bytes_per_line length mismatch",
                self.name
            )));
        }
        if config.min_count == 0 || config.max_count == 0 {
            return Err(PipelineError::Config(format!(
                "pool '{}': zero buffer count",
                self.name
            )));
        }
        if config.min_count > config.max_count {
            return Err(PipelineError::Config(format!(
                "pool '{}': min_count {} > max_count {}",
                self.name, config.min_count, config.max_count
            )));
        }
        if config.batch_size == 0 {
            config.batch_size = 1;
        }

        let mut inner = self.lock();
        if !inner.slots.is_empty() {
            return Err(PipelineError::Config(format!(
                "pool '{}': reconfigure while allocated",
                self.name
            )));
        }
        inner.config = Some(config);
        Ok(())
    }

    /// Perform the backing allocation for the pool. `AllAtOnce` pools fill to
    /// `max_count`; `OnDemand` pools fill to `min_count` and grow on acquire.
    pub fn allocate(&self) -> Result<()> {
        let mut inner = self.lock();
        let config = inner
            .config
            .clone()
            .ok_or_else(|| PipelineError::Config(format!("pool '{}': not configured", self.name)))?;

        if !inner.slots.is_empty() {
            debug!(pool = %self.name, "pool already allocated");
            return Ok(());
        }

        let target = match config.alloc_mode {
            AllocMode::AllAtOnce => config.max_count,
            AllocMode::OnDemand => config.min_count,
        };

        for _ in 0..target {
            let slot = self.alloc_slot(&config)?;
            inner.slots.push(slot);
        }

        info!(
            pool = %self.name,
            slots = inner.slots.len(),
            max = config.max_count,
            "buffer pool allocated"
        );
        Ok(())
    }

    /// Hand out a free slot. Cancel-returned slots are preferred so preserved
    /// content gets reused before untouched memory.
    pub fn acquire(&self) -> Result<(usize, Buffer)> {
        let mut inner = self.lock();
        let config = inner
            .config
            .clone()
            .ok_or_else(|| PipelineError::Config(format!("pool '{}': not configured", self.name)))?;

        let pick = inner
            .slots
            .iter()
            .position(|s| s.state == SlotState::Cancelled)
            .or_else(|| inner.slots.iter().position(|s| s.state == SlotState::Free));

        let index = match pick {
            Some(i) => i,
            None => {
                if config.alloc_mode == AllocMode::OnDemand && inner.slots.len() < config.max_count
                {
                    let slot = self.alloc_slot(&config)?;
                    inner.slots.push(slot);
                    inner.slots.len() - 1
                } else {
                    return Err(PipelineError::Exhausted {
                        pool: self.name.clone(),
                    });
                }
            }
        };

        inner.slots[index].state = SlotState::InUse;
        let buffer = Self::make_handle(index, &config);
        Ok((index, buffer))
    }

    /// Bounded poll loop used where buffers are expected to free up shortly
    /// (the ISP-output availability wait). Timeout is transient, not fatal.
    pub fn wait_for_available(&self, timeout: Duration) -> Result<()> {
        self.poll_available(timeout, None)
    }

    /// Same bounded poll, but unblocks with [`PipelineError::Stopped`] as soon
    /// as `stop` is raised, so pipeline teardown never waits out the budget.
    pub fn wait_for_available_until(&self, timeout: Duration, stop: &AtomicBool) -> Result<()> {
        self.poll_available(timeout, Some(stop))
    }

    fn poll_available(&self, timeout: Duration, stop: Option<&AtomicBool>) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(stop) = stop {
                if stop.load(Ordering::Acquire) {
                    return Err(PipelineError::Stopped);
                }
            }
            if self.available_count() > 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(pool = %self.name, ?timeout, "no buffer became available");
                return Err(PipelineError::Exhausted {
                    pool: self.name.clone(),
                });
            }
            std::thread::sleep(AVAILABLE_POLL_QUANTUM);
        }
    }

    /// Return a slot to the pool. `keep_for_reuse` is the cancel path: the
    /// slot content is preserved (display-compositor-visible buffers).
    /// Returning a slot that is not in use is an error, never silent.
    pub fn release(&self, index: usize, keep_for_reuse: bool) -> Result<()> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .get_mut(index)
            .ok_or(PipelineError::InvalidRelease {
                pool: self.name.clone(),
                index,
                reason: "index out of range",
            })?;
        if slot.state != SlotState::InUse {
            return Err(PipelineError::InvalidRelease {
                pool: self.name.clone(),
                index,
                reason: "slot not in use (double release?)",
            });
        }
        slot.state = if keep_for_reuse {
            SlotState::Cancelled
        } else {
            SlotState::Free
        };
        Ok(())
    }

    pub fn available_count(&self) -> usize {
        let inner = self.lock();
        let free = inner
            .slots
            .iter()
            .filter(|s| s.state != SlotState::InUse)
            .count();
        // OnDemand headroom counts as available: acquire can still grow.
        let headroom = inner
            .config
            .as_ref()
            .filter(|c| c.alloc_mode == AllocMode::OnDemand)
            .map(|c| c.max_count.saturating_sub(inner.slots.len()))
            .unwrap_or(0);
        free + headroom
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|s| s.state == SlotState::InUse)
            .count()
    }

    pub fn is_allocated(&self) -> bool {
        !self.lock().slots.is_empty()
    }

    /// Free the whole pool. Deinit with in-flight slots is a defect in the
    /// caller; it is logged and the pool is torn down anyway so one leaked
    /// stream cannot wedge the process.
    pub fn deinit(&self) {
        let mut inner = self.lock();
        let in_flight = inner
            .slots
            .iter()
            .filter(|s| s.state == SlotState::InUse)
            .count();
        if in_flight != 0 {
            warn!(
                pool = %self.name,
                in_flight,
                "deinit with buffers still in flight"
            );
            debug_assert!(false, "deinit with in-flight buffers");
        }
        inner.slots.clear();
        inner.config = None;
    }

    fn alloc_slot(&self, config: &PoolConfig) -> Result<Slot> {
        let mut sizes = config.plane_sizes.clone();
        if config.attach_meta_plane {
            sizes.push(META_PLANE_SIZE);
        }

        let mut planes = Vec::with_capacity(sizes.len());
        for &size in &sizes {
            planes.push(self.alloc_plane_retrying(size, config)?);
        }
        Ok(Slot {
            planes,
            state: SlotState::Free,
        })
    }

    /// Reserved memory is contended across camera instances; retry a bounded
    /// number of times before reporting a hard error to the stream caller.
    fn alloc_plane_retrying(&self, size: usize, config: &PoolConfig) -> Result<PlaneMemory> {
        let budget = match config.pool_type {
            PoolType::Reserved => config.alloc_retry_count.max(1),
            PoolType::Heap | PoolType::Mapped => 1,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match config.pool_type {
                PoolType::Mapped => MappedAllocator.alloc_plane(size),
                PoolType::Heap | PoolType::Reserved => self.allocator.alloc_plane(size),
            };
            match result {
                Ok(plane) => return Ok(plane),
                Err(AllocError::Transient) if attempts < budget => {
                    debug!(
                        pool = %self.name,
                        attempts,
                        budget,
                        "reserved memory busy, retrying"
                    );
                    std::thread::sleep(config.alloc_retry_delay);
                }
                Err(e) => {
                    return Err(PipelineError::Allocation {
                        attempts,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    fn make_handle(index: usize, config: &PoolConfig) -> Buffer {
        let mut plane_sizes = config.plane_sizes.clone();
        let meta_plane = if config.attach_meta_plane {
            plane_sizes.push(META_PLANE_SIZE);
            Some(plane_sizes.len() - 1)
        } else {
            None
        };
        Buffer {
            index,
            plane_sizes,
            meta_plane,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock scope is always one call into one manager; poisoning only
        // happens if a panic escaped a slot operation.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("name", &self.name)
            .field("available", &self.available_count())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pool(min: usize, max: usize) -> BufferManager {
        let mgr = BufferManager::new("test");
        mgr.configure(PoolConfig {
            plane_count: 2,
            plane_sizes: vec![1024, 512],
            bytes_per_line: vec![64, 32],
            min_count: min,
            max_count: max,
            ..PoolConfig::default()
        })
        .unwrap();
        mgr.allocate().unwrap();
        mgr
    }

    #[test]
    fn rejects_inconsistent_geometry() {
        let mgr = BufferManager::new("bad");
        let err = mgr
            .configure(PoolConfig {
                plane_count: 2,
                plane_sizes: vec![1024, 0],
                min_count: 1,
                max_count: 1,
                ..PoolConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let err = mgr
            .configure(PoolConfig {
                plane_count: 1,
                plane_sizes: vec![1024],
                min_count: 4,
                max_count: 2,
                ..PoolConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn exhaustion_then_release_frees_the_same_slot() {
        let mgr = pool(4, 4);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(mgr.acquire().unwrap());
        }
        assert!(matches!(
            mgr.acquire(),
            Err(PipelineError::Exhausted { .. })
        ));

        let (freed_index, _) = held.remove(1);
        mgr.release(freed_index, false).unwrap();
        let (index, _) = mgr.acquire().unwrap();
        assert_eq!(index, freed_index);
    }

    #[test]
    fn double_release_is_rejected() {
        let mgr = pool(2, 2);
        let (index, _) = mgr.acquire().unwrap();
        mgr.release(index, false).unwrap();
        assert!(matches!(
            mgr.release(index, false),
            Err(PipelineError::InvalidRelease { .. })
        ));
        assert!(matches!(
            mgr.release(99, false),
            Err(PipelineError::InvalidRelease { .. })
        ));
    }

    #[test]
    fn cancelled_slot_is_preferred_for_reuse() {
        let mgr = pool(3, 3);
        let (a, _) = mgr.acquire().unwrap();
        let (b, _) = mgr.acquire().unwrap();
        mgr.release(a, false).unwrap();
        mgr.release(b, true).unwrap(); // cancel path, content preserved
        let (next, _) = mgr.acquire().unwrap();
        assert_eq!(next, b);
    }

    #[test]
    fn on_demand_grows_to_max_then_exhausts() {
        let mgr = BufferManager::new("lazy");
        mgr.configure(PoolConfig {
            plane_count: 1,
            plane_sizes: vec![256],
            min_count: 1,
            max_count: 3,
            alloc_mode: AllocMode::OnDemand,
            ..PoolConfig::default()
        })
        .unwrap();
        mgr.allocate().unwrap();
        assert_eq!(mgr.available_count(), 3);

        let _a = mgr.acquire().unwrap();
        let _b = mgr.acquire().unwrap();
        let _c = mgr.acquire().unwrap();
        assert!(matches!(
            mgr.acquire(),
            Err(PipelineError::Exhausted { .. })
        ));
    }

    #[test]
    fn meta_plane_is_appended() {
        let mgr = BufferManager::new("meta");
        mgr.configure(PoolConfig {
            plane_count: 1,
            plane_sizes: vec![256],
            min_count: 1,
            max_count: 1,
            attach_meta_plane: true,
            ..PoolConfig::default()
        })
        .unwrap();
        mgr.allocate().unwrap();
        let (_, buffer) = mgr.acquire().unwrap();
        assert_eq!(buffer.plane_sizes.len(), 2);
        assert_eq!(buffer.meta_plane, Some(1));
        assert_eq!(buffer.plane_sizes[1], META_PLANE_SIZE);
    }

    struct Flaky {
        failures: AtomicU32,
    }

    impl BufferAllocator for Flaky {
        fn alloc_plane(&self, size: usize) -> std::result::Result<PlaneMemory, AllocError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                if f > 0 { Some(f - 1) } else { None }
            }).is_ok()
            {
                Err(AllocError::Transient)
            } else {
                HeapAllocator.alloc_plane(size)
            }
        }
    }

    #[test]
    fn reserved_allocation_retries_transient_failures() {
        let mgr = BufferManager::with_allocator(
            "reserved",
            Box::new(Flaky {
                failures: AtomicU32::new(2),
            }),
        );
        mgr.configure(PoolConfig {
            plane_count: 1,
            plane_sizes: vec![128],
            min_count: 1,
            max_count: 1,
            pool_type: PoolType::Reserved,
            alloc_retry_count: 5,
            alloc_retry_delay: Duration::from_millis(1),
            ..PoolConfig::default()
        })
        .unwrap();
        mgr.allocate().unwrap();
        assert!(mgr.is_allocated());
    }

    #[test]
    fn reserved_allocation_fails_after_retry_budget() {
        let mgr = BufferManager::with_allocator(
            "reserved",
            Box::new(Flaky {
                failures: AtomicU32::new(100),
            }),
        );
        mgr.configure(PoolConfig {
            plane_count: 1,
            plane_sizes: vec![128],
            min_count: 1,
            max_count: 1,
            pool_type: PoolType::Reserved,
            alloc_retry_count: 3,
            alloc_retry_delay: Duration::from_millis(1),
            ..PoolConfig::default()
        })
        .unwrap();
        let err = mgr.allocate().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Allocation { attempts: 3, .. }
        ));
    }

    #[test]
    fn stop_unblocks_the_availability_wait() {
        use std::sync::Arc;

        let mgr = Arc::new(pool(1, 1));
        let _held = mgr.acquire().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let waiter = {
            let mgr = mgr.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let result = mgr.wait_for_available_until(Duration::from_secs(10), &stop);
                (started.elapsed(), result)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Release);

        let (elapsed, result) = waiter.join().unwrap();
        assert!(matches!(result, Err(PipelineError::Stopped)));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_for_available_times_out_without_release() {
        let mgr = pool(1, 1);
        let (index, _) = mgr.acquire().unwrap();
        assert!(mgr.wait_for_available(Duration::from_millis(50)).is_err());
        mgr.release(index, false).unwrap();
        assert!(mgr.wait_for_available(Duration::from_millis(50)).is_ok());
    }
}
