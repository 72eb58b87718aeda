//! Bounded arena of reusable render surfaces.
//!
//! Surface construction is expensive next to compositing onto an existing
//! one, so a batch pays the allocation once per pool slot instead of once
//! per row. The pool is the only shared mutable resource in a batch; each
//! surface is exclusively owned by one in-flight row between acquire and
//! release, enforced by the semaphore + idle-list protocol rather than any
//! external locking.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tokio::sync::Semaphore;

use crate::{
    foundation::error::{PinforgeError, PinforgeResult},
    render::surface::Surface,
};

pub const POOL_SIZE_ENV: &str = "PINFORGE_POOL_SIZE";
pub const MEMORY_LIMIT_ENV: &str = "PINFORGE_MEMORY_LIMIT_MB";

const DEFAULT_MEMORY_LIMIT_MB: u64 = 1024;
/// Fraction of the memory ceiling reserved for non-pool overhead.
const MEMORY_HEADROOM: f64 = 0.30;
const MAX_POOL_SIZE: usize = 32;
/// Working-set multiplier over raw pixel bytes: render-context strips,
/// display list, decoded row images, export scratch.
const SURFACE_OVERHEAD_FACTOR: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: usize,
}

impl PoolConfig {
    pub fn fixed(size: usize) -> Self {
        Self {
            size: size.clamp(1, MAX_POOL_SIZE),
        }
    }

    /// Environment-derived pool size for a batch at the given canvas size.
    ///
    /// `PINFORGE_POOL_SIZE` wins outright; otherwise the size is computed so
    /// that `size * estimated per-surface memory` stays under
    /// `PINFORGE_MEMORY_LIMIT_MB` (default 1024) with headroom reserved.
    pub fn from_env(width: u32, height: u32) -> Self {
        if let Some(size) = read_env_usize(POOL_SIZE_ENV) {
            let cfg = Self::fixed(size);
            tracing::debug!(size = cfg.size, "pool size from {POOL_SIZE_ENV}");
            return cfg;
        }

        let limit_mb = read_env_u64(MEMORY_LIMIT_ENV).unwrap_or(DEFAULT_MEMORY_LIMIT_MB);
        let cfg = Self {
            size: derive_pool_size(limit_mb, width, height),
        };
        tracing::debug!(
            size = cfg.size,
            limit_mb,
            width,
            height,
            "pool size derived from memory limit"
        );
        cfg
    }
}

fn derive_pool_size(limit_mb: u64, width: u32, height: u32) -> usize {
    const MB: u64 = 1024 * 1024;
    let per_surface = (u64::from(width) * u64::from(height) * 4)
        .saturating_mul(SURFACE_OVERHEAD_FACTOR)
        .max(MB);
    let budget = ((limit_mb * MB) as f64 * (1.0 - MEMORY_HEADROOM)) as u64;
    usize::try_from(budget / per_surface)
        .unwrap_or(MAX_POOL_SIZE)
        .clamp(1, MAX_POOL_SIZE)
}

fn read_env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&n| n > 0)
}

/// Fixed-size pool of pre-allocated surfaces with async checkout.
pub struct SurfacePool {
    idle: Mutex<Vec<Surface>>,
    permits: Semaphore,
    size: usize,
    checked_out: AtomicUsize,
    high_water: AtomicUsize,
    cleaned: AtomicBool,
    cleanup_calls: AtomicUsize,
}

impl SurfacePool {
    /// Pre-allocate exactly `size` surfaces at the batch's fixed output
    /// dimensions. Construction failure is fatal for the whole batch: it
    /// means the environment cannot safely hold the configured pool.
    pub fn new(size: usize, width: u32, height: u32) -> PinforgeResult<Self> {
        if size == 0 {
            return Err(PinforgeError::pool("pool size must be >= 1"));
        }
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(
                Surface::new(width, height)
                    .map_err(|e| PinforgeError::pool(format!("surface allocation failed: {e}")))?,
            );
        }
        Ok(Self {
            idle: Mutex::new(idle),
            permits: Semaphore::new(size),
            size,
            checked_out: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            cleaned: AtomicBool::new(false),
            cleanup_calls: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Surfaces currently checked out; never exceeds [`SurfacePool::size`].
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Peak concurrent checkouts over the pool's lifetime.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    /// Check a surface out, waiting while all surfaces are in use.
    ///
    /// The returned guard gives exclusive access; dropping it clears the
    /// surface and returns it to the idle set, so release runs on every
    /// exit path of a row.
    pub async fn acquire(self: &Arc<Self>) -> PinforgeResult<PooledSurface> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PinforgeError::pool("surface pool is closed"))?;
        permit.forget();

        let surface = {
            let mut idle = self
                .idle
                .lock()
                .map_err(|_| PinforgeError::pool("surface pool lock poisoned"))?;
            idle.pop()
                .ok_or_else(|| PinforgeError::pool("surface pool is empty (cleanup raced)"))?
        };

        let now = self.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);

        Ok(PooledSurface {
            surface: Some(surface),
            pool: Arc::clone(self),
        })
    }

    /// Destroy every surface and refuse further checkouts.
    ///
    /// Runs exactly once per batch, on success and on failure; surfaces
    /// still checked out are dropped when their guards release.
    pub fn cleanup(&self) {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        if self.cleaned.swap(true, Ordering::SeqCst) {
            tracing::warn!("surface pool cleanup invoked more than once");
            return;
        }
        self.permits.close();
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }
}

/// Exclusive checkout of one pooled surface.
pub struct PooledSurface {
    surface: Option<Surface>,
    pool: Arc<SurfacePool>,
}

impl std::ops::Deref for PooledSurface {
    type Target = Surface;

    fn deref(&self) -> &Surface {
        self.surface.as_ref().expect("surface present until drop")
    }
}

impl std::ops::DerefMut for PooledSurface {
    fn deref_mut(&mut self) -> &mut Surface {
        self.surface.as_mut().expect("surface present until drop")
    }
}

impl Drop for PooledSurface {
    fn drop(&mut self) {
        let Some(mut surface) = self.surface.take() else {
            return;
        };
        self.pool.checked_out.fetch_sub(1, Ordering::SeqCst);

        if self.pool.cleaned.load(Ordering::SeqCst) {
            // Pool already torn down; let the surface drop here.
            return;
        }

        surface.clear();
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(surface);
        }
        self.pool.permits.add_permits(1);
    }
}
