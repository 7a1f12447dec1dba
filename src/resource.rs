//! System resource detection and adaptive tuning.
//!
//! Detects available RAM and CPU cores, then computes serving parameters
//! that adapt cache budgets and pool sizes to the host machine. Stateless:
//! each call to `ResourceManager::auto_tune()` re-probes the system.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ── Constants ───────────────────────────────────────────────────────

const MB: usize = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Cache budget floor per worker (64 MB).
const CACHE_BUDGET_MIN: usize = 64 * MB;

/// Cache budget ceiling per worker (8 GB).
const CACHE_BUDGET_MAX: usize = 8 * 1024 * MB;

/// Fraction of available memory allocated across all worker caches.
const CACHE_BUDGET_FRACTION: f64 = 0.25;

/// Fraction of each cache budget filled during pre-warm.
pub const DEFAULT_WARM_FRACTION: f64 = 0.9;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Probe the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// Memory pressure indicator (0.0 = no pressure, 1.0 = critical).
    ///
    /// Formula: `1.0 - (available / total)`.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── ServingProfile ──────────────────────────────────────────────────

/// Adaptive parameters computed from system resources.
#[derive(Debug, Clone)]
pub struct ServingProfile {
    /// Feature cache budget per worker, in bytes.
    pub cache_budget_bytes: usize,
    /// Threads in the request dispatch pool.
    pub pool_size: usize,
    /// Pending request slots before new submissions are rejected.
    pub queue_depth: usize,
    /// Memory pressure at detection time (0.0 = no pressure, 1.0 = critical).
    pub memory_pressure: f64,
}

impl ServingProfile {
    /// Compute a serving profile from detected resources for `num_workers`
    /// co-resident caches.
    ///
    /// Heuristics:
    /// - `cache_budget_bytes`: `clamp(available * 0.25 / workers, 64 MB, 8 GB)`.
    /// - `pool_size`: RAM < 4 GB -> 2, else `clamp(cpu, 2, 16)`.
    /// - `queue_depth`: `pool_size * 8`.
    pub fn from_resources(res: &SystemResources, num_workers: usize) -> Self {
        let total_gb = res.total_memory_bytes as f64 / GB as f64;
        let workers = num_workers.max(1);

        let raw_budget =
            (res.available_memory_bytes as f64 * CACHE_BUDGET_FRACTION) as usize / workers;
        let cache_budget_bytes = raw_budget.clamp(CACHE_BUDGET_MIN, CACHE_BUDGET_MAX);

        let pool_size = if total_gb < 4.0 {
            2
        } else {
            res.cpu_count.clamp(2, 16)
        };

        Self {
            cache_budget_bytes,
            pool_size,
            queue_depth: pool_size * 8,
            memory_pressure: res.memory_pressure(),
        }
    }
}

impl Default for ServingProfile {
    /// Conservative defaults suitable for tests and unknown environments.
    fn default() -> Self {
        Self {
            cache_budget_bytes: 256 * MB,
            pool_size: 4,
            queue_depth: 32,
            memory_pressure: 0.0,
        }
    }
}

// ── ResourceManager ─────────────────────────────────────────────────

/// Stateless utility: detect system resources and compute a serving profile.
pub struct ResourceManager;

impl ResourceManager {
    /// Probe the system and return an adaptive serving profile.
    pub fn auto_tune(num_workers: usize) -> ServingProfile {
        let resources = SystemResources::detect();
        ServingProfile::from_resources(&resources, num_workers)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
