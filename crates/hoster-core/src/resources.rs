//! Resource requirement and capacity arithmetic.

use serde::{Deserialize, Serialize};

/// CPU, memory, and disk, as requested by a template or reserved by a
/// deployment. Memory and disk are in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl ResourceSpec {
    pub fn new(cpu_cores: f64, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_mb,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0.0 && self.memory_mb == 0 && self.disk_mb == 0
    }

    /// Whether this request fits inside `available` on every axis.
    pub fn fits_within(&self, available: &ResourceSpec) -> bool {
        self.cpu_cores <= available.cpu_cores
            && self.memory_mb <= available.memory_mb
            && self.disk_mb <= available.disk_mb
    }

    pub fn plus(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
        }
    }

    /// Per-axis difference, clamped at zero.
    pub fn minus(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu_cores: (self.cpu_cores - other.cpu_cores).max(0.0),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
        }
    }
}

/// A node's total capacity alongside the portion currently reserved.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub total: ResourceSpec,
    pub used: ResourceSpec,
}

impl Capacity {
    pub fn new(total: ResourceSpec) -> Self {
        Self {
            total,
            used: ResourceSpec::default(),
        }
    }

    pub fn free(&self) -> ResourceSpec {
        self.total.minus(&self.used)
    }

    pub fn has_room_for(&self, request: &ResourceSpec) -> bool {
        request.fits_within(&self.free())
    }

    /// Free fraction per axis, each in `[0, 1]`. A zero-capacity axis counts
    /// as fully occupied.
    pub fn free_fractions(&self) -> (f64, f64, f64) {
        let frac = |free: f64, total: f64| if total > 0.0 { free / total } else { 0.0 };
        let free = self.free();
        (
            frac(free.cpu_cores, self.total.cpu_cores),
            frac(free.memory_mb as f64, self.total.memory_mb as f64),
            frac(free.disk_mb as f64, self.total.disk_mb as f64),
        )
    }
}
