//! Resource gates: predicates that hold a lane closed under load.
//!
//! A closed gate means the scheduler skips the lane entirely for that
//! selection; nothing is dequeued and nothing fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agential_core::defaults::{VLM_OCR_MAX_HOT_DEPTH, VLM_OCR_MAX_UTILIZATION};
use agential_core::{Lane, ResourceMonitor};

use crate::lane::env_or;

/// Live lane counters handed to a gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateView {
    depths: [usize; 4],
    in_flight: [usize; 4],
}

impl GateView {
    pub fn new(depths: [usize; 4], in_flight: [usize; 4]) -> Self {
        Self { depths, in_flight }
    }

    /// Pending jobs in `lane`.
    pub fn depth(&self, lane: Lane) -> usize {
        self.depths[lane.index()]
    }

    /// Admitted plus running jobs in `lane`.
    pub fn in_flight(&self, lane: Lane) -> usize {
        self.in_flight[lane.index()]
    }
}

/// Predicate deciding whether a lane may dispatch right now.
pub trait ResourceGate: Send + Sync {
    fn is_open(&self, view: &GateView) -> bool;
}

impl<F> ResourceGate for F
where
    F: Fn(&GateView) -> bool + Send + Sync,
{
    fn is_open(&self, view: &GateView) -> bool {
        self(view)
    }
}

/// Gate that never closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl ResourceGate for AlwaysOpen {
    fn is_open(&self, _view: &GateView) -> bool {
        true
    }
}

/// Default vlm_ocr gate: accelerator utilization and hot backlog both low.
pub struct UtilizationGate {
    monitor: Arc<dyn ResourceMonitor>,
    max_utilization: f64,
    max_hot_depth: usize,
}

impl UtilizationGate {
    pub fn new(monitor: Arc<dyn ResourceMonitor>) -> Self {
        Self {
            monitor,
            max_utilization: VLM_OCR_MAX_UTILIZATION,
            max_hot_depth: VLM_OCR_MAX_HOT_DEPTH,
        }
    }

    /// Read `VLM_OCR_MAX_UTILIZATION` and `VLM_OCR_MAX_HOT_DEPTH`.
    pub fn from_env(monitor: Arc<dyn ResourceMonitor>) -> Self {
        Self {
            monitor,
            max_utilization: env_or("VLM_OCR_MAX_UTILIZATION", VLM_OCR_MAX_UTILIZATION),
            max_hot_depth: env_or("VLM_OCR_MAX_HOT_DEPTH", VLM_OCR_MAX_HOT_DEPTH),
        }
    }

    pub fn with_max_utilization(mut self, max: f64) -> Self {
        self.max_utilization = max;
        self
    }

    pub fn with_max_hot_depth(mut self, max: usize) -> Self {
        self.max_hot_depth = max;
        self
    }
}

impl ResourceGate for UtilizationGate {
    fn is_open(&self, view: &GateView) -> bool {
        self.monitor.accelerator_utilization() < self.max_utilization
            && view.depth(Lane::Hot) < self.max_hot_depth
    }
}

/// Utilization reading that an external sampler pushes into.
#[derive(Debug, Default)]
pub struct SharedUtilization {
    bits: AtomicU64,
}

impl SharedUtilization {
    pub fn new(initial: f64) -> Self {
        Self {
            bits: AtomicU64::new(initial.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn set(&self, utilization: f64) {
        self.bits
            .store(utilization.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl ResourceMonitor for SharedUtilization {
    fn accelerator_utilization(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}
