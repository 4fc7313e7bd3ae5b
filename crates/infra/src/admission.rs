//! Memory-pressure admission control.
//!
//! Utilization is sampled fresh on every [`AdmissionController::may_claim`] call; a worker close
//! to its memory ceiling stops taking new jobs but keeps running the ones it holds.

use std::sync::{Mutex, PoisonError};

use sysinfo::System;
use tracing::{debug, warn};

/// Source of the host's memory utilization ratio.
pub trait MemoryProbe: Send + std::fmt::Debug {
    /// Used / total memory in `[0, 1]`, or `None` when it cannot be read.
    fn usage_ratio(&mut self) -> Option<f64>;
}

/// Probe backed by `sysinfo`.
#[derive(Debug)]
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn usage_ratio(&mut self) -> Option<f64> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        Some(self.system.used_memory() as f64 / total as f64)
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    probe: Mutex<Box<dyn MemoryProbe>>,
    ceiling: f64,
}

impl AdmissionController {
    pub fn new(probe: Box<dyn MemoryProbe>, ceiling: f64) -> Self {
        Self {
            probe: Mutex::new(probe),
            ceiling,
        }
    }

    pub fn with_sysinfo(ceiling: f64) -> Self {
        Self::new(Box::new(SysinfoProbe::new()), ceiling)
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// Whether the worker may claim another job right now.
    ///
    /// An unreadable probe does not block claiming.
    pub fn may_claim(&self) -> bool {
        let ratio = self
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usage_ratio();

        match ratio {
            Some(ratio) if ratio > self.ceiling => {
                debug!(usage = ratio, ceiling = self.ceiling, "admission denied");
                false
            }
            Some(_) => true,
            None => {
                warn!("memory usage unavailable, admitting claim");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of readings.
    #[derive(Debug)]
    struct Scripted(VecDeque<Option<f64>>);

    impl MemoryProbe for Scripted {
        fn usage_ratio(&mut self) -> Option<f64> {
            self.0.pop_front().flatten()
        }
    }

    fn controller(readings: &[Option<f64>]) -> AdmissionController {
        AdmissionController::new(Box::new(Scripted(readings.iter().copied().collect())), 0.9)
    }

    #[test]
    fn denies_strictly_above_ceiling() {
        let admission = controller(&[Some(0.5), Some(0.9), Some(0.91)]);
        assert!(admission.may_claim());
        assert!(admission.may_claim());
        assert!(!admission.may_claim());
    }

    #[test]
    fn samples_on_every_call() {
        let admission = controller(&[Some(0.95), Some(0.2)]);
        assert!(!admission.may_claim());
        assert!(admission.may_claim());
    }

    #[test]
    fn unreadable_probe_admits() {
        let admission = controller(&[None]);
        assert!(admission.may_claim());
    }

    #[test]
    fn sysinfo_probe_reports_a_ratio() {
        let mut probe = SysinfoProbe::new();
        if let Some(ratio) = probe.usage_ratio() {
            assert!((0.0..=1.0).contains(&ratio));
        }
    }
}
