use enum_map::{enum_map, Enum, EnumMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The pause phases the engine reports timings for.
#[derive(Enum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcPhase {
    UpdateRs,
    ScanRs,
    CodeRoots,
    EvacFailRestoreRemSets,
}

/// Per-worker wall-clock timings of the engine's pause phases, in
/// nanoseconds. Each worker writes only its own slot.
pub struct PhaseTimes {
    nanos: EnumMap<GcPhase, Box<[AtomicU64]>>,
}

impl PhaseTimes {
    pub fn new(workers: usize) -> Self {
        PhaseTimes {
            nanos: enum_map! {
                _ => (0..workers).map(|_| AtomicU64::new(0)).collect()
            },
        }
    }

    pub fn record(&self, phase: GcPhase, worker: usize, time: Duration) {
        self.nanos[phase][worker].store(time.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn worker_time(&self, phase: GcPhase, worker: usize) -> Duration {
        Duration::from_nanos(self.nanos[phase][worker].load(Ordering::Relaxed))
    }

    pub fn sum(&self, phase: GcPhase) -> Duration {
        Duration::from_nanos(
            self.nanos[phase]
                .iter()
                .map(|t| t.load(Ordering::Relaxed))
                .sum(),
        )
    }

    pub fn reset(&self) {
        for (_, slots) in self.nanos.iter() {
            for slot in slots.iter() {
                slot.store(0, Ordering::Relaxed);
            }
        }
    }
}
