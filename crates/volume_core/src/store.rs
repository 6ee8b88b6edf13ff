use shared::domain::{Origin, SyncPhase, VolumeLevel, VolumeRange, VolumeSnapshot};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Owned by exactly one writer. Readers observe it through [`VolumeStore::watch`].
pub struct VolumeStore {
    range: VolumeRange,
    snapshot: VolumeSnapshot,
    phase: SyncPhase,
    snapshots: watch::Sender<VolumeSnapshot>,
    phases: watch::Sender<SyncPhase>,
}

impl VolumeStore {
    /// `initial` is what readers see until the first seed; it is clamped into `range`.
    pub fn new(range: VolumeRange, initial: VolumeLevel) -> Self {
        let snapshot = VolumeSnapshot {
            level: range.clamp(initial.0).level,
            origin: Origin::Initial,
            revision: 0,
        };
        let (snapshots, _) = watch::channel(snapshot);
        let (phases, _) = watch::channel(SyncPhase::Uninitialized);
        Self {
            range,
            snapshot,
            phase: SyncPhase::Uninitialized,
            snapshots,
            phases,
        }
    }

    pub fn range(&self) -> VolumeRange {
        self.range
    }

    pub fn read(&self) -> VolumeLevel {
        self.snapshot.level
    }

    pub fn snapshot(&self) -> VolumeSnapshot {
        self.snapshot
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn watch(&self) -> watch::Receiver<VolumeSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phases.subscribe()
    }

    pub fn set_from_user(&mut self, raw: i32) -> VolumeLevel {
        let clamped = self.range.clamp(raw);
        if clamped.out_of_range {
            debug!(raw, level = clamped.level.0, "volume: clamped user value");
        }
        self.enter_live();
        if clamped.level != self.snapshot.level || self.snapshot.origin != Origin::User {
            self.commit(clamped.level, Origin::User);
        }
        clamped.level
    }

    /// Repeating the current value is not a change.
    pub fn set_from_external(&mut self, raw: f64) -> VolumeLevel {
        let Some(clamped) = self.range.clamp_raw(raw) else {
            warn!("volume: ignoring external value without a level (NaN)");
            return self.snapshot.level;
        };
        if clamped.out_of_range {
            debug!(raw, level = clamped.level.0, "volume: clamped external value");
        }
        self.enter_live();
        if clamped.level != self.snapshot.level {
            self.commit(clamped.level, Origin::External);
        }
        clamped.level
    }

    /// Applies only while nothing else has been written. Returns whether it applied.
    pub fn seed(&mut self, raw: f64) -> bool {
        if self.phase != SyncPhase::Uninitialized {
            debug!(raw, phase = ?self.phase, "volume: late seed ignored");
            return false;
        }
        let Some(clamped) = self.range.clamp_raw(raw) else {
            warn!("volume: ignoring seed without a level (NaN)");
            return false;
        };
        if clamped.out_of_range {
            debug!(raw, level = clamped.level.0, "volume: clamped seed value");
        }
        self.set_phase(SyncPhase::Seeded);
        self.commit(clamped.level, Origin::Initial);
        true
    }

    fn enter_live(&mut self) {
        if self.phase != SyncPhase::Live {
            self.set_phase(SyncPhase::Live);
        }
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        self.phase = phase;
        self.phases.send_replace(phase);
    }

    fn commit(&mut self, level: VolumeLevel, origin: Origin) {
        self.snapshot = VolumeSnapshot {
            level,
            origin,
            revision: self.snapshot.revision + 1,
        };
        self.snapshots.send_replace(self.snapshot);
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
