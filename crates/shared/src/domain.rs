use serde::{Deserialize, Serialize};

use crate::error::RangeError;

/// Lowest attenuation the output accepts, in dB.
pub const MIN_VOLUME: i32 = -50;
/// Highest attenuation the output accepts, in dB.
pub const MAX_VOLUME: i32 = 0;
/// Level shown before the backend has been queried.
pub const DEFAULT_VOLUME: i32 = -20;

/// Output attenuation in whole dB. Always within the range it was clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeLevel(pub i32);

impl std::fmt::Display for VolumeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed `[min, max]` range. Built once at startup and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRange {
    min: VolumeLevel,
    max: VolumeLevel,
}

/// Result of fitting a raw value into a [`VolumeRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamped {
    pub level: VolumeLevel,
    pub out_of_range: bool,
}

impl VolumeRange {
    pub fn new(min: i32, max: i32) -> Result<Self, RangeError> {
        if min >= max {
            return Err(RangeError::Inverted { min, max });
        }
        Ok(Self {
            min: VolumeLevel(min),
            max: VolumeLevel(max),
        })
    }

    pub fn min(&self) -> VolumeLevel {
        self.min
    }

    pub fn max(&self) -> VolumeLevel {
        self.max
    }

    pub fn contains(&self, raw: i32) -> bool {
        (self.min.0..=self.max.0).contains(&raw)
    }

    pub fn clamp(&self, raw: i32) -> Clamped {
        let level = raw.clamp(self.min.0, self.max.0);
        Clamped {
            level: VolumeLevel(level),
            out_of_range: level != raw,
        }
    }

    /// Rounds a backend payload to whole dB before clamping.
    /// Returns `None` for NaN, which carries no level at all.
    pub fn clamp_raw(&self, raw: f64) -> Option<Clamped> {
        if raw.is_nan() {
            return None;
        }
        let rounded = raw.round();
        let level = rounded.clamp(f64::from(self.min.0), f64::from(self.max.0)) as i32;
        Some(Clamped {
            level: VolumeLevel(level),
            out_of_range: rounded < f64::from(self.min.0) || rounded > f64::from(self.max.0),
        })
    }
}

impl Default for VolumeRange {
    fn default() -> Self {
        Self {
            min: VolumeLevel(MIN_VOLUME),
            max: VolumeLevel(MAX_VOLUME),
        }
    }
}

/// Which input path produced the current value. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Initial,
    User,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    Seeded,
    Live,
}

/// Point-in-time view of the store. `revision` grows by one per observable change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub level: VolumeLevel,
    pub origin: Origin,
    pub revision: u64,
}

/// Absolute level pushed by the backend. Raw because the backend may overshoot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub payload: f64,
}

impl ChangeNotification {
    pub fn new(payload: f64) -> Self {
        Self { payload }
    }
}
