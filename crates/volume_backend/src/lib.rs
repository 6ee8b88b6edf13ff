use async_trait::async_trait;
use shared::{
    domain::{ChangeNotification, VolumeLevel, DEFAULT_VOLUME},
    error::BackendError,
};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

const CHANGE_STREAM_CAPACITY: usize = 64;
const DEFAULT_KEY_STEP: f64 = 1.0;

/// The native side that actually reads and writes the output level.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    async fn query_volume(&self) -> Result<f64, BackendError>;
    async fn set_volume(&self, level: VolumeLevel) -> Result<(), BackendError>;
    /// Each notification carries the new absolute level, in emission order.
    /// The receiver reports `Closed` once the backend drops the stream.
    async fn subscribe_volume_changes(
        &self,
    ) -> Result<broadcast::Receiver<ChangeNotification>, BackendError>;
}

pub struct MissingVolumeBackend;

#[async_trait]
impl VolumeBackend for MissingVolumeBackend {
    async fn query_volume(&self) -> Result<f64, BackendError> {
        Err(BackendError::unavailable("no volume backend configured"))
    }

    async fn set_volume(&self, level: VolumeLevel) -> Result<(), BackendError> {
        Err(BackendError::unavailable(format!(
            "no volume backend configured to apply level {level}"
        )))
    }

    async fn subscribe_volume_changes(
        &self,
    ) -> Result<broadcast::Receiver<ChangeNotification>, BackendError> {
        Err(BackendError::unavailable("no volume backend configured"))
    }
}

struct SoftwareMixerState {
    level: f64,
    available: bool,
    changes: broadcast::Sender<ChangeNotification>,
}

/// In-process mixer cell. The audio path reads `level`; volume keys nudge it.
pub struct SoftwareVolumeBackend {
    state: Mutex<SoftwareMixerState>,
    echo_writes: bool,
    key_step: f64,
}

impl SoftwareVolumeBackend {
    pub fn new(initial_level: f64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Self {
            state: Mutex::new(SoftwareMixerState {
                level: initial_level,
                available: true,
                changes,
            }),
            echo_writes: true,
            key_step: DEFAULT_KEY_STEP,
        }
    }

    /// Re-broadcast levels written through `set_volume`, as OS mixers do.
    pub fn with_echo_writes(mut self, echo_writes: bool) -> Self {
        self.echo_writes = echo_writes;
        self
    }

    pub fn with_key_step(mut self, key_step: f64) -> Self {
        self.key_step = key_step;
        self
    }

    pub async fn level(&self) -> f64 {
        self.state.lock().await.level
    }

    /// Volume key press: moves the cell by `steps` key steps without clamping.
    pub async fn nudge(&self, steps: i32) -> Result<f64, BackendError> {
        let mut state = self.state.lock().await;
        if !state.available {
            return Err(BackendError::unavailable("software mixer offline"));
        }
        state.level += f64::from(steps) * self.key_step;
        let level = state.level;
        Self::broadcast(&state, level);
        Ok(level)
    }

    /// Another application wrote `raw` to the mixer.
    pub async fn emit(&self, raw: f64) {
        let mut state = self.state.lock().await;
        state.level = raw;
        Self::broadcast(&state, raw);
    }

    /// Drops the current change stream; every live receiver observes `Closed`.
    pub async fn restart_stream(&self) {
        let mut state = self.state.lock().await;
        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        state.changes = changes;
        debug!("backend: change stream restarted");
    }

    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    fn broadcast(state: &SoftwareMixerState, level: f64) {
        let delivered = state
            .changes
            .send(ChangeNotification::new(level))
            .unwrap_or(0);
        debug!(level, delivered, "backend: volume change broadcast");
    }
}

impl Default for SoftwareVolumeBackend {
    fn default() -> Self {
        Self::new(f64::from(DEFAULT_VOLUME))
    }
}

#[async_trait]
impl VolumeBackend for SoftwareVolumeBackend {
    async fn query_volume(&self) -> Result<f64, BackendError> {
        let state = self.state.lock().await;
        if !state.available {
            return Err(BackendError::unavailable("software mixer offline"));
        }
        Ok(state.level)
    }

    async fn set_volume(&self, level: VolumeLevel) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if !state.available {
            return Err(BackendError::unavailable("software mixer offline"));
        }
        state.level = f64::from(level.0);
        if self.echo_writes {
            Self::broadcast(&state, state.level);
        }
        Ok(())
    }

    async fn subscribe_volume_changes(
        &self,
    ) -> Result<broadcast::Receiver<ChangeNotification>, BackendError> {
        let state = self.state.lock().await;
        if !state.available {
            return Err(BackendError::unavailable("software mixer offline"));
        }
        Ok(state.changes.subscribe())
    }
}
