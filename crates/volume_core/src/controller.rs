use std::{sync::Arc, time::Duration};

use serde::Serialize;
use shared::{
    domain::{
        ChangeNotification, Origin, SyncPhase, VolumeLevel, VolumeRange, VolumeSnapshot,
        DEFAULT_VOLUME,
    },
    error::{BackendError, ErrorCode},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};
use volume_backend::VolumeBackend;

use crate::{
    store::VolumeStore,
    subscription::{SubscriptionEvent, VolumeSubscription},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RESUBSCRIBE_ATTEMPTS: u32 = 5;
const DEFAULT_RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub range: VolumeRange,
    /// Shown until the startup query resolves.
    pub initial_volume: VolumeLevel,
    /// Seeded when the startup query fails or times out.
    pub fallback_volume: VolumeLevel,
    pub query_timeout: Duration,
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff: Duration,
    pub resubscribe_backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            range: VolumeRange::default(),
            initial_volume: VolumeLevel(DEFAULT_VOLUME),
            fallback_volume: VolumeLevel(DEFAULT_VOLUME),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            resubscribe_attempts: DEFAULT_RESUBSCRIBE_ATTEMPTS,
            resubscribe_backoff: DEFAULT_RESUBSCRIBE_BACKOFF,
            resubscribe_backoff_max: DEFAULT_RESUBSCRIBE_BACKOFF_MAX,
        }
    }
}

impl SyncConfig {
    /// Doubles per attempt, starting at `resubscribe_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.resubscribe_backoff
            .saturating_mul(factor)
            .min(self.resubscribe_backoff_max)
    }
}

/// Background signals. The control itself never shows an error state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Seeded {
        level: VolumeLevel,
        from_fallback: bool,
    },
    OutOfRangeClamped {
        raw: f64,
        level: VolumeLevel,
        origin: Origin,
    },
    SetVolumeFailed {
        level: VolumeLevel,
        code: ErrorCode,
        message: String,
    },
    SubscriptionLost,
    Resubscribed {
        attempt: u32,
    },
    ResubscribeExhausted {
        attempts: u32,
    },
    NotificationsLagged {
        skipped: u64,
    },
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("volume controller is no longer running")]
    Closed,
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ControllerClosed
    }
}

enum ControllerCommand {
    UserInput {
        raw: i32,
        reply: Option<oneshot::Sender<VolumeLevel>>,
    },
    Unsubscribe(oneshot::Sender<bool>),
    Shutdown,
}

pub struct SyncController {
    commands: mpsc::UnboundedSender<ControllerCommand>,
    snapshots: watch::Receiver<VolumeSnapshot>,
    phases: watch::Receiver<SyncPhase>,
    events: broadcast::Sender<SyncEvent>,
    range: VolumeRange,
    task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl SyncController {
    pub async fn start(backend: Arc<dyn VolumeBackend>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::start_with_events(backend, config, events).await
    }

    /// Publishes on `events`, so receivers created beforehand also see startup events.
    pub async fn start_with_events(
        backend: Arc<dyn VolumeBackend>,
        config: SyncConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let mut store = VolumeStore::new(config.range, config.initial_volume);

        // Subscribe before querying so nothing emitted during the query is missed.
        let subscription = match subscribe_changes(backend.as_ref(), config.query_timeout).await {
            Ok(receiver) => VolumeSubscription::new(receiver),
            Err(err) => {
                warn!(error = %err, "subscription: initial subscribe failed");
                VolumeSubscription::detached()
            }
        };

        seed_store(&mut store, backend.as_ref(), &config, &events).await;

        let (writes, writes_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(run_backend_writer(
            Arc::clone(&backend),
            writes_rx,
            events.clone(),
        ));

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let snapshots = store.watch();
        let phases = store.watch_phase();
        let range = store.range();

        let mut task = ControllerTask {
            store,
            subscription,
            backend,
            config,
            events: events.clone(),
            writes,
            retry: None,
            resync: None,
            inputs_applied: 0,
            resync_since: 0,
        };
        if !task.subscription.is_live() {
            task.on_subscription_lost();
        }
        let task = tokio::spawn(task.run(commands_rx));

        Self {
            commands,
            snapshots,
            phases,
            events,
            range,
            task: Some(task),
            writer_task: Some(writer_task),
        }
    }

    pub fn read(&self) -> VolumeLevel {
        self.snapshots.borrow().level
    }

    pub fn snapshot(&self) -> VolumeSnapshot {
        *self.snapshots.borrow()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phases.borrow()
    }

    pub fn range(&self) -> VolumeRange {
        self.range
    }

    /// Reactive view of the store for rendering.
    pub fn watch(&self) -> watch::Receiver<VolumeSnapshot> {
        self.snapshots.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Queues one drag tick without waiting for it to be applied.
    pub fn on_user_input(&self, raw: i32) -> Result<(), SyncError> {
        self.commands
            .send(ControllerCommand::UserInput { raw, reply: None })
            .map_err(|_| SyncError::Closed)
    }

    /// Queues one drag tick and returns the clamped level once the store holds it.
    /// Does not wait for the backend write.
    pub async fn user_set(&self, raw: i32) -> Result<VolumeLevel, SyncError> {
        let (reply, applied) = oneshot::channel();
        self.commands
            .send(ControllerCommand::UserInput {
                raw,
                reply: Some(reply),
            })
            .map_err(|_| SyncError::Closed)?;
        applied.await.map_err(|_| SyncError::Closed)
    }

    /// Returns once the change stream is released; `true` only for the releasing call.
    pub async fn unsubscribe(&self) -> bool {
        let (ack, released) = oneshot::channel();
        if self
            .commands
            .send(ControllerCommand::Unsubscribe(ack))
            .is_err()
        {
            return false;
        }
        released.await.unwrap_or(false)
    }

    /// Releases the subscription and waits for queued backend writes to finish.
    pub async fn shutdown(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.commands.send(ControllerCommand::Shutdown);
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                error!(error = %err, "volume: controller task failed");
            }
        }
        if let Some(writer_task) = self.writer_task.take() {
            let _ = writer_task.await;
        }
        info!("volume: controller stopped");
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(writer_task) = self.writer_task.take() {
            writer_task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempt: u32,
    at: Instant,
}

struct ControllerTask {
    store: VolumeStore,
    subscription: VolumeSubscription,
    backend: Arc<dyn VolumeBackend>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    writes: mpsc::UnboundedSender<VolumeLevel>,
    retry: Option<RetryState>,
    resync: Option<JoinHandle<Result<f64, BackendError>>>,
    // Counts user inputs and notifications; a resync older than the last one is stale.
    inputs_applied: u64,
    resync_since: u64,
}

impl ControllerTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ControllerCommand>) {
        loop {
            let retry_at = self.retry.map(|retry| retry.at);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControllerCommand::UserInput { raw, reply }) => {
                        let level = self.apply_user_input(raw);
                        if let Some(reply) = reply {
                            let _ = reply.send(level);
                        }
                    }
                    Some(ControllerCommand::Unsubscribe(ack)) => {
                        let released = self.release();
                        let _ = ack.send(released);
                    }
                    Some(ControllerCommand::Shutdown) | None => {
                        self.release();
                        break;
                    }
                },
                event = self.subscription.next() => self.apply_subscription_event(event),
                _ = wait_until(retry_at) => self.resubscribe().await,
                resynced = join_resync(&mut self.resync) => {
                    self.resync = None;
                    self.apply_resync(resynced);
                }
            }
        }
        debug!("volume: controller task exiting");
    }

    fn apply_user_input(&mut self, raw: i32) -> VolumeLevel {
        let clamped = self.store.range().clamp(raw);
        if clamped.out_of_range {
            self.publish(SyncEvent::OutOfRangeClamped {
                raw: f64::from(raw),
                level: clamped.level,
                origin: Origin::User,
            });
        }
        self.inputs_applied += 1;
        let level = self.store.set_from_user(raw);
        if self.writes.send(level).is_err() {
            warn!(level = level.0, "backend: writer stopped; volume not applied");
        }
        level
    }

    fn apply_external(&mut self, raw: f64) {
        if let Some(clamped) = self.store.range().clamp_raw(raw) {
            if clamped.out_of_range {
                self.publish(SyncEvent::OutOfRangeClamped {
                    raw,
                    level: clamped.level,
                    origin: Origin::External,
                });
            }
        }
        self.store.set_from_external(raw);
    }

    fn apply_subscription_event(&mut self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Notification(notification) => {
                self.inputs_applied += 1;
                self.apply_external(notification.payload)
            }
            SubscriptionEvent::Lagged(skipped) => {
                warn!(skipped, "subscription: fell behind; skipping to newest notifications");
                self.publish(SyncEvent::NotificationsLagged { skipped });
            }
            SubscriptionEvent::Lost => self.on_subscription_lost(),
        }
    }

    fn on_subscription_lost(&mut self) {
        warn!("subscription: change stream lost; resubscribing");
        self.publish(SyncEvent::SubscriptionLost);
        self.schedule_retry(1);
    }

    fn schedule_retry(&mut self, attempt: u32) {
        if attempt > self.config.resubscribe_attempts {
            let attempts = self.config.resubscribe_attempts;
            error!(attempts, "subscription: giving up; volume may go stale");
            self.retry = None;
            self.publish(SyncEvent::ResubscribeExhausted { attempts });
            return;
        }
        let delay = self.config.backoff(attempt);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "subscription: resubscribe scheduled"
        );
        self.retry = Some(RetryState {
            attempt,
            at: Instant::now() + delay,
        });
    }

    async fn resubscribe(&mut self) {
        let Some(RetryState { attempt, .. }) = self.retry.take() else {
            return;
        };
        info!(
            attempt,
            max_attempts = self.config.resubscribe_attempts,
            "subscription: resubscribe attempt"
        );
        match subscribe_changes(self.backend.as_ref(), self.config.query_timeout).await {
            Ok(receiver) => {
                if !self.subscription.attach(receiver) {
                    return;
                }
                info!(attempt, "subscription: resubscribed");
                self.publish(SyncEvent::Resubscribed { attempt });
                self.start_resync();
            }
            Err(err) => {
                warn!(attempt, error = %err, "subscription: resubscribe failed");
                self.schedule_retry(attempt + 1);
            }
        }
    }

    /// Catches up on changes missed while the stream was down.
    fn start_resync(&mut self) {
        if let Some(previous) = self.resync.take() {
            previous.abort();
        }
        self.resync_since = self.inputs_applied;
        let backend = Arc::clone(&self.backend);
        let timeout = self.config.query_timeout;
        self.resync = Some(tokio::spawn(async move {
            query_volume(backend.as_ref(), timeout).await
        }));
    }

    fn apply_resync(&mut self, resynced: Result<f64, BackendError>) {
        match resynced {
            Ok(raw) if self.inputs_applied != self.resync_since => {
                debug!(raw, "volume: newer input landed during resync; dropping stale level");
            }
            Ok(raw) => {
                debug!(raw, "volume: resynced after resubscribe");
                self.apply_external(raw);
            }
            Err(err) => warn!(error = %err, "volume: resync query failed; keeping last known value"),
        }
    }

    fn release(&mut self) -> bool {
        self.retry = None;
        if let Some(resync) = self.resync.take() {
            resync.abort();
        }
        let released = self.subscription.unsubscribe();
        if released {
            info!("subscription: released");
            self.publish(SyncEvent::Unsubscribed);
        }
        released
    }

    fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

async fn seed_store(
    store: &mut VolumeStore,
    backend: &dyn VolumeBackend,
    config: &SyncConfig,
    events: &broadcast::Sender<SyncEvent>,
) {
    let reason = match query_volume(backend, config.query_timeout).await {
        Ok(raw) => {
            if store.seed(raw) {
                let level = store.read();
                if config.range.clamp_raw(raw).is_some_and(|clamped| clamped.out_of_range) {
                    let _ = events.send(SyncEvent::OutOfRangeClamped {
                        raw,
                        level,
                        origin: Origin::Initial,
                    });
                }
                info!(raw, level = level.0, "volume: seeded from backend");
                let _ = events.send(SyncEvent::Seeded {
                    level,
                    from_fallback: false,
                });
                return;
            }
            format!("backend reported unusable level {raw}")
        }
        Err(err) => err.to_string(),
    };

    store.seed(f64::from(config.fallback_volume.0));
    let level = store.read();
    warn!(reason = %reason, level = level.0, "volume: initial query failed; showing fallback");
    let _ = events.send(SyncEvent::Seeded {
        level,
        from_fallback: true,
    });
}

async fn query_volume(backend: &dyn VolumeBackend, timeout: Duration) -> Result<f64, BackendError> {
    match tokio::time::timeout(timeout, backend.query_volume()).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

async fn subscribe_changes(
    backend: &dyn VolumeBackend,
    timeout: Duration,
) -> Result<broadcast::Receiver<ChangeNotification>, BackendError> {
    match tokio::time::timeout(timeout, backend.subscribe_volume_changes()).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

/// One `set_volume` per user input, in arrival order.
async fn run_backend_writer(
    backend: Arc<dyn VolumeBackend>,
    mut writes: mpsc::UnboundedReceiver<VolumeLevel>,
    events: broadcast::Sender<SyncEvent>,
) {
    while let Some(level) = writes.recv().await {
        match backend.set_volume(level).await {
            Ok(()) => debug!(level = level.0, "backend: volume applied"),
            Err(err) => {
                warn!(level = level.0, error = %err, "backend: set volume failed; keeping displayed value");
                let _ = events.send(SyncEvent::SetVolumeFailed {
                    level,
                    code: err.code(),
                    message: err.to_string(),
                });
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join_resync(
    slot: &mut Option<JoinHandle<Result<f64, BackendError>>>,
) -> Result<f64, BackendError> {
    let Some(handle) = slot.as_mut() else {
        return std::future::pending().await;
    };
    match handle.await {
        Ok(resynced) => resynced,
        Err(err) => Err(BackendError::unavailable(format!("resync task failed: {err}"))),
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
