use crate::error::{ApiError, SetupError, UpdateFailed};
use crate::meter_record::Snapshot;
use crate::meters_api::MetersApi;
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// What the coordinator currently holds for its readers.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotView {
    /// The last poll succeeded.
    Fresh(Arc<Snapshot>),
    /// The last poll failed; this is the data of the poll before it.
    Stale(Arc<Snapshot>),
    /// Nothing has been fetched yet.
    Empty,
}

impl SnapshotView {
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        match self {
            SnapshotView::Fresh(snapshot) | SnapshotView::Stale(snapshot) => Some(snapshot),
            SnapshotView::Empty => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, SnapshotView::Fresh(_))
    }
}

/// Owner of the polling cycle and of the current snapshot.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Runs one poll and publishes its outcome.
    async fn refresh(&self) -> Result<Arc<Snapshot>, UpdateFailed>;

    fn current_snapshot(&self) -> SnapshotView;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorState {
    pub snapshot: Option<Arc<Snapshot>>,
    pub last_update_success: bool,
    pub last_error: Option<String>,
}

impl CoordinatorState {
    pub fn view(&self) -> SnapshotView {
        match (&self.snapshot, self.last_update_success) {
            (Some(snapshot), true) => SnapshotView::Fresh(Arc::clone(snapshot)),
            (Some(snapshot), false) => SnapshotView::Stale(Arc::clone(snapshot)),
            (None, _) => SnapshotView::Empty,
        }
    }
}

/// Polls the metering API at a fixed interval.
///
/// Every poll replaces the whole snapshot on success and leaves it untouched
/// on failure. Subscribers are woken after each poll either way.
pub struct DataUpdateCoordinator {
    name: String,
    api: MetersApi,
    update_interval: Duration,
    state: watch::Sender<CoordinatorState>,
}

impl DataUpdateCoordinator {
    pub fn new(name: impl Into<String>, api: MetersApi, update_interval: Duration) -> Self {
        let (state, _) = watch::channel(CoordinatorState::default());
        Self {
            name: name.into(),
            api,
            update_interval,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.state.borrow().last_update_success
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// The refresh run during setup. Failing it means the entry is not ready.
    pub async fn first_refresh(&self) -> Result<Arc<Snapshot>, SetupError> {
        Ok(self.refresh().await?)
    }

    /// Starts the fixed-cadence poll loop; the first poll happens one interval from now.
    pub fn spawn(self: Arc<Self>) -> PollTask {
        let period = self.update_interval.max(Duration::from_secs(1));
        info!(coordinator = %self.name, interval = ?period, "starting poll loop");

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are recorded in the state; the next tick retries.
                let _ = self.refresh().await;
            }
        });
        PollTask { handle }
    }

    fn publish(&self, result: Result<Snapshot, ApiError>) -> Result<Arc<Snapshot>, UpdateFailed> {
        match result {
            Ok(snapshot) => {
                info!(coordinator = %self.name, meters = snapshot.len(), "fetched meters");
                let snapshot = Arc::new(snapshot);
                self.state.send_replace(CoordinatorState {
                    snapshot: Some(Arc::clone(&snapshot)),
                    last_update_success: true,
                    last_error: None,
                });
                Ok(snapshot)
            }
            Err(source) => {
                let err = UpdateFailed {
                    name: self.name.clone(),
                    source,
                };
                error!(coordinator = %self.name, error = %err, "update failed");
                self.state.send_modify(|state| {
                    state.last_update_success = false;
                    state.last_error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Coordinator for DataUpdateCoordinator {
    async fn refresh(&self) -> Result<Arc<Snapshot>, UpdateFailed> {
        let now = Local::now().fixed_offset();
        debug!(coordinator = %self.name, "refreshing");
        let result = self.api.fetch_meters(&now).await;
        self.publish(result)
    }

    fn current_snapshot(&self) -> SnapshotView {
        self.state.borrow().view()
    }
}

/// Handle of a running poll loop. Dropping it stops the loop.
pub struct PollTask {
    handle: JoinHandle<()>,
}

impl PollTask {
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
