use crate::config::{ConfigEntry, Corrections, EntryData, EntryStore};
use crate::config_flow::{FlowResult, OptionsFlow};
use crate::coordinator::{Coordinator, DataUpdateCoordinator, PollTask};
use crate::error::SetupError;
use crate::meters_api::MetersApi;
use crate::sensor::{setup_sensors, MeterSensor, SensorState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub const COORDINATOR_NAME: &str = "my_meters_coordinator";

/// Everything that belongs to one set-up config entry.
pub struct IntegrationContext {
    entry: Arc<ConfigEntry>,
    coordinator: Arc<DataUpdateCoordinator>,
    sensors: Vec<MeterSensor>,
    poll_task: PollTask,
}

impl IntegrationContext {
    pub fn entry(&self) -> &ConfigEntry {
        &self.entry
    }

    pub fn coordinator(&self) -> &Arc<DataUpdateCoordinator> {
        &self.coordinator
    }

    pub fn sensors(&self) -> &[MeterSensor] {
        &self.sensors
    }

    pub fn sensor_states(&self) -> Vec<SensorState> {
        self.sensors.iter().map(MeterSensor::state).collect()
    }

    pub fn options_flow(&self) -> OptionsFlow {
        OptionsFlow::new(&self.entry, &self.coordinator.current_snapshot())
    }

    /// Stops polling and drops the sensors.
    pub fn unload(self) {
        info!(title = %self.entry.title, sensors = self.sensors.len(), "unloading entry");
        self.poll_task.cancel();
    }
}

/// Sets up one config entry: first poll, sensor platform, then the poll loop.
pub async fn setup_entry(entry: ConfigEntry) -> Result<IntegrationContext, SetupError> {
    let entry = Arc::new(entry);
    let api = MetersApi::new(&entry.data.api_url, entry.data.api_token.as_str())?;
    let coordinator = Arc::new(DataUpdateCoordinator::new(
        COORDINATOR_NAME,
        api,
        entry.data.update_interval(),
    ));

    coordinator.first_refresh().await?;

    let sensors = setup_sensors(
        Arc::clone(&coordinator) as Arc<dyn Coordinator>,
        Arc::clone(&entry),
    );
    let poll_task = Arc::clone(&coordinator).spawn();
    info!(title = %entry.title, sensors = sensors.len(), "entry set up");

    Ok(IntegrationContext {
        entry,
        coordinator,
        sensors,
        poll_task,
    })
}

/// Owns the stored entry and, once set up, its running context.
pub struct Integration {
    store: EntryStore,
    context: Option<IntegrationContext>,
    update_listener: Option<oneshot::Sender<()>>,
}

impl Integration {
    pub fn new(store: EntryStore) -> Self {
        Self {
            store,
            context: None,
            update_listener: None,
        }
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    pub fn context(&self) -> Option<&IntegrationContext> {
        self.context.as_ref()
    }

    /// Persists the entry produced by the setup form, replacing any previous one.
    pub fn create_entry(&self, title: String, data: EntryData) -> Result<ConfigEntry, SetupError> {
        let entry = ConfigEntry::new(title, data);
        self.store.save(&entry)?;
        info!(path = %self.store.path().display(), "config entry created");
        Ok(entry)
    }

    pub async fn setup(&mut self) -> Result<(), SetupError> {
        let entry = self.store.load()?.ok_or(SetupError::NoEntry)?;
        self.context = Some(setup_entry(entry).await?);
        Ok(())
    }

    /// Returns whether anything was loaded.
    pub fn unload(&mut self) -> bool {
        self.update_listener = None;
        match self.context.take() {
            Some(context) => {
                context.unload();
                true
            }
            None => false,
        }
    }

    /// Tears the entry down and sets it up again from storage.
    pub async fn reload(&mut self) -> Result<(), SetupError> {
        info!("reloading entry");
        self.unload();
        self.setup().await
    }

    /// One-shot signal fired when the options of the entry change.
    ///
    /// The owner is expected to call [`Integration::reload`] when it fires and
    /// subscribe again afterwards.
    pub fn update_listener(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.update_listener = Some(tx);
        rx
    }

    pub fn options_flow(&self) -> Option<OptionsFlow> {
        self.context.as_ref().map(IntegrationContext::options_flow)
    }

    /// Submits the settings form. Accepted values are stored and the update
    /// listener is notified; rejected ones come back as a form with errors.
    pub fn submit_options(
        &mut self,
        input: BTreeMap<String, String>,
    ) -> Result<FlowResult<Corrections>, SetupError> {
        let flow = self.options_flow().ok_or(SetupError::NoEntry)?;
        let result = flow.step_init(Some(input));
        if let FlowResult::CreateEntry { data, .. } = &result {
            self.update_options(data.clone())?;
        }
        Ok(result)
    }

    fn update_options(&mut self, options: Corrections) -> Result<(), SetupError> {
        let mut entry = self.store.load()?.ok_or(SetupError::NoEntry)?;
        entry.options = options;
        self.store.save(&entry)?;
        info!(corrections = entry.options.len(), "options updated");

        match self.update_listener.take() {
            Some(listener) => {
                if listener.send(()).is_err() {
                    warn!("update listener is gone, options apply on next setup");
                }
            }
            None => warn!("no update listener, options apply on next setup"),
        }
        Ok(())
    }
}
