//! My Meters
//!
//! Polls a utility metering API and exposes every reported meter as a sensor,
//! with an optional user-defined correction added to each reading.

pub mod config;
pub mod config_flow;
pub mod coordinator;
pub mod error;
pub mod integration;
pub mod meter_record;
pub mod meters_api;
pub mod sensor;

// Re-export commonly used types for easier access
pub use config::{ConfigEntry, Corrections, EntryData, EntryStore};
pub use coordinator::{Coordinator, DataUpdateCoordinator, SnapshotView};
pub use integration::{setup_entry, Integration, IntegrationContext};
pub use meter_record::{IndicatorId, MeterRecord, MetricType, Snapshot, UnitType};
pub use meters_api::MetersApi;
pub use sensor::{MeterSensor, SensorState};
