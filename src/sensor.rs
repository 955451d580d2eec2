use crate::config::{ConfigEntry, DOMAIN, MANUFACTURER};
use crate::coordinator::Coordinator;
use crate::meter_record::{IndicatorId, MeterRecord, MetricType, UnitType};
use serde_derive::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorDeviceClass {
    Energy,
    Water,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStateClass {
    /// Monotonically increasing counter, e.g. a consumption total.
    TotalIncreasing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub model: Option<String>,
    pub manufacturer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtraStateAttributes {
    pub synced_at: Option<String>,
    pub fias_id: Option<String>,
}

/// Everything a sensor exposes at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub unique_id: String,
    pub name: String,
    pub state: Option<f64>,
    pub available: bool,
    pub unit_of_measurement: Option<String>,
    pub icon: &'static str,
    pub device_class: Option<SensorDeviceClass>,
    pub state_class: SensorStateClass,
    pub attributes: ExtraStateAttributes,
    pub device: DeviceInfo,
}

pub fn friendly_type(metric: &MetricType) -> &'static str {
    match metric {
        MetricType::Electricity => "Electricity",
        MetricType::HotWater => "Hot water",
        MetricType::ColdWater => "Cold water",
        MetricType::Unknown(_) => "Meter",
    }
}

pub fn unit_of_measurement(unit: &UnitType) -> Option<String> {
    match unit {
        UnitType::Kwh => Some("kWh".to_string()),
        UnitType::M3 => Some("m³".to_string()),
        UnitType::Other(raw) if raw.is_empty() => None,
        UnitType::Other(raw) => Some(raw.clone()),
    }
}

pub fn icon(metric: &MetricType) -> &'static str {
    match metric {
        MetricType::Electricity => "mdi:flash",
        MetricType::HotWater => "mdi:water-thermometer",
        MetricType::ColdWater => "mdi:water",
        MetricType::Unknown(_) => "mdi:counter",
    }
}

pub fn device_class(metric: &MetricType) -> Option<SensorDeviceClass> {
    if *metric == MetricType::Electricity {
        Some(SensorDeviceClass::Energy)
    } else if metric.is_water() {
        Some(SensorDeviceClass::Water)
    } else {
        None
    }
}

/// Raw reading plus the user's offset. No reading, no value.
pub fn corrected_value(raw: Option<f64>, correction: f64) -> Option<f64> {
    raw.map(|value| value + correction)
}

/// One meter exposed as a sensor.
///
/// Metric and unit are fixed when the sensor is created; the reading and its
/// attributes are looked up in the coordinator's snapshot on every access.
pub struct MeterSensor {
    coordinator: Arc<dyn Coordinator>,
    entry: Arc<ConfigEntry>,
    indicator_id: IndicatorId,
    metric_type: MetricType,
    unit_type: UnitType,
    device_model: Option<String>,
    unique_id: String,
    name: String,
}

impl MeterSensor {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        entry: Arc<ConfigEntry>,
        indicator_id: IndicatorId,
        initial: &MeterRecord,
    ) -> Self {
        let unique_id = format!("meter_{indicator_id}");
        let name = format!("{} ({indicator_id})", friendly_type(&initial.metric_type));
        Self {
            coordinator,
            entry,
            indicator_id,
            metric_type: initial.metric_type.clone(),
            unit_type: initial.unit_type.clone(),
            device_model: initial.device_model.clone(),
            unique_id,
            name,
        }
    }

    pub fn indicator_id(&self) -> &IndicatorId {
        &self.indicator_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn current_record(&self) -> Option<MeterRecord> {
        self.coordinator
            .current_snapshot()
            .snapshot()
            .and_then(|snapshot| snapshot.get(&self.indicator_id).cloned())
    }

    pub fn correction(&self) -> f64 {
        self.entry.options.get(&self.indicator_id)
    }

    pub fn native_value(&self) -> Option<f64> {
        let raw = self.current_record().and_then(|record| record.value);
        corrected_value(raw, self.correction())
    }

    pub fn available(&self) -> bool {
        self.coordinator.current_snapshot().is_fresh()
    }

    pub fn native_unit_of_measurement(&self) -> Option<String> {
        unit_of_measurement(&self.unit_type)
    }

    pub fn icon(&self) -> &'static str {
        icon(&self.metric_type)
    }

    pub fn device_class(&self) -> Option<SensorDeviceClass> {
        device_class(&self.metric_type)
    }

    pub fn state_class(&self) -> SensorStateClass {
        SensorStateClass::TotalIncreasing
    }

    pub fn extra_state_attributes(&self) -> ExtraStateAttributes {
        self.current_record()
            .map(|record| ExtraStateAttributes {
                synced_at: record.synced_at,
                fias_id: record.fias_id,
            })
            .unwrap_or_default()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            identifiers: vec![(DOMAIN.to_string(), self.indicator_id.to_string())],
            name: self.name.clone(),
            model: self.device_model.clone(),
            manufacturer: MANUFACTURER.to_string(),
        }
    }

    pub fn state(&self) -> SensorState {
        SensorState {
            unique_id: self.unique_id.clone(),
            name: self.name.clone(),
            state: self.native_value(),
            available: self.available(),
            unit_of_measurement: self.native_unit_of_measurement(),
            icon: self.icon(),
            device_class: self.device_class(),
            state_class: self.state_class(),
            attributes: self.extra_state_attributes(),
            device: self.device_info(),
        }
    }
}

/// Creates one sensor per meter in the snapshot at the time of the call.
pub fn setup_sensors(coordinator: Arc<dyn Coordinator>, entry: Arc<ConfigEntry>) -> Vec<MeterSensor> {
    let view = coordinator.current_snapshot();
    let Some(snapshot) = view.snapshot() else {
        return Vec::new();
    };
    let sensors: Vec<MeterSensor> = snapshot
        .iter()
        .map(|(id, record)| {
            MeterSensor::new(Arc::clone(&coordinator), Arc::clone(&entry), id.clone(), record)
        })
        .collect();
    info!(sensors = sensors.len(), "sensor platform set up");
    sensors
}
