use serde::de::{self, Deserializer};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Every meter reported by the last successful poll, keyed by indicator.
pub type Snapshot = BTreeMap<IndicatorId, MeterRecord>;

/// Stable identifier of one physical meter.
///
/// The API sends it either as a string or as a number; both are kept as the
/// decimal text so it can be used directly as a correction key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct IndicatorId(String);

impl IndicatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndicatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for IndicatorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        let raw: Raw = serde::Deserialize::deserialize(deserializer)?;
        Ok(match raw {
            Raw::Text(text) => Self(text),
            Raw::Number(number) => Self(number.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum MetricType {
    Electricity,
    HotWater,
    ColdWater,
    Unknown(String),
}

impl MetricType {
    pub fn as_str(&self) -> &str {
        match self {
            MetricType::Electricity => "ELECTRICITY",
            MetricType::HotWater => "HOT_WATER",
            MetricType::ColdWater => "COLD_WATER",
            MetricType::Unknown(raw) => raw,
        }
    }

    /// Any metric whose wire name mentions water, including unknown ones.
    pub fn is_water(&self) -> bool {
        self.as_str().contains("WATER")
    }
}

impl Default for MetricType {
    fn default() -> Self {
        MetricType::Unknown(String::new())
    }
}

impl From<Option<String>> for MetricType {
    fn from(raw: Option<String>) -> Self {
        match raw.as_deref() {
            Some("ELECTRICITY") => MetricType::Electricity,
            Some("HOT_WATER") => MetricType::HotWater,
            Some("COLD_WATER") => MetricType::ColdWater,
            _ => MetricType::Unknown(raw.unwrap_or_default()),
        }
    }
}

impl From<MetricType> for String {
    fn from(metric: MetricType) -> Self {
        metric.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum UnitType {
    Kwh,
    M3,
    Other(String),
}

impl UnitType {
    pub fn as_str(&self) -> &str {
        match self {
            UnitType::Kwh => "KWH",
            UnitType::M3 => "M3",
            UnitType::Other(raw) => raw,
        }
    }
}

impl Default for UnitType {
    fn default() -> Self {
        UnitType::Other(String::new())
    }
}

impl From<Option<String>> for UnitType {
    fn from(raw: Option<String>) -> Self {
        match raw.as_deref() {
            Some("KWH") => UnitType::Kwh,
            Some("M3") => UnitType::M3,
            _ => UnitType::Other(raw.unwrap_or_default()),
        }
    }
}

impl From<UnitType> for String {
    fn from(unit: UnitType) -> Self {
        unit.as_str().to_string()
    }
}

/// One meter as reported under `result.data` of the API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterRecord {
    pub indicator_id: IndicatorId,
    #[serde(default)]
    pub metric_type: MetricType,
    #[serde(default)]
    pub unit_type: UnitType,
    #[serde(default)]
    pub device_model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_reading")]
    pub value: Option<f64>,
    #[serde(default)]
    pub synced_at: Option<String>,
    #[serde(default)]
    pub fias_id: Option<String>,
}

/// Readings normally arrive as numbers, but numeric strings are accepted too.
fn deserialize_reading<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    let raw: Option<Raw> = serde::Deserialize::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(Raw::Number(value)) => Ok(Some(value)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid meter reading `{text}`"))),
    }
}
