use crate::error::StoreError;
use crate::meter_record::IndicatorId;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DOMAIN: &str = "my_meters";
pub const CONF_API_URL: &str = "api_url";
pub const CONF_TOKEN: &str = "api_token";
pub const DEFAULT_API_URL: &str = "https://api.doma.ai/v1/meters";
/// Poll once an hour
pub const DEFAULT_SCAN_INTERVAL: u64 = 3600;
pub const ENTRY_TITLE: &str = "Utility meters";
pub const MANUFACTURER: &str = "My Management Co";

const ENTRY_VERSION: u32 = 1;

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL
}

/// Connection settings captured by the setup form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryData {
    pub api_url: String,
    pub api_token: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
}

impl EntryData {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }
}

/// Per-meter additive corrections keyed by the stringified indicator id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Corrections(BTreeMap<String, f64>);

impl Corrections {
    /// Stored offset for a meter, or 0.0 if the user never set one.
    pub fn get(&self, indicator_id: &IndicatorId) -> f64 {
        self.0.get(indicator_id.as_str()).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for Corrections {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub version: u32,
    pub title: String,
    pub data: EntryData,
    #[serde(default)]
    pub options: Corrections,
}

impl ConfigEntry {
    pub fn new(title: impl Into<String>, data: EntryData) -> Self {
        Self {
            version: ENTRY_VERSION,
            title: title.into(),
            data,
            options: Corrections::default(),
        }
    }
}

/// JSON file holding the single config entry of this integration.
#[derive(Debug, Clone)]
pub struct EntryStore {
    path: PathBuf,
}

impl EntryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored entry; `None` if nothing has been set up yet.
    pub fn load(&self) -> Result<Option<ConfigEntry>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let entry = serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Some(entry))
    }

    pub fn save(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(entry).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        fs::write(&self.path, contents).map_err(|e| self.io_error(e))
    }

    /// Wipes the entry together with every stored correction.
    pub fn remove(&self) -> Result<bool, StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
