use crate::config::{
    ConfigEntry, Corrections, EntryData, CONF_API_URL, CONF_TOKEN, DEFAULT_API_URL,
    DEFAULT_SCAN_INTERVAL,
};
use crate::coordinator::SnapshotView;
use crate::error::ApiError;
use crate::meter_record::{IndicatorId, MetricType};
use crate::meters_api::MetersApi;
use serde_derive::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info};

pub const STEP_USER: &str = "user";
pub const STEP_INIT: &str = "init";
/// Key of errors that belong to the form as a whole.
pub const BASE_ERROR: &str = "base";

pub const ERROR_CANNOT_CONNECT: &str = "cannot_connect";
pub const ERROR_REQUIRED: &str = "required";
pub const ERROR_INVALID_NUMBER: &str = "invalid_number";
pub const ERROR_UNKNOWN_FIELD: &str = "unknown_field";

pub type FormErrors = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormField {
    pub key: String,
    pub label: String,
    pub required: bool,
    pub default: Option<FieldValue>,
}

/// Outcome of one form step: either show (again) or store the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult<T> {
    ShowForm {
        step_id: &'static str,
        fields: Vec<FormField>,
        errors: FormErrors,
    },
    CreateEntry {
        title: String,
        data: T,
    },
}

/// What the user typed into the setup form.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInput {
    pub api_url: String,
    pub api_token: String,
    pub scan_interval: Option<u64>,
}

/// Probes the API with the given credentials and returns the entry title.
pub async fn validate_input(input: &UserInput) -> Result<String, ApiError> {
    let api = MetersApi::new(&input.api_url, input.api_token.as_str())?;
    api.validate_credentials().await
}

/// The initial setup form.
#[derive(Debug, Default)]
pub struct ConfigFlow;

impl ConfigFlow {
    pub fn new() -> Self {
        Self
    }

    fn user_form(errors: FormErrors) -> FlowResult<EntryData> {
        FlowResult::ShowForm {
            step_id: STEP_USER,
            fields: vec![
                FormField {
                    key: CONF_API_URL.to_string(),
                    label: "API URL".to_string(),
                    required: true,
                    default: Some(FieldValue::Text(DEFAULT_API_URL.to_string())),
                },
                FormField {
                    key: CONF_TOKEN.to_string(),
                    label: "API token".to_string(),
                    required: true,
                    default: None,
                },
            ],
            errors,
        }
    }

    pub async fn step_user(&self, input: Option<UserInput>) -> FlowResult<EntryData> {
        let Some(input) = input else {
            return Self::user_form(FormErrors::new());
        };

        let mut errors = FormErrors::new();
        if input.api_token.trim().is_empty() {
            errors.insert(CONF_TOKEN.to_string(), ERROR_REQUIRED.to_string());
            return Self::user_form(errors);
        }

        match validate_input(&input).await {
            Ok(title) => {
                info!(url = %input.api_url, "credentials accepted");
                FlowResult::CreateEntry {
                    title,
                    data: EntryData {
                        api_url: input.api_url,
                        api_token: input.api_token,
                        scan_interval: input.scan_interval.unwrap_or(DEFAULT_SCAN_INTERVAL),
                    },
                }
            }
            Err(e) => {
                error!(error = %e, "connection error");
                errors.insert(BASE_ERROR.to_string(), ERROR_CANNOT_CONNECT.to_string());
                Self::user_form(errors)
            }
        }
    }
}

/// Settings form with one correction field per known meter.
#[derive(Debug, Clone)]
pub struct OptionsFlow {
    current: Corrections,
    meters: Vec<(IndicatorId, MetricType)>,
}

impl OptionsFlow {
    /// Fields come from the meters the coordinator currently knows about.
    pub fn new(entry: &ConfigEntry, view: &SnapshotView) -> Self {
        let meters = view
            .snapshot()
            .map(|snapshot| {
                snapshot
                    .iter()
                    .map(|(id, record)| (id.clone(), record.metric_type.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            current: entry.options.clone(),
            meters,
        }
    }

    pub fn fields(&self) -> Vec<FormField> {
        self.meters
            .iter()
            .map(|(id, metric)| FormField {
                key: id.to_string(),
                label: format!("Correction: {} ({id})", metric_label(metric)),
                required: false,
                default: Some(FieldValue::Float(self.current.get(id))),
            })
            .collect()
    }

    fn form(&self, errors: FormErrors) -> FlowResult<Corrections> {
        FlowResult::ShowForm {
            step_id: STEP_INIT,
            fields: self.fields(),
            errors,
        }
    }

    /// Validates the submitted values. Fields left out keep their default;
    /// the result replaces every stored correction.
    pub fn step_init(&self, input: Option<BTreeMap<String, String>>) -> FlowResult<Corrections> {
        let Some(mut input) = input else {
            return self.form(FormErrors::new());
        };

        let mut errors = FormErrors::new();
        let mut corrections = Vec::with_capacity(self.meters.len());
        for (id, _) in &self.meters {
            let value = match input.remove(id.as_str()) {
                None => self.current.get(id),
                Some(text) => match parse_float(&text) {
                    Some(value) => value,
                    None => {
                        errors.insert(id.to_string(), ERROR_INVALID_NUMBER.to_string());
                        continue;
                    }
                },
            };
            corrections.push((id.to_string(), value));
        }
        for unknown in input.into_keys() {
            errors.insert(unknown, ERROR_UNKNOWN_FIELD.to_string());
        }

        if !errors.is_empty() {
            return self.form(errors);
        }
        FlowResult::CreateEntry {
            title: String::new(),
            data: corrections.into_iter().collect(),
        }
    }
}

fn metric_label(metric: &MetricType) -> &str {
    match metric.as_str() {
        "" => "Unknown",
        name => name,
    }
}

fn parse_float(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENTRY_TITLE;
    use crate::meter_record::{MeterRecord, Snapshot};
    use serde_json::json;
    use std::sync::Arc;

    fn entry_with(corrections: &[(&str, f64)]) -> ConfigEntry {
        let mut entry = ConfigEntry::new(
            ENTRY_TITLE,
            EntryData {
                api_url: "http://localhost/meters".to_string(),
                api_token: "t".to_string(),
                scan_interval: DEFAULT_SCAN_INTERVAL,
            },
        );
        entry.options = corrections
            .iter()
            .map(|(id, value)| (id.to_string(), *value))
            .collect();
        entry
    }

    fn fresh_view() -> SnapshotView {
        let records: Vec<MeterRecord> = serde_json::from_value(json!([
            { "indicatorId": "11", "metricType": "ELECTRICITY", "value": 1.0 },
            { "indicatorId": "12", "metricType": "HOT_WATER", "value": 2.0 }
        ]))
        .unwrap();
        let snapshot: Snapshot = records
            .into_iter()
            .map(|record| (record.indicator_id.clone(), record))
            .collect();
        SnapshotView::Fresh(Arc::new(snapshot))
    }

    fn input(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_user_form_defaults() {
        let result = ConfigFlow::new().step_user(None).await;

        let FlowResult::ShowForm { step_id, fields, errors } = result else {
            panic!("expected a form");
        };
        assert_eq!(step_id, STEP_USER);
        assert!(errors.is_empty());
        assert_eq!(fields[0].key, CONF_API_URL);
        assert_eq!(fields[0].default, Some(FieldValue::Text(DEFAULT_API_URL.to_string())));
        assert_eq!(fields[1].key, CONF_TOKEN);
        assert!(fields[1].required);
    }

    #[tokio::test]
    async fn test_user_step_creates_entry() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/meters")
            .match_header("Authorization", "Bearer good")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        let url = format!("{}/v1/meters", server.url());

        let result = ConfigFlow::new()
            .step_user(Some(UserInput {
                api_url: url.clone(),
                api_token: "good".to_string(),
                scan_interval: None,
            }))
            .await;

        assert_eq!(
            result,
            FlowResult::CreateEntry {
                title: ENTRY_TITLE.to_string(),
                data: EntryData {
                    api_url: url,
                    api_token: "good".to_string(),
                    scan_interval: DEFAULT_SCAN_INTERVAL,
                },
            }
        );
    }

    #[tokio::test]
    async fn test_user_step_cannot_connect() {
        for status in [401, 500] {
            let mut server = mockito::Server::new_async().await;
            let _mock = server
                .mock("GET", "/v1/meters")
                .with_status(status)
                .create_async()
                .await;

            let result = ConfigFlow::new()
                .step_user(Some(UserInput {
                    api_url: format!("{}/v1/meters", server.url()),
                    api_token: "bad".to_string(),
                    scan_interval: None,
                }))
                .await;

            let FlowResult::ShowForm { errors, .. } = result else {
                panic!("status {status} must not create an entry");
            };
            assert_eq!(errors.get(BASE_ERROR).map(String::as_str), Some(ERROR_CANNOT_CONNECT));
        }
    }

    #[tokio::test]
    async fn test_user_step_requires_token() {
        let result = ConfigFlow::new()
            .step_user(Some(UserInput {
                api_url: DEFAULT_API_URL.to_string(),
                api_token: "  ".to_string(),
                scan_interval: None,
            }))
            .await;

        let FlowResult::ShowForm { errors, .. } = result else {
            panic!("expected a form");
        };
        assert_eq!(errors.get(CONF_TOKEN).map(String::as_str), Some(ERROR_REQUIRED));
    }

    #[test]
    fn test_options_form_prefills_corrections() {
        let flow = OptionsFlow::new(&entry_with(&[("12", 0.75)]), &fresh_view());
        let fields = flow.fields();

        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].key, "11");
        assert_eq!(fields[0].label, "Correction: ELECTRICITY (11)");
        assert_eq!(fields[0].default, Some(FieldValue::Float(0.0)));
        assert_eq!(fields[1].default, Some(FieldValue::Float(0.75)));
        assert!(!fields[1].required);
    }

    #[test]
    fn test_options_submission_replaces_corrections() {
        let flow = OptionsFlow::new(&entry_with(&[("12", 0.75), ("99", 4.0)]), &fresh_view());
        let result = flow.step_init(input(&[("11", " 5.6 ")]));

        let FlowResult::CreateEntry { data, .. } = result else {
            panic!("expected new options");
        };
        let stored: Vec<(&str, f64)> = data.iter().collect();
        assert_eq!(stored, vec![("11", 5.6), ("12", 0.75)]);
    }

    #[test]
    fn test_options_reject_bad_numbers() {
        let flow = OptionsFlow::new(&entry_with(&[]), &fresh_view());
        let result = flow.step_init(input(&[("11", "abc"), ("12", "inf"), ("13", "1")]));

        let FlowResult::ShowForm { errors, .. } = result else {
            panic!("expected the form again");
        };
        assert_eq!(errors["11"], ERROR_INVALID_NUMBER);
        assert_eq!(errors["12"], ERROR_INVALID_NUMBER);
        assert_eq!(errors["13"], ERROR_UNKNOWN_FIELD);
    }

    #[test]
    fn test_options_without_data_has_no_fields() {
        let flow = OptionsFlow::new(&entry_with(&[("1", 2.0)]), &SnapshotView::Empty);
        assert!(flow.fields().is_empty());
    }
}
