use crate::config::ENTRY_TITLE;
use crate::error::ApiError;
use crate::meter_record::{MeterRecord, Snapshot};
use chrono::{DateTime, FixedOffset, SecondsFormat};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode, Url};
use serde::de;
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Upper bound of the sync window requested from the API.
pub const END_SYNCED_AT_PARAM: &str = "filter.endSyncedAt";

/// Client for the metering API, authenticated with a bearer token.
pub struct MetersApi {
    endpoint_url: Url,
    auth_token: String,
    client: reqwest::Client,
}

impl MetersApi {
    pub fn new(api_url: &str, auth_token: impl Into<String>) -> Result<Self, ApiError> {
        let endpoint_url = Url::parse(api_url).map_err(|e| ApiError::InvalidUrl {
            url: api_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            endpoint_url,
            auth_token: auth_token.into(),
            client: reqwest::Client::new(),
        })
    }

    pub fn endpoint_url(&self) -> &Url {
        &self.endpoint_url
    }

    /// Checks the token with one plain GET of the endpoint.
    ///
    /// The body only has to be valid JSON; its content is ignored. Returns the
    /// title for the new config entry.
    #[instrument(skip_all, fields(url = %self.endpoint_url))]
    pub async fn validate_credentials(&self) -> Result<String, ApiError> {
        let response = self
            .client
            .get(self.endpoint_url.clone())
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        let body = success_body(response).await?;
        serde_json::from_str::<Value>(&body)?;
        Ok(ENTRY_TITLE.to_string())
    }

    /// Endpoint URL with `filter.endSyncedAt` set to `now`, replacing any
    /// value already present in the configured URL.
    pub fn poll_url(&self, now: &DateTime<FixedOffset>) -> Url {
        let mut url = self.endpoint_url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != END_SYNCED_AT_PARAM)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(END_SYNCED_AT_PARAM, &end_synced_at(now));
        url
    }

    /// Fetches every meter synced up to `now`.
    #[instrument(skip_all, fields(url = %self.endpoint_url))]
    pub async fn fetch_meters(&self, now: &DateTime<FixedOffset>) -> Result<Snapshot, ApiError> {
        let url = self.poll_url(now);
        debug!(%url, "requesting meters");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.auth_token)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;
        let body = success_body(response).await?;
        let payload: Value = serde_json::from_str(&body)?;
        parse_meter_list(payload)
    }
}

/// RFC 3339 with whole seconds and a numeric offset, e.g. `2026-02-11T12:00:00+03:00`.
pub fn end_synced_at(now: &DateTime<FixedOffset>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Body text of a 200 response; anything else becomes [`ApiError::Status`].
async fn success_body(response: Response) -> Result<String, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if status != StatusCode::OK {
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

/// Collects `result.data` of every envelope in the response list.
///
/// A payload that is not a list yields an empty snapshot, and envelopes with
/// no or empty meter data are skipped, as are records that cannot be decoded.
/// An envelope that is not an object, a `result` that is not an object, or
/// non-empty `data` that is not an object fails the whole payload.
pub fn parse_meter_list(payload: Value) -> Result<Snapshot, ApiError> {
    let Value::Array(envelopes) = payload else {
        warn!("unexpected response format, expected a list of meters");
        return Ok(Snapshot::new());
    };

    let mut snapshot = Snapshot::new();
    for (index, envelope) in envelopes.into_iter().enumerate() {
        let Value::Object(mut envelope) = envelope else {
            return Err(malformed(format!("element {index} is not an object")));
        };
        let mut result = match envelope.remove("result") {
            None => continue,
            Some(Value::Object(result)) => result,
            Some(_) => return Err(malformed(format!("`result` of element {index} is not an object"))),
        };
        let data = match result.remove("data") {
            Some(Value::Object(data)) if !data.is_empty() => data,
            Some(data) if !is_empty_value(&data) => {
                return Err(malformed(format!("`data` of element {index} is not an object")));
            }
            _ => {
                debug!(index, "skipping envelope without meter data");
                continue;
            }
        };
        match serde_json::from_value::<MeterRecord>(Value::Object(data)) {
            Ok(record) => {
                snapshot.insert(record.indicator_id.clone(), record);
            }
            Err(e) => warn!(index, error = %e, "skipping malformed meter record"),
        }
    }
    Ok(snapshot)
}

fn malformed(reason: String) -> ApiError {
    ApiError::Decode(de::Error::custom(reason))
}

/// `null`, `false`, zero and empty strings, lists and objects carry no data.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

#[cfg(test)]
mod test_meters_api {
    use super::*;
    use crate::meter_record::{IndicatorId, MetricType, UnitType};
    use chrono::TimeZone;
    use mockito::Matcher;
    use serde_json::json;

    fn moscow_noon() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 2, 11, 12, 0, 5)
            .unwrap()
    }

    const METERS_BODY: &str = r#"
        [
            {
                "result": {
                    "data": {
                        "indicatorId": "1001",
                        "metricType": "ELECTRICITY",
                        "unitType": "KWH",
                        "deviceModel": "Mercury 200",
                        "value": 5120.5,
                        "syncedAt": "2026-02-10T09:00:00+03:00",
                        "fiasId": "fias-1"
                    }
                }
            },
            {
                "result": {
                    "data": {
                        "indicatorId": 1002,
                        "metricType": "COLD_WATER",
                        "unitType": "M3",
                        "value": null
                    }
                }
            },
            { "result": {} },
            { "error": "meter offline" }
        ]
    "#;

    #[test]
    fn test_end_synced_at_has_whole_seconds() {
        let now = moscow_noon() + chrono::Duration::microseconds(999_999);
        assert_eq!(end_synced_at(&now), "2026-02-11T12:00:05+03:00");
    }

    #[test]
    fn test_end_synced_at_utc_uses_numeric_offset() {
        let now = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 2, 11, 9, 0, 0)
            .unwrap();
        assert_eq!(end_synced_at(&now), "2026-02-11T09:00:00+00:00");
    }

    #[test]
    fn test_poll_url_replaces_existing_filter() {
        let api = MetersApi::new(
            "https://api.example.com/v1/meters?page=2&filter.endSyncedAt=old",
            "t",
        )
        .unwrap();
        let url = api.poll_url(&moscow_noon());

        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/meters?page=2&filter.endSyncedAt=2026-02-11T12%3A00%3A05%2B03%3A00"
        );
    }

    #[test]
    fn test_invalid_url() {
        let result = MetersApi::new("not a url", "t");
        assert!(matches!(result, Err(ApiError::InvalidUrl { .. })));
    }

    #[test]
    fn test_parse_meter_list() {
        let snapshot = parse_meter_list(serde_json::from_str(METERS_BODY).unwrap()).unwrap();

        assert_eq!(snapshot.len(), 2);
        let electricity = &snapshot[&IndicatorId::new("1001")];
        assert_eq!(electricity.metric_type, MetricType::Electricity);
        assert_eq!(electricity.value, Some(5120.5));
        let water = &snapshot[&IndicatorId::new("1002")];
        assert_eq!(water.unit_type, UnitType::M3);
        assert_eq!(water.value, None);
    }

    #[test]
    fn test_parse_object_payload_is_empty() {
        let snapshot =
            parse_meter_list(json!({ "result": { "data": { "indicatorId": "1" } } })).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_parse_skips_records_without_id() {
        let snapshot = parse_meter_list(json!([
            { "result": { "data": { "metricType": "ELECTRICITY", "value": 1.0 } } },
            { "result": { "data": { "indicatorId": "2", "value": 2.0 } } }
        ]))
        .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&IndicatorId::new("2")));
    }

    #[test]
    fn test_parse_skips_empty_data() {
        let snapshot = parse_meter_list(json!([
            { "result": { "data": null } },
            { "result": { "data": "" } },
            { "result": { "data": [] } },
            { "result": { "data": { "indicatorId": "3", "value": 3.0 } } }
        ]))
        .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&IndicatorId::new("3")));
    }

    #[test]
    fn test_parse_rejects_malformed_envelopes() {
        let valid = json!({ "result": { "data": { "indicatorId": "1", "value": 5.0 } } });
        for bad in [
            json!(42),
            json!("meter"),
            json!({ "result": null }),
            json!({ "result": [1, 2] }),
            json!({ "result": { "data": "garbage" } }),
            json!({ "result": { "data": [{ "indicatorId": "1" }] } }),
        ] {
            let result = parse_meter_list(json!([valid.clone(), bad.clone()]));
            assert!(
                matches!(result, Err(ApiError::Decode(_))),
                "accepted {bad}: {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_validate_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/meters")
            .match_header("Authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let api = MetersApi::new(&format!("{}/v1/meters", server.url()), "test_token").unwrap();
        let title = api.validate_credentials().await.unwrap();

        assert_eq!(title, ENTRY_TITLE);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_validate_credentials_rejected() {
        for status in [401, 500] {
            let mut server = mockito::Server::new_async().await;
            let _mock = server
                .mock("GET", "/v1/meters")
                .with_status(status)
                .with_body("nope")
                .create_async()
                .await;

            let api = MetersApi::new(&format!("{}/v1/meters", server.url()), "bad").unwrap();
            let result = api.validate_credentials().await;

            match result {
                Err(ApiError::Status { status: got, body }) => {
                    assert_eq!(got as usize, status);
                    assert_eq!(body, "nope");
                }
                other => panic!("expected status error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_validate_credentials_requires_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/meters")
            .with_status(200)
            .with_body("<html>login</html>")
            .create_async()
            .await;

        let api = MetersApi::new(&format!("{}/v1/meters", server.url()), "t").unwrap();
        let result = api.validate_credentials().await;

        assert!(matches!(result, Err(ApiError::Decode(_))));
    }

    #[tokio::test]
    async fn test_fetch_meters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/meters")
            .match_query(Matcher::UrlEncoded(
                END_SYNCED_AT_PARAM.to_string(),
                "2026-02-11T12:00:05+03:00".to_string(),
            ))
            .match_header("Authorization", "Bearer test_token")
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(METERS_BODY)
            .create_async()
            .await;

        let api = MetersApi::new(&format!("{}/v1/meters", server.url()), "test_token").unwrap();
        let snapshot = api.fetch_meters(&moscow_noon()).await.unwrap();

        assert_eq!(snapshot.len(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_meters_maintenance() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/meters")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let api = MetersApi::new(&format!("{}/v1/meters", server.url()), "t").unwrap();
        let err = api.fetch_meters(&moscow_noon()).await.unwrap_err();

        assert_eq!(err.to_string(), "API error 503: maintenance");
    }

    #[tokio::test]
    async fn test_fetch_meters_object_payload() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/meters")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{ "message": "no meters" }"#)
            .create_async()
            .await;

        let api = MetersApi::new(&format!("{}/v1/meters", server.url()), "t").unwrap();
        let snapshot = api.fetch_meters(&moscow_noon()).await.unwrap();

        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_meters_malformed_list() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/meters")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("[42]")
            .create_async()
            .await;

        let api = MetersApi::new(&format!("{}/v1/meters", server.url()), "t").unwrap();
        let err = api.fetch_meters(&moscow_noon()).await.unwrap_err();

        assert!(matches!(err, ApiError::Decode(_)));
        assert!(err.to_string().contains("element 0"), "got {err}");
    }

    #[tokio::test]
    async fn test_fetch_meters_connection_refused() {
        let api = MetersApi::new("http://127.0.0.1:1/v1/meters", "t").unwrap();
        let result = api.fetch_meters(&moscow_noon()).await;

        assert!(matches!(result, Err(ApiError::Request(_))));
    }
}
