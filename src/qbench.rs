use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::domain::{AssayKind, WorkflowState};
use crate::error::UploadError;

/// An existing worksheet field value as reported by QBench.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorksheetValue {
    Number(f64),
    Text(String),
}

impl WorksheetValue {
    /// Zero, empty text and zero percentages count as "no data yet".
    pub fn is_blank(&self) -> bool {
        match self {
            WorksheetValue::Number(value) => *value == 0.0,
            WorksheetValue::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return true;
                }
                match trimmed.trim_end_matches('%').trim().parse::<f64>() {
                    Ok(value) => value == 0.0,
                    Err(_) => false,
                }
            }
        }
    }
}

/// Minimal, validated view of a QBench test relevant for uploads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QBenchTestInfo {
    pub test_id: u64,
    pub assay: AssayKind,
    pub state: WorkflowState,
    pub batches: BTreeSet<String>,
    pub worksheet_processed: bool,
    pub worksheet: BTreeMap<String, WorksheetValue>,
    pub label: String,
}

impl QBenchTestInfo {
    /// Build from a raw test record; `None` for malformed ids or unrelated assays.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let assay_id = raw
            .get("assay")
            .and_then(|assay| assay.get("id"))
            .or_else(|| raw.get("assay_id"))
            .and_then(as_u64)?;
        let assay = AssayKind::from_assay_id(assay_id)?;
        let test_id = raw.get("id").and_then(as_u64)?;

        let state = raw
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()
            .unwrap_or(WorkflowState::Other(String::new()));

        let batches = raw
            .get("batches")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(batch_code).collect())
            .unwrap_or_default();

        let worksheet_processed = raw
            .get("worksheet_processed")
            .map(is_truthy)
            .unwrap_or(false);

        let worksheet = raw
            .get("worksheet_data")
            .and_then(Value::as_object)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|(key, field)| {
                        worksheet_value(field).map(|value| (key.clone(), value))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let label = ["name", "label", "test_name"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Some(Self {
            test_id,
            assay,
            state,
            batches,
            worksheet_processed,
            worksheet,
            label,
        })
    }
}

/// A QBench sample together with its CN/HO tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSample {
    pub id: String,
    pub tests: Vec<QBenchTestInfo>,
}

impl RemoteSample {
    pub fn from_raw(raw: &Value) -> Result<Self, UploadError> {
        let object = raw
            .as_object()
            .ok_or_else(|| UploadError::QBenchPayload("sample is not a JSON object".to_string()))?;
        let id = object
            .get("id")
            .map(|value| match value {
                Value::String(text) => text.trim().to_string(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let tests = object
            .get("tests")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(QBenchTestInfo::from_raw).collect())
            .unwrap_or_default();
        Ok(Self { id, tests })
    }
}

pub trait QBenchClient: Send + Sync {
    /// `Ok(None)` when the sample does not exist remotely.
    fn fetch_sample(&self, sample_id: &str) -> Result<Option<RemoteSample>, UploadError>;
    fn update_test_worksheet(
        &self,
        test_id: u64,
        data: &BTreeMap<String, String>,
    ) -> Result<(), UploadError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct QBenchHttpClient {
    client: Client,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<String>>,
}

impl QBenchHttpClient {
    pub fn new(settings: &Settings) -> Result<Self, UploadError> {
        settings.require_credentials()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("potency-upload/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| UploadError::QBenchHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| UploadError::QBenchHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.qbench_base_url.trim_end_matches('/').to_string(),
            token_url: settings.token_endpoint(),
            client_id: settings.qbench_client_id.clone(),
            client_secret: settings.qbench_client_secret.clone(),
            token: Mutex::new(None),
        })
    }

    fn sample_url(&self, sample_id: &str) -> String {
        format!("{}/v1/sample/{}", self.base_url, sample_id)
    }

    fn worksheet_url(&self, test_id: u64) -> String {
        format!("{}/v1/test/{}/worksheet", self.base_url, test_id)
    }

    fn authenticate(&self) -> Result<String, UploadError> {
        debug!(url = %self.token_url, "requesting QBench access token");
        let response = self.send_with_retries(|| {
            self.client.post(&self.token_url).form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "token request failed".to_string());
            return Err(UploadError::QBenchAuth(format!("status {status}: {message}")));
        }
        let token: TokenResponse = response
            .json()
            .map_err(|err| UploadError::QBenchAuth(err.to_string()))?;
        Ok(token.access_token)
    }

    fn bearer_token(&self, refresh: bool) -> Result<String, UploadError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| UploadError::QBenchAuth("token cache poisoned".to_string()))?;
        if !refresh {
            if let Some(token) = guard.as_ref() {
                return Ok(token.clone());
            }
        }
        let token = self.authenticate()?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Sends an authenticated request; a 401 triggers exactly one re-authentication.
    fn send_authorized<F>(&self, make_req: F) -> Result<Response, UploadError>
    where
        F: Fn() -> RequestBuilder,
    {
        let token = self.bearer_token(false)?;
        let response = self.send_with_retries(|| make_req().bearer_auth(&token))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("QBench rejected the cached token; re-authenticating once");
        let token = self.bearer_token(true)?;
        let response = self.send_with_retries(|| make_req().bearer_auth(&token))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(UploadError::QBenchAuth(
                "request unauthorized after re-authentication".to_string(),
            ));
        }
        Ok(response)
    }

    fn handle_status(response: Response) -> Result<Response, UploadError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "QBench request failed".to_string());
        if status == 403 {
            return Err(UploadError::QBenchAuth(format!("forbidden: {message}")));
        }
        Err(UploadError::QBenchStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, UploadError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(UploadError::QBenchHttp(err.to_string()));
                }
            }
        }
    }
}

impl QBenchClient for QBenchHttpClient {
    fn fetch_sample(&self, sample_id: &str) -> Result<Option<RemoteSample>, UploadError> {
        let url = self.sample_url(sample_id);
        let response = self.send_authorized(|| {
            self.client
                .get(&url)
                .query(&[("include_tests", "true")])
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::handle_status(response)?;
        let raw: Value = response
            .json()
            .map_err(|err| UploadError::QBenchPayload(err.to_string()))?;
        RemoteSample::from_raw(&raw).map(Some)
    }

    fn update_test_worksheet(
        &self,
        test_id: u64,
        data: &BTreeMap<String, String>,
    ) -> Result<(), UploadError> {
        let url = self.worksheet_url(test_id);
        let body = json!({ "data": data });
        let response = self.send_authorized(|| self.client.patch(&url).json(&body))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|n| n.fract() == 0.0 && *n >= 0.0)
                .map(|n| n as u64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn batch_code(value: &Value) -> Option<String> {
    let code = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Object(map) => map.get("id").and_then(batch_code)?,
        _ => return None,
    };
    (!code.is_empty()).then_some(code)
}

/// Worksheet fields are either bare scalars or `{ "value": …, "default_numeric_value": … }`.
fn worksheet_value(field: &Value) -> Option<WorksheetValue> {
    let scalar = match field {
        Value::Object(map) => match map.get("value") {
            Some(value) if !value.is_null() => value,
            _ => map.get("default_numeric_value")?,
        },
        other => other,
    };
    match scalar {
        Value::Number(number) => number.as_f64().map(WorksheetValue::Number),
        Value::String(text) => Some(WorksheetValue::Text(text.clone())),
        Value::Bool(flag) => Some(WorksheetValue::Number(if *flag { 1.0 } else { 0.0 })),
        _ => None,
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_test_record_at_boundary() {
        let raw = json!({
            "id": "901",
            "assay": { "id": 16 },
            "state": "Needs Review (Data Team)",
            "batches": [8398, " 8400 ", { "id": 8401 }],
            "worksheet_processed": 1,
            "worksheet_data": {
                "sample_mass": { "value": "1021" },
                "cbd": { "value": null, "default_numeric_value": 0 },
                "cbg": 0.5,
                "notes": null
            },
            "name": "Potency"
        });
        let info = QBenchTestInfo::from_raw(&raw).unwrap();
        assert_eq!(info.test_id, 901);
        assert_eq!(info.assay, AssayKind::Cn);
        assert_eq!(info.state, WorkflowState::NeedsReview);
        assert_eq!(
            info.batches.iter().cloned().collect::<Vec<_>>(),
            vec!["8398", "8400", "8401"]
        );
        assert!(info.worksheet_processed);
        assert_eq!(
            info.worksheet.get("sample_mass"),
            Some(&WorksheetValue::Text("1021".to_string()))
        );
        assert_eq!(info.worksheet.get("cbd"), Some(&WorksheetValue::Number(0.0)));
        assert!(!info.worksheet.contains_key("notes"));
        assert_eq!(info.label, "Potency");
    }

    #[test]
    fn drops_unrelated_or_malformed_tests() {
        let sample = RemoteSample::from_raw(&json!({
            "id": 15042,
            "tests": [
                { "id": 1, "assay": { "id": 99 }, "state": "NEEDS REVIEW (DATA TEAM)" },
                { "id": "abc", "assay": { "id": 16 } },
                { "id": 2, "assay": { "id": "34" }, "state": "IN PROGRESS" }
            ]
        }))
        .unwrap();
        assert_eq!(sample.id, "15042");
        assert_eq!(sample.tests.len(), 1);
        assert_eq!(sample.tests[0].assay, AssayKind::Ho);
    }

    #[test]
    fn blank_worksheet_values() {
        assert!(WorksheetValue::Number(0.0).is_blank());
        assert!(WorksheetValue::Text("  ".to_string()).is_blank());
        assert!(WorksheetValue::Text("0.00%".to_string()).is_blank());
        assert!(!WorksheetValue::Text("12.5%".to_string()).is_blank());
        assert!(!WorksheetValue::Text("ND".to_string()).is_blank());
        assert!(!WorksheetValue::Number(3.1).is_blank());
    }
}
