//! Upstream member-system providers.
//!
//! Both providers yield the same provider-agnostic [`RawBatch`]: untyped
//! membership, visit and payment rows behind the [`RowAccess`] capability.
//! The normalizer never sees which provider produced a row.
//!
//! Modules:
//! - api: paginated REST API (bearer token, parallel page fetch)
//! - sheet: flat tabular export (published CSV or local workbook)

pub mod api;
pub mod sheet;

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Config, RetryConfig, SourceConfig};

// ============================================================================
// Row shapes
// ============================================================================

/// Minimal row-access capability the normalizer is written against.
pub trait RowAccess {
    /// Raw cell/field value, `None` when the field is absent or null.
    fn get(&self, field: &str) -> Option<Cow<'_, str>>;

    /// First non-blank value among alias field names.
    fn first_of(&self, fields: &[&str]) -> Option<Cow<'_, str>> {
        fields
            .iter()
            .find_map(|f| self.get(f).filter(|v| !v.trim().is_empty()))
    }
}

/// One row of a tabular export, keyed by header text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabularRow {
    cells: HashMap<String, String>,
}

impl TabularRow {
    /// Zip headers with values. Missing trailing cells become empty strings.
    pub fn from_cells(headers: &[String], values: Vec<String>) -> Self {
        let mut values = values.into_iter();
        let cells = headers
            .iter()
            .map(|h| (h.trim().to_string(), values.next().unwrap_or_default()))
            .collect();
        Self { cells }
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            cells: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl RowAccess for TabularRow {
    fn get(&self, field: &str) -> Option<Cow<'_, str>> {
        self.cells.get(field).map(|v| Cow::Borrowed(v.as_str()))
    }
}

/// One flattened JSON object from the REST API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiRecord {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl ApiRecord {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { fields }
    }
}

impl From<serde_json::Value> for ApiRecord {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }
}

impl RowAccess for ApiRecord {
    fn get(&self, field: &str) -> Option<Cow<'_, str>> {
        match self.fields.get(field)? {
            serde_json::Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            serde_json::Value::Number(n) => Some(Cow::Owned(n.to_string())),
            serde_json::Value::Bool(b) => Some(Cow::Owned(b.to_string())),
            _ => None,
        }
    }
}

/// A raw upstream row, tagged by provider shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Tabular(TabularRow),
    Api(ApiRecord),
}

impl RowAccess for RawRecord {
    fn get(&self, field: &str) -> Option<Cow<'_, str>> {
        match self {
            RawRecord::Tabular(row) => row.get(field),
            RawRecord::Api(record) => record.get(field),
        }
    }
}

/// Everything one fetch cycle pulls from upstream, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    /// One row per customer subscription (customers repeat).
    pub members: Vec<RawRecord>,
    pub visits: Vec<RawRecord>,
    pub payments: Vec<RawRecord>,
    /// Records the adapter could not decode at all. Carried into the
    /// normalizer's skipped-row count.
    pub skipped: usize,
}

/// Date bounds a provider may use to limit what it fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub visits_from: NaiveDate,
    pub payments_from: NaiveDate,
}

// ============================================================================
// Adapter trait
// ============================================================================

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Upstream rejected credentials (status {0})")]
    Unauthorized(u16),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("Unexpected response shape: {0}")]
    Decode(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Http(err) => err.is_timeout() || err.is_connect(),
            SourceError::Api { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }
}

/// A provider of raw member, visit and payment rows.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable fingerprint of the provider and its locators. Cache keys are
    /// prefixed with it so switching sources never serves the old snapshot.
    fn identity(&self) -> String;

    async fn fetch(&self, window: FetchWindow) -> Result<RawBatch, SourceError>;
}

/// Build the adapter named by the configuration. Missing credentials or
/// malformed locators fail here, not inside the first fetch.
pub fn from_config(config: &Config) -> Result<Box<dyn SourceAdapter>, SourceError> {
    let retry = RetryPolicy::from(&config.retry);
    match &config.source {
        SourceConfig::Sheet(sheet) => Ok(Box::new(sheet::SheetSource::new(sheet, retry)?)),
        SourceConfig::Api(api) => Ok(Box::new(api::ApiSource::new(api, retry)?)),
    }
}

/// Short hex digest used by adapters for [`SourceAdapter::identity`].
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying transport failures and 408/429/5xx responses.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, SourceError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(SourceError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "source retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "source retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(SourceError::Http(err));
            }
        }
    }

    Err(SourceError::Decode("request exhausted retries".to_string()))
}

/// Turn a non-success response into a typed error.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(SourceError::Unauthorized(status.as_u16()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(SourceError::Api {
        status: status.as_u16(),
        message: message.chars().take(300).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tabular_row_first_of_skips_blank() {
        let row = TabularRow::from_pairs(&[("Klant ref.", "  "), ("ref", "K42")]);
        assert_eq!(row.first_of(&["Klant ref.", "ref"]).as_deref(), Some("K42"));
        assert_eq!(row.first_of(&["missing"]), None);
    }

    #[test]
    fn test_tabular_row_pads_missing_cells() {
        let headers = vec!["a".to_string(), "b".to_string(), " c ".to_string()];
        let row = TabularRow::from_cells(&headers, vec!["1".to_string()]);
        assert_eq!(row.get("a").as_deref(), Some("1"));
        assert_eq!(row.get("b").as_deref(), Some(""));
        assert_eq!(row.get("c").as_deref(), Some(""));
    }

    #[test]
    fn test_api_record_stringifies_scalars() {
        let record = ApiRecord::from(json!({
            "ref": "C1",
            "price": 49.95,
            "present": true,
            "validUntil": null,
            "nested": { "x": 1 }
        }));
        assert_eq!(record.get("ref").as_deref(), Some("C1"));
        assert_eq!(record.get("price").as_deref(), Some("49.95"));
        assert_eq!(record.get("present").as_deref(), Some("true"));
        assert_eq!(record.get("validUntil"), None);
        assert_eq!(record.get("nested"), None);
    }

    #[test]
    fn test_raw_record_delegates() {
        let tabular = RawRecord::Tabular(TabularRow::from_pairs(&[("Status", "Actief")]));
        let api = RawRecord::Api(ApiRecord::from(json!({ "status": "active" })));
        assert_eq!(tabular.first_of(&["Status", "status"]).as_deref(), Some("Actief"));
        assert_eq!(api.first_of(&["Status", "status"]).as_deref(), Some("active"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let a = fingerprint(&["api", "https://x.example/tenant/a"]);
        let b = fingerprint(&["api", "https://x.example/tenant/b"]);
        assert_eq!(a, fingerprint(&["api", "https://x.example/tenant/a"]));
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_retry_delay_honours_retry_after() {
        let policy = RetryPolicy::default();
        let header = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(retry_delay(1, &policy, Some(&header)), Duration::from_secs(7));

        let huge = reqwest::header::HeaderValue::from_static("600");
        assert_eq!(retry_delay(1, &policy, Some(&huge)), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 1_000,
        };
        let first = retry_delay(1, &policy, None);
        assert!(first >= Duration::from_millis(250) && first < Duration::from_millis(400));
        let late = retry_delay(5, &policy, None);
        assert!(late >= Duration::from_millis(1_000) && late < Duration::from_millis(1_150));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(reqwest::StatusCode::NOT_FOUND));
    }
}
