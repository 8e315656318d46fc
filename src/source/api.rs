//! Paginated REST provider.
//!
//! Uses reqwest with Bearer token auth against three endpoints:
//! - `/clients?include=clientProducts` : customers with their products
//! - `/sessions?include=bookings&from=` : sessions with attendance
//! - `/orders?orderDateFrom=` : payments
//!
//! Responses are either a bare JSON array (single page) or
//! `{ data, current_page, last_page }`. The first page tells us `last_page`;
//! the remaining pages are fetched concurrently and re-ordered by page number.

use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

use super::{
    ensure_success, fingerprint, send_with_retry, ApiRecord, FetchWindow, RawBatch, RawRecord,
    RetryPolicy, SourceAdapter, SourceError,
};
use crate::types::ApiSourceConfig;

/// Environment variable consulted when the config carries no token.
pub const API_TOKEN_ENV: &str = "CHURNWATCH_API_TOKEN";

/// Upper bound on `last_page` accepted from the server.
pub const MAX_PAGES: u32 = 2_000;

/// One decoded response page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub data: Vec<Value>,
    pub last_page: u32,
}

/// Everything a spawned page task needs, cheap to clone.
#[derive(Clone)]
struct PageRequest {
    client: reqwest::Client,
    token: String,
    retry: RetryPolicy,
}

impl PageRequest {
    async fn fetch(&self, url: Url) -> Result<Page, SourceError> {
        let request = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json");
        let response = ensure_success(send_with_retry(request, &self.retry).await?).await?;
        let json: Value = response.json().await?;
        decode_page(json)
    }
}

pub struct ApiSource {
    base_url: String,
    per_page: u32,
    max_concurrent_pages: usize,
    request: PageRequest,
}

impl ApiSource {
    pub fn new(config: &ApiSourceConfig, retry: RetryPolicy) -> Result<Self, SourceError> {
        let token = config
            .api_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var(API_TOKEN_ENV).ok().filter(|t| !t.trim().is_empty()))
            .ok_or_else(|| {
                SourceError::Configuration(format!(
                    "No API token configured. Set apiToken or {}",
                    API_TOKEN_ENV
                ))
            })?;

        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| SourceError::Configuration(format!("Invalid baseUrl {}: {}", base_url, e)))?;

        Ok(Self {
            base_url,
            per_page: config.per_page.max(1),
            max_concurrent_pages: config.max_concurrent_pages.max(1),
            request: PageRequest {
                client: reqwest::Client::new(),
                token,
                retry,
            },
        })
    }

    /// Build the URL for one page of an endpoint.
    pub fn page_url(&self, endpoint: &str, params: &[(&str, String)], page: u32) -> Result<Url, SourceError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, endpoint))
            .map_err(|e| SourceError::Configuration(format!("Invalid endpoint {}: {}", endpoint, e)))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("page", &page.to_string());
            query.append_pair("perPage", &self.per_page.to_string());
        }
        Ok(url)
    }

    /// Fetch every page of an endpoint.
    ///
    /// Page tasks are spawned only while a permit is free, so at most
    /// `maxConcurrentPages` requests (and tasks) exist at once.
    async fn fetch_all(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Vec<Value>, SourceError> {
        let first = self.request.fetch(self.page_url(endpoint, params, 1)?).await?;
        let last_page = first.last_page;
        let remaining = remaining_pages(last_page)?;

        let permits = Arc::new(Semaphore::new(self.max_concurrent_pages));
        let mut tasks = JoinSet::new();
        let mut fetched = Vec::with_capacity(remaining.clone().count());
        for page in remaining {
            let url = self.page_url(endpoint, params, page)?;
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SourceError::Decode(format!("page limiter closed: {}", e)))?;
            while let Some(joined) = tasks.try_join_next() {
                fetched.push(page_result(joined)?);
            }
            let request = self.request.clone();
            tasks.spawn(async move {
                let _permit = permit;
                request.fetch(url).await.map(|p| (page, p.data))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            fetched.push(page_result(joined)?);
        }

        let rows = merge_pages(first.data, fetched);
        log::info!("{}: fetched {} records over {} page(s)", endpoint, rows.len(), last_page);
        Ok(rows)
    }
}

fn page_result(
    joined: Result<Result<(u32, Vec<Value>), SourceError>, tokio::task::JoinError>,
) -> Result<(u32, Vec<Value>), SourceError> {
    joined.map_err(|e| SourceError::Decode(format!("page task failed: {}", e)))?
}

/// Pages still to fetch after page 1. Refuses a `last_page` beyond
/// [`MAX_PAGES`].
pub fn remaining_pages(last_page: u32) -> Result<RangeInclusive<u32>, SourceError> {
    if last_page > MAX_PAGES {
        return Err(SourceError::Decode(format!(
            "server reported {} pages, limit is {}",
            last_page, MAX_PAGES
        )));
    }
    Ok(2..=last_page)
}

/// Page 1 followed by the other pages in page order, whatever order they
/// completed in.
pub fn merge_pages(first: Vec<Value>, mut rest: Vec<(u32, Vec<Value>)>) -> Vec<Value> {
    rest.sort_by_key(|(page, _)| *page);
    let mut rows = first;
    for (_, data) in rest {
        rows.extend(data);
    }
    rows
}

#[async_trait]
impl SourceAdapter for ApiSource {
    fn identity(&self) -> String {
        fingerprint(&["api", &self.base_url])
    }

    async fn fetch(&self, window: FetchWindow) -> Result<RawBatch, SourceError> {
        let client_params = [("include", "clientProducts".to_string())];
        let session_params = [
            ("include", "bookings".to_string()),
            ("from", window.visits_from.format("%Y-%m-%d").to_string()),
        ];
        let order_params = [(
            "orderDateFrom",
            window.payments_from.format("%Y-%m-%d").to_string(),
        )];

        let (clients, sessions, orders) = tokio::try_join!(
            self.fetch_all("/clients", &client_params),
            self.fetch_all("/sessions", &session_params),
            self.fetch_all("/orders", &order_params)
        )?;

        let members = flatten_clients(&clients);
        let visits = flatten_sessions(&sessions);
        let payments = flatten_orders(&orders);
        let skipped = members.skipped + visits.skipped + payments.skipped;
        if skipped > 0 {
            log::info!("API source: {} undecodable records skipped", skipped);
        }

        Ok(RawBatch {
            members: members.rows,
            visits: visits.rows,
            payments: payments.rows,
            skipped,
        })
    }
}

/// Decode a response body into a page. A bare array is a single page.
pub fn decode_page(json: Value) -> Result<Page, SourceError> {
    match json {
        Value::Array(data) => Ok(Page { data, last_page: 1 }),
        Value::Object(mut object) => {
            let data = match object.remove("data") {
                Some(Value::Array(data)) => data,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(SourceError::Decode(format!(
                        "expected 'data' to be an array, got {}",
                        type_name(&other)
                    )))
                }
            };
            let last_page = object
                .get("last_page")
                .or_else(|| object.get("lastPage"))
                .and_then(Value::as_u64)
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(1);
            Ok(Page { data, last_page })
        }
        other => Err(SourceError::Decode(format!(
            "expected an array or paginated object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ----------------------------------------------------------------------------
// Payload shapes (only the fields the engine reads)
//
// Scalars accept a number, a string or null. Nested products and bookings
// are decoded one at a time; a bad one is skipped and counted on its own.
// ----------------------------------------------------------------------------

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use crate::normalize::parse_amount;

    pub fn text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(text(&Value::deserialize(d)?))
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_amount(&s),
            _ => None,
        })
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
            _ => false,
        })
    }

    /// An array, or nothing for null and other shapes.
    pub fn list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Value>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items,
            _ => Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientPayload {
    #[serde(rename = "ref", default, deserialize_with = "lenient::string")]
    client_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    first_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    email: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    phone: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    last_visit: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    client_credit_products: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientProductPayload {
    #[serde(default, deserialize_with = "lenient::string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    credit_product_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    status: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient::string")]
    product_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    valid_from: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    valid_until: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    #[serde(rename = "ref", default, deserialize_with = "lenient::string")]
    session_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    start: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    bookings: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct BookingPayload {
    #[serde(rename = "ref", default, deserialize_with = "lenient::string")]
    booking_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    present: bool,
    #[serde(default)]
    client: Option<Value>,
}

impl BookingPayload {
    fn client_ref(&self) -> Option<String> {
        match self.client.as_ref()? {
            Value::Object(client) => client.get("ref").and_then(lenient::text),
            other => lenient::text(other),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    #[serde(rename = "ref", default, deserialize_with = "lenient::string")]
    order_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    order_date: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    client_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    amount_in_vat: Option<f64>,
}

/// Flattened rows plus the number of records that could not be decoded.
#[derive(Debug, Default)]
pub struct Flattened {
    pub rows: Vec<RawRecord>,
    pub skipped: usize,
}

impl Flattened {
    fn decode<T: DeserializeOwned>(&mut self, value: &Value, what: &str) -> Option<T> {
        match serde_json::from_value(value.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                log::debug!("Skipping undecodable {} record: {}", what, e);
                self.skipped += 1;
                None
            }
        }
    }
}

fn put(fields: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        fields.insert(key.to_string(), Value::String(v.to_string()));
    }
}

/// One membership row per client product; customer fields repeat on every
/// row. A client without products yields a single product-less row.
pub fn flatten_clients(clients: &[Value]) -> Flattened {
    let mut out = Flattened::default();
    for value in clients {
        let Some(client) = out.decode::<ClientPayload>(value, "client") else {
            continue;
        };

        let mut base = Map::new();
        put(&mut base, "ref", client.client_ref.as_deref());
        put(&mut base, "firstName", client.first_name.as_deref());
        put(&mut base, "lastName", client.last_name.as_deref());
        put(&mut base, "email", client.email.as_deref());
        put(&mut base, "phone", client.phone.as_deref());
        put(&mut base, "lastVisit", client.last_visit.as_deref());
        put(&mut base, "createdAt", client.created_at.as_deref());

        let products: Vec<ClientProductPayload> = client
            .client_credit_products
            .iter()
            .filter_map(|p| out.decode(p, "client product"))
            .collect();

        if products.is_empty() {
            out.rows.push(RawRecord::Api(ApiRecord::new(base)));
            continue;
        }

        for product in &products {
            let mut fields = base.clone();
            let name = product
                .name
                .as_deref()
                .filter(|n| !n.trim().is_empty())
                .or(product.credit_product_name.as_deref());
            put(&mut fields, "productName", name);
            put(&mut fields, "status", product.status.as_deref());
            put(&mut fields, "productType", product.product_type.as_deref());
            put(&mut fields, "validFrom", product.valid_from.as_deref());
            put(&mut fields, "validUntil", product.valid_until.as_deref());
            if let Some(price) = product.price {
                fields.insert("price".to_string(), json!(price));
            }
            out.rows.push(RawRecord::Api(ApiRecord::new(fields)));
        }
    }
    out
}

/// One visit row per booking, carrying the session's start and status.
pub fn flatten_sessions(sessions: &[Value]) -> Flattened {
    let mut out = Flattened::default();
    for value in sessions {
        let Some(session) = out.decode::<SessionPayload>(value, "session") else {
            continue;
        };

        for raw in &session.bookings {
            let Some(booking) = out.decode::<BookingPayload>(raw, "booking") else {
                continue;
            };
            let mut fields = Map::new();
            put(&mut fields, "sessionRef", session.session_ref.as_deref());
            put(&mut fields, "start", session.start.as_deref());
            put(&mut fields, "sessionStatus", session.status.as_deref());
            put(&mut fields, "bookingRef", booking.booking_ref.as_deref());
            put(&mut fields, "bookingStatus", booking.status.as_deref());
            put(&mut fields, "clientRef", booking.client_ref().as_deref());
            fields.insert("present".to_string(), Value::Bool(booking.present));
            out.rows.push(RawRecord::Api(ApiRecord::new(fields)));
        }
    }
    out
}

pub fn flatten_orders(orders: &[Value]) -> Flattened {
    let mut out = Flattened::default();
    for value in orders {
        let Some(order) = out.decode::<OrderPayload>(value, "order") else {
            continue;
        };
        let mut fields = Map::new();
        put(&mut fields, "ref", order.order_ref.as_deref());
        put(&mut fields, "clientRef", order.client_ref.as_deref());
        put(&mut fields, "orderDate", order.order_date.as_deref());
        put(&mut fields, "status", order.status.as_deref());
        if let Some(amount) = order.amount_in_vat {
            fields.insert("amountInVat".to_string(), json!(amount));
        }
        out.rows.push(RawRecord::Api(ApiRecord::new(fields)));
    }
    out
}
