//! Remote catalog search API client and raw-item normalization.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cellar_core::{AttrValue, Record};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "cellar-client";

pub const DEFAULT_ENDPOINT: &str = "https://platform.cloud.coveo.com/rest/search/v2";

/// One search request against the catalog API. The advanced query and facet
/// selections narrow the result set server-side; pagination is supplied per
/// call by the fetch loop, not stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub tab: String,
    pub sort: String,
    pub advanced_query: String,
    #[serde(default)]
    pub facets: Vec<FacetFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetFilter {
    pub field: String,
    pub value: String,
}

impl Default for SearchQuery {
    /// The highly-rated red wine listing the pipeline was built around.
    fn default() -> Self {
        Self {
            text: String::new(),
            tab: "clp-products-wine-red_wine".to_string(),
            sort: "ec_rating descending".to_string(),
            advanced_query: "@ec_visibility==(2,4) @cp_Browse_category_deny<>0 \
                             @ec_category==\"Products|Wine|Red Wine\" \
                             (@ec_rating==5..5 OR @ec_rating==4..4.9)"
                .to_string(),
            facets: vec![FacetFilter {
                field: "ec_rating".to_string(),
                value: "4..5inc".to_string(),
            }],
        }
    }
}

/// Opaque store-scoping context. The fetcher passes it through unchanged as
/// the request's dictionary field context; only the upstream API interprets
/// the keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreContext {
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl StoreContext {
    /// Standard inventory-scoping context for a single retail store id.
    pub fn for_inventory(store_id: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("stores_stock".to_string(), String::new());
        fields.insert("stores_inventory".to_string(), store_id.to_string());
        fields.insert("stores_stock_combined".to_string(), store_id.to_string());
        fields.insert(
            "stores_low_stock_combined".to_string(),
            store_id.to_string(),
        );
        Self { fields }
    }
}

/// One raw item as returned by the search API: top-level title/uri plus a
/// nested map of raw attribute fields.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Map<String, JsonValue>,
}

/// One page of search results plus the server-reported total across pages.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub results: Vec<RawItem>,
    pub total_count: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level or 5xx/429 condition; the caller may retry the page.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Malformed response shape or non-retryable rejection; the caller must
    /// abort pagination and keep whatever pages already aggregated.
    #[error("fatal fetch failure: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Seam between the refresh orchestrator and the network. The orchestrator
/// owns retries, pacing, and gap handling; implementations issue exactly one
/// bounded request per call.
#[async_trait]
pub trait PageFetch: Send + Sync {
    async fn fetch_page(
        &self,
        query: &SearchQuery,
        context: Option<&StoreContext>,
        offset: u64,
        page_size: u64,
    ) -> Result<SearchPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub organization_id: String,
    pub api_key: String,
    pub user_agent: String,
    pub referer: Option<String>,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("CELLAR_API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            organization_id: std::env::var("CELLAR_API_ORG")
                .unwrap_or_else(|_| "lcboproduction2kwygmc".to_string()),
            api_key: std::env::var("CELLAR_API_KEY").unwrap_or_default(),
            user_agent: std::env::var("CELLAR_USER_AGENT")
                .unwrap_or_else(|_| "cellarwatch/0.1".to_string()),
            referer: std::env::var("CELLAR_API_REFERER").ok(),
            timeout: Duration::from_secs(
                std::env::var("CELLAR_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
        }
    }
}

/// reqwest-backed [`PageFetch`] implementation.
#[derive(Debug)]
pub struct CatalogClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl CatalogClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn request_url(&self) -> String {
        format!(
            "{}?organizationId={}",
            self.config.endpoint, self.config.organization_id
        )
    }
}

#[async_trait]
impl PageFetch for CatalogClient {
    async fn fetch_page(
        &self,
        query: &SearchQuery,
        context: Option<&StoreContext>,
        offset: u64,
        page_size: u64,
    ) -> Result<SearchPage, FetchError> {
        let payload = build_search_payload(query, context, offset, page_size);
        let mut request = self
            .client
            .post(self.request_url())
            .bearer_auth(&self.config.api_key)
            .json(&payload);
        if let Some(referer) = &self.config.referer {
            request = request.header(reqwest::header::REFERER, referer);
        }

        let response = request.send().await.map_err(|err| {
            match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => FetchError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => FetchError::Fatal(err.to_string()),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("http status {status} at offset {offset}");
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => FetchError::Transient(message),
                RetryDisposition::NonRetryable => FetchError::Fatal(message),
            });
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|err| FetchError::Fatal(format!("undecodable response body: {err}")))?;
        parse_search_page(&body)
    }
}

/// Request payload in the upstream search API's wire shape. The store
/// context rides along as `context.dictionaryFieldContext` only when given.
pub fn build_search_payload(
    query: &SearchQuery,
    context: Option<&StoreContext>,
    offset: u64,
    page_size: u64,
) -> JsonValue {
    let facets: Vec<JsonValue> = query
        .facets
        .iter()
        .map(|facet| {
            json!({
                "field": facet.field,
                "currentValues": [{ "value": facet.value, "state": "selected" }],
            })
        })
        .collect();

    let mut payload = json!({
        "q": query.text,
        "tab": query.tab,
        "sort": query.sort,
        "aq": query.advanced_query,
        "facets": facets,
        "numberOfResults": page_size,
        "firstResult": offset,
    });

    if let Some(context) = context {
        payload["context"] = json!({ "dictionaryFieldContext": context.fields });
    }

    payload
}

/// A response without a `results` array is the API's error shape and aborts
/// pagination; everything else decodes leniently.
pub fn parse_search_page(body: &JsonValue) -> Result<SearchPage, FetchError> {
    let results = body
        .get("results")
        .and_then(|v| v.as_array())
        .ok_or_else(|| FetchError::Fatal("response lacks a 'results' array".to_string()))?;

    let items: Vec<RawItem> = results
        .iter()
        .map(|item| {
            serde_json::from_value(item.clone())
                .map_err(|err| FetchError::Fatal(format!("undecodable result item: {err}")))
        })
        .collect::<Result<_, _>>()?;

    let total_count = body
        .get("totalCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(items.len() as u64);

    Ok(SearchPage {
        results: items,
        total_count,
    })
}

/// Raw attribute fields lifted verbatim into `Record::attributes`.
const ATTRIBUTE_FIELDS: &[&str] = &[
    "country_of_manufacture",
    "lcbo_region_name",
    "lcbo_varietal_name",
    "lcbo_program",
    "ec_shortdesc",
    "lcbo_tastingnotes",
    "ec_thumbnails",
    "lcbo_unit_volume",
    "lcbo_alcohol_percent",
    "lcbo_sugar_gm_per_ltr",
    "lcbo_bottles_per_pack",
    "ec_category",
    "sysconcepts",
    "is_buyable",
    "created_at",
    "stores_inventory",
    "online_inventory",
    "view_rank_yearly",
    "view_rank_monthly",
    "sell_rank_yearly",
    "sell_rank_monthly",
];

/// Map one raw API item into the canonical record shape.
///
/// Never fails for a structurally valid item: every absent field takes a
/// defined default. An item without an identifier is dropped (logged) since
/// it can never be upserted or favorited.
pub fn normalize(item: &RawItem, refreshed_at: DateTime<Utc>) -> Option<Record> {
    let id = match item.uri.as_deref().map(str::trim) {
        Some(uri) if !uri.is_empty() => uri.to_string(),
        _ => {
            warn!(title = item.title.as_deref().unwrap_or(""), "dropping raw item without identifier");
            return None;
        }
    };

    let title = item
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());

    let mut attributes = BTreeMap::new();
    for field in ATTRIBUTE_FIELDS {
        attributes.insert((*field).to_string(), attr_value(item.raw.get(*field)));
    }

    Some(Record {
        id,
        title,
        price: number_field(&item.raw, "ec_price"),
        promo_price: number_field(&item.raw, "ec_promo_price"),
        rating_value: number_field(&item.raw, "ec_rating"),
        rating_count: number_field(&item.raw, "avg_reviews")
            .map(|v| v.max(0.0) as u32)
            .unwrap_or(0),
        attributes,
        score: 0.0,
        last_refreshed: refreshed_at,
    })
}

fn number_field(raw: &serde_json::Map<String, JsonValue>, key: &str) -> Option<f64> {
    match raw.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
                None
            } else {
                trimmed.parse().ok()
            }
        }
        _ => None,
    }
}

fn attr_value(value: Option<&JsonValue>) -> AttrValue {
    match value {
        None | Some(JsonValue::Null) => AttrValue::Unavailable,
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .map(AttrValue::Number)
            .unwrap_or(AttrValue::Unavailable),
        Some(JsonValue::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
                AttrValue::Unavailable
            } else {
                AttrValue::Text(trimmed.to_string())
            }
        }
        Some(JsonValue::Bool(b)) => AttrValue::Text(b.to_string()),
        Some(other) => AttrValue::Text(other.to_string()),
    }
}
