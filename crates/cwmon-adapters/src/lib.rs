//! Listing-source contract and the CrowdWorks public job list extractor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cwmon_core::{Listing, PaymentInfo, LISTING_URL_BASE};
use cwmon_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cwmon-adapters";

pub const CROWDWORKS_SOURCE_ID: &str = "crowdworks";

/// Element whose `data` attribute carries the serialized page state.
const STATE_CONTAINER_SELECTOR: &str = "#vue-container";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("embedded state container not found or has no data attribute")]
    MissingStateContainer,
    #[error("embedded state is not valid JSON: {0}")]
    InvalidState(#[from] serde_json::Error),
    #[error("embedded state has no searchResult")]
    MissingSearchResult,
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Listing>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct CrowdworksAdapter {
    listing_url: String,
}

impl Default for CrowdworksAdapter {
    fn default() -> Self {
        Self::new(LISTING_URL_BASE)
    }
}

impl CrowdworksAdapter {
    pub fn new(listing_url: impl Into<String>) -> Self {
        Self {
            listing_url: listing_url.into(),
        }
    }

    pub fn listing_url(&self) -> &str {
        &self.listing_url
    }
}

#[async_trait]
impl ListingSource for CrowdworksAdapter {
    fn source_id(&self) -> &'static str {
        CROWDWORKS_SOURCE_ID
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = http
            .fetch_text(ctx.run_id, self.source_id(), &self.listing_url)
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Listing>, AdapterError> {
        let state = extract_embedded_state(&page.body)?;
        let offers = state
            .get("searchResult")
            .ok_or(AdapterError::MissingSearchResult)?
            .get("job_offers")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let listings: Vec<Listing> = offers.iter().filter_map(listing_from_offer).collect();
        debug!(offers = offers.len(), listings = listings.len(), url = %page.url, "parsed listing page");
        Ok(listings)
    }
}

pub fn adapter_for_source(source_id: &str, listing_url: &str) -> Option<Box<dyn ListingSource>> {
    match source_id {
        CROWDWORKS_SOURCE_ID => Some(Box::new(CrowdworksAdapter::new(listing_url))),
        _ => None,
    }
}

/// Locate the state container and parse its (entity-decoded) `data` attribute.
pub fn extract_embedded_state(html: &str) -> Result<JsonValue, AdapterError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(STATE_CONTAINER_SELECTOR)
        .map_err(|e| AdapterError::Message(e.to_string()))?;
    let data = document
        .select(&selector)
        .next()
        .and_then(|node| node.value().attr("data"))
        .ok_or(AdapterError::MissingStateContainer)?;
    // Attribute values arrive decoded; a double-escaped payload still carries `&quot;`.
    let data = if data.contains("&quot;") {
        data.replace("&quot;", "\"")
    } else {
        data.to_string()
    };
    Ok(serde_json::from_str(&data)?)
}

/// Project one `searchResult.job_offers[]` entry into a [`Listing`].
pub fn listing_from_offer(entry: &JsonValue) -> Option<Listing> {
    let offer = entry.get("job_offer").unwrap_or(&JsonValue::Null);
    let client = entry.get("client").unwrap_or(&JsonValue::Null);

    let Some(id) = json_u64(offer, &["id"]) else {
        warn!(title = json_str(offer, &["title"]).unwrap_or_default(), "job offer without id skipped");
        return None;
    };

    Some(Listing {
        id,
        title: json_str(offer, &["title"]).unwrap_or_default().to_string(),
        url: Listing::url_for_id(id),
        description: json_str(offer, &["description_digest"])
            .unwrap_or_default()
            .to_string(),
        category_id: json_u64(offer, &["category_id"]),
        expired_on: json_str(offer, &["expired_on"]).unwrap_or_default().to_string(),
        last_released_at: json_str(offer, &["last_released_at"])
            .unwrap_or_default()
            .to_string(),
        payment_info: PaymentInfo::Text(payment_text(entry.get("payment").unwrap_or(&JsonValue::Null))),
        client_name: json_str(client, &["username"]).unwrap_or_default().to_string(),
        is_employer_certification: client
            .get("is_employer_certification")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
    })
}

/// Human-readable payment string for one of the three payment shapes.
pub fn payment_text(payment: &JsonValue) -> String {
    if let Some(fixed) = payment.get("fixed_price_payment") {
        let min = json_amount(fixed, "min_budget");
        let max = json_amount(fixed, "max_budget");
        return match (min, max) {
            (Some(min), Some(max)) => format!("{min}円 〜 {max}円"),
            (None, Some(max)) => format!("〜 {max}円"),
            (Some(min), None) => format!("{min}円 〜"),
            (None, None) => String::new(),
        };
    }
    if let Some(hourly) = payment.get("hourly_payment") {
        let min = json_amount(hourly, "min_hourly_wage");
        let max = json_amount(hourly, "max_hourly_wage");
        return match (min, max) {
            (Some(min), Some(max)) => format!("時給 {min}円 〜 {max}円"),
            (Some(min), None) => format!("時給 {min}円 〜"),
            (None, Some(max)) => format!("時給 〜 {max}円"),
            (None, None) => String::new(),
        };
    }
    if let Some(writing) = payment.get("fixed_price_writing_payment") {
        let Some(price) = json_amount(writing, "article_price") else {
            return String::new();
        };
        let mut text = format!("記事単価 {price}円");
        if let (Some(min), Some(max)) = (
            json_amount(writing, "min_articles_length"),
            json_amount(writing, "max_articles_length"),
        ) {
            text.push_str(&format!(" ({min}〜{max}文字)"));
        }
        return text;
    }
    String::new()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Amount rendered the way the payload carries it; zero, null and blank count as absent.
fn json_amount(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::Number(n) if n.as_f64().is_some_and(|v| v != 0.0) => Some(n.to_string()),
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}
