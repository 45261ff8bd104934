//! Core domain model for the CrowdWorks job monitor.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};

pub mod filter;
pub mod format;
pub mod price;

pub use filter::FilterCriteria;
pub use price::extract_price_from_text;

pub const CRATE_NAME: &str = "cwmon-core";

/// Public job page prefix; a listing URL is this prefix plus the listing id.
pub const LISTING_URL_BASE: &str = "https://crowdworks.jp/public/jobs";

/// Japan Standard Time, the marketplace's local clock.
pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("+09:00 is a valid offset")
}

/// One scraped job record, keyed by the provider-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category_id: Option<u64>,
    #[serde(default)]
    pub expired_on: String,
    #[serde(default)]
    pub last_released_at: String,
    #[serde(default)]
    pub payment_info: PaymentInfo,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub is_employer_certification: bool,
}

impl Listing {
    pub fn url_for_id(id: u64) -> String {
        format!("{LISTING_URL_BASE}/{id}")
    }

    /// Store key: the stringified listing id.
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn released_at(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(&self.last_released_at)
    }

    /// Best-guess yen amount, `None` when it cannot be determined.
    pub fn price(&self) -> Option<u64> {
        self.payment_info.price()
    }
}

/// Parse an ISO 8601 timestamp carrying an offset (`Z` included).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw).ok()
}

/// Payment description as stored: extractor text, or one of the structured shapes
/// older store files carry. Objects matching none of them are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PaymentInfo {
    Text(String),
    Record(PaymentRecord),
    Legacy(LegacyPayment),
    Other(serde_json::Map<String, serde_json::Value>),
}

impl Default for PaymentInfo {
    fn default() -> Self {
        PaymentInfo::Text(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentRecord {
    FixedPrice {
        #[serde(default, deserialize_with = "amount")]
        price: u64,
    },
    Hourly {
        #[serde(default, deserialize_with = "amount")]
        min_price: u64,
        #[serde(default, deserialize_with = "amount")]
        max_price: u64,
    },
    WritingPayment {
        #[serde(default, deserialize_with = "amount")]
        price: u64,
        #[serde(default)]
        unit: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LegacyPayment {
    #[serde(default, deserialize_with = "optional_amount")]
    pub min_price: Option<u64>,
    #[serde(default, deserialize_with = "optional_amount")]
    pub max_price: Option<u64>,
    #[serde(default)]
    pub payment_type: Option<String>,
}

/// Yen amount as it appears in stored records: integer, float (`50000.0`) or
/// numeric string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Int(u64),
    Float(f64),
    Text(String),
}

impl RawAmount {
    fn to_yen(&self) -> Option<u64> {
        let value = match self {
            RawAmount::Int(v) => return Some(*v),
            RawAmount::Float(v) => *v,
            RawAmount::Text(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        };
        (value.is_finite() && value >= 0.0).then(|| value.trunc() as u64)
    }
}

fn optional_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(Option::<RawAmount>::deserialize(deserializer)?.and_then(|raw| raw.to_yen()))
}

fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(optional_amount(deserializer)?.unwrap_or(0))
}

impl PaymentInfo {
    pub fn price(&self) -> Option<u64> {
        match self {
            PaymentInfo::Text(text) => extract_price_from_text(text),
            PaymentInfo::Record(PaymentRecord::FixedPrice { price }) => Some(*price),
            PaymentInfo::Record(PaymentRecord::Hourly { min_price, .. }) => Some(*min_price),
            PaymentInfo::Record(PaymentRecord::WritingPayment { price, .. }) => Some(*price),
            PaymentInfo::Legacy(legacy) => legacy.price(),
            PaymentInfo::Other(_) => None,
        }
    }

    pub fn display_text(&self) -> String {
        format::payment_text(self)
    }
}

impl LegacyPayment {
    fn price(&self) -> Option<u64> {
        if let Some(min) = self.min_price.filter(|v| *v > 0) {
            return Some(min);
        }
        if let Some(max) = self.max_price.filter(|v| *v > 0) {
            return Some(max);
        }
        let payment_type = self.payment_type.as_deref()?;
        if payment_type.contains("単価") {
            return price::first_integer(payment_type);
        }
        None
    }
}
