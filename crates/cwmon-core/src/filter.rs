//! Keyword / date-window / price filters over listings.

use std::cmp::Reverse;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Listing;

/// Session filter state. Zero prices mean "unbounded", `days <= 0` means "any date".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_days")]
    pub days: i64,
    #[serde(default)]
    pub min_price: u64,
    #[serde(default)]
    pub max_price: u64,
}

fn default_days() -> i64 {
    7
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            days: default_days(),
            min_price: 0,
            max_price: 0,
        }
    }
}

impl FilterCriteria {
    pub fn has_price_bounds(&self) -> bool {
        self.min_price > 0 || self.max_price > 0
    }

    pub fn matches(&self, listing: &Listing, now: DateTime<FixedOffset>) -> bool {
        is_within_days(listing, self.days, now)
            && matches_keywords(listing, &self.keywords)
            && price_in_range(listing, self.min_price, self.max_price)
    }
}

/// Split a comma-separated keyword field (ASCII or full-width commas).
pub fn parse_keywords(raw: &str) -> Vec<String> {
    raw.split([',', '、', '，'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn matches_keywords(listing: &Listing, keywords: &[String]) -> bool {
    let mut keywords = keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()).peekable();
    if keywords.peek().is_none() {
        return true;
    }
    let title = listing.title.to_lowercase();
    let description = listing.description.to_lowercase();
    keywords.any(|keyword| {
        let keyword = keyword.to_lowercase();
        title.contains(&keyword) || description.contains(&keyword)
    })
}

pub fn is_within_days(listing: &Listing, days: i64, now: DateTime<FixedOffset>) -> bool {
    if days <= 0 {
        return true;
    }
    match listing.released_at() {
        Some(released) => (now - released).num_days() < days,
        None => false,
    }
}

pub fn price_in_range(listing: &Listing, min_price: u64, max_price: u64) -> bool {
    if min_price == 0 && max_price == 0 {
        return true;
    }
    let Some(price) = listing.price() else {
        return false;
    };
    if min_price > 0 && price < min_price {
        return false;
    }
    if max_price > 0 && price > max_price {
        return false;
    }
    true
}

/// Newest first; listings without a parseable release date sink to the end.
pub fn sort_newest_first(listings: &mut [Listing]) {
    listings.sort_by_key(|l| Reverse(l.released_at()));
}

/// Date window, then keywords, then price; result sorted newest first.
pub fn apply(listings: Vec<Listing>, criteria: &FilterCriteria, now: DateTime<FixedOffset>) -> Vec<Listing> {
    let total = listings.len();
    let dated: Vec<Listing> = listings
        .into_iter()
        .filter(|l| is_within_days(l, criteria.days, now))
        .collect();
    let after_date = dated.len();
    let keyworded: Vec<Listing> = dated
        .into_iter()
        .filter(|l| matches_keywords(l, &criteria.keywords))
        .collect();
    let after_keywords = keyworded.len();
    let mut priced: Vec<Listing> = keyworded
        .into_iter()
        .filter(|l| price_in_range(l, criteria.min_price, criteria.max_price))
        .collect();
    info!(
        total,
        after_date,
        after_keywords,
        after_price = priced.len(),
        days = criteria.days,
        keywords = ?criteria.keywords,
        "filtered listings"
    );
    sort_newest_first(&mut priced);
    priced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{jst, PaymentInfo};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<FixedOffset> {
        jst().with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn listing(id: u64, title: &str, days_ago: i64, payment: &str) -> Listing {
        Listing {
            id,
            title: title.to_string(),
            url: Listing::url_for_id(id),
            description: format!("{title} の詳細"),
            category_id: None,
            expired_on: String::new(),
            last_released_at: (now() - Duration::days(days_ago)).to_rfc3339(),
            payment_info: PaymentInfo::Text(payment.to_string()),
            client_name: "client".into(),
            is_employer_certification: false,
        }
    }

    #[test]
    fn keywords_are_case_insensitive_and_any_match() {
        let l = listing(1, "Python scraping tool", 0, "");
        assert!(matches_keywords(&l, &["python".into()]));
        assert!(matches_keywords(&l, &["rust".into(), "SCRAPING".into()]));
        assert!(!matches_keywords(&l, &["rust".into()]));
        assert!(matches_keywords(&l, &[]));
        assert!(matches_keywords(&l, &["  ".into()]));
    }

    #[test]
    fn keyword_field_parsing() {
        assert_eq!(parse_keywords("Python, AI,,データ分析 "), vec!["Python", "AI", "データ分析"]);
        assert_eq!(parse_keywords("機械学習、Webスクレイピング"), vec!["機械学習", "Webスクレイピング"]);
        assert!(parse_keywords("").is_empty());
    }

    #[test]
    fn date_window_is_exclusive_and_requires_a_date() {
        assert!(is_within_days(&listing(1, "a", 2, ""), 3, now()));
        assert!(!is_within_days(&listing(1, "a", 3, ""), 3, now()));
        let mut undated = listing(2, "b", 0, "");
        undated.last_released_at.clear();
        assert!(!is_within_days(&undated, 7, now()));
        assert!(is_within_days(&undated, 0, now()));
    }

    #[test]
    fn price_bounds() {
        let l = listing(1, "a", 0, "10000円 〜 20000円");
        assert!(price_in_range(&l, 0, 0));
        assert!(price_in_range(&l, 10_000, 0));
        assert!(!price_in_range(&l, 10_001, 0));
        assert!(price_in_range(&l, 0, 10_000));
        assert!(!price_in_range(&l, 0, 9_999));
        let unknown = listing(2, "b", 0, "応相談");
        assert!(price_in_range(&unknown, 0, 0));
        assert!(!price_in_range(&unknown, 1, 0));
    }

    #[test]
    fn apply_filters_and_sorts_newest_first() {
        let listings = vec![
            listing(1, "Python 開発", 5, "50000円"),
            listing(2, "Python 保守", 1, "5万円"),
            listing(3, "デザイン", 0, "30000円"),
            listing(4, "Python 古い案件", 30, "80000円"),
            listing(5, "Python 安い", 0, "500円"),
        ];
        let criteria = FilterCriteria {
            keywords: vec!["python".into()],
            days: 7,
            min_price: 10_000,
            max_price: 0,
        };
        let ids: Vec<u64> = apply(listings, &criteria, now()).iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn undated_listings_sort_last() {
        let mut undated = listing(9, "x", 0, "");
        undated.last_released_at = "bad".into();
        let mut all = vec![undated, listing(1, "old", 10, ""), listing(2, "new", 1, "")];
        sort_newest_first(&mut all);
        let ids: Vec<u64> = all.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![2, 1, 9]);
    }
}
