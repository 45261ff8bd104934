use std::path::{Path, PathBuf};

use chrono::Utc;
use cwmon_adapters::{CrowdworksAdapter, FetchedPage, ListingSource};
use cwmon_core::{Listing, LISTING_URL_BASE};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/crowdworks")
}

fn fixture_page() -> FetchedPage {
    let body = std::fs::read_to_string(fixture_dir().join("listing.html")).expect("read fixture");
    FetchedPage {
        url: LISTING_URL_BASE.to_string(),
        body,
        fetched_at: Utc::now(),
    }
}

#[test]
fn crowdworks_listing_page_matches_snapshot() {
    let parsed = CrowdworksAdapter::default()
        .parse_listing(&fixture_page())
        .expect("parse fixture");

    let text = std::fs::read_to_string(fixture_dir().join("snapshot.json")).expect("read snapshot");
    let expected: Vec<Listing> = serde_json::from_str(&text).expect("parse snapshot");

    assert_eq!(parsed, expected);
}

#[test]
fn fixture_listings_feed_the_price_normalizer() {
    let parsed = CrowdworksAdapter::default()
        .parse_listing(&fixture_page())
        .expect("parse fixture");
    let prices: Vec<Option<u64>> = parsed.iter().map(Listing::price).collect();
    assert_eq!(prices, vec![Some(30_000), Some(1_500), Some(3_000), Some(20_000)]);
}
