use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Local};
use cwmon_core::filter::{self, FilterCriteria};
use cwmon_core::Listing;
use tokio::fs;
use tracing::{error, info, warn};

use crate::write_atomic;

/// Listings keyed by stringified id, persisted as one JSON array.
#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    jobs: BTreeMap<String, Listing>,
}

impl JobStore {
    /// Load the store file. A missing or empty file starts an empty store; a
    /// file that is not a JSON array is moved aside to `<file>.bak.<timestamp>`
    /// first. Individual records that do not fit [`Listing`] are skipped.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut store = Self {
            path,
            jobs: BTreeMap::new(),
        };

        let text = match fs::read_to_string(&store.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", store.path.display()))
            }
        };

        if text.trim().is_empty() {
            info!(path = %store.path.display(), "job store not found; creating an empty one");
            store.save().await?;
            return Ok(store);
        }

        match serde_json::from_str::<Vec<serde_json::Value>>(&text) {
            Ok(records) => {
                let mut skipped = 0usize;
                for (index, record) in records.into_iter().enumerate() {
                    match serde_json::from_value::<Listing>(record) {
                        Ok(listing) => {
                            store.jobs.insert(listing.key(), listing);
                        }
                        Err(err) => {
                            skipped += 1;
                            warn!(index, error = %err, "skipping unreadable stored listing");
                        }
                    }
                }
                info!(
                    count = store.jobs.len(),
                    skipped,
                    path = %store.path.display(),
                    "loaded job store"
                );
            }
            Err(err) => {
                error!(error = %err, path = %store.path.display(), "job store is corrupt");
                let backup = backup_path(&store.path);
                match fs::rename(&store.path, &backup).await {
                    Ok(()) => info!(backup = %backup.display(), "moved corrupt job store aside"),
                    Err(err) => error!(error = %err, "failed to back up corrupt job store"),
                }
                store.save().await?;
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.jobs.contains_key(&id.to_string())
    }

    pub fn all(&self) -> Vec<Listing> {
        self.jobs.values().cloned().collect()
    }

    pub fn get_by_ids(&self, ids: &[String]) -> Vec<Listing> {
        ids.iter().filter_map(|id| self.jobs.get(id).cloned()).collect()
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let listings: Vec<&Listing> = self.jobs.values().collect();
        let bytes = serde_json::to_vec_pretty(&listings).context("serializing job store")?;
        write_atomic(&self.path, &bytes).await?;
        info!(count = listings.len(), path = %self.path.display(), "saved job store");
        Ok(())
    }

    /// Upsert `fetched` (last write wins) and return the listings whose ids were
    /// absent before the merge, in input order. A failed save is logged; the
    /// in-memory state is still updated.
    pub async fn merge(&mut self, fetched: Vec<Listing>) -> Vec<Listing> {
        let mut seen = HashSet::new();
        let mut new_listings = Vec::new();
        for listing in fetched {
            let key = listing.key();
            if !self.jobs.contains_key(&key) && seen.insert(key.clone()) {
                info!(id = listing.id, title = %listing.title, "new listing");
                new_listings.push(listing.clone());
            }
            self.jobs.insert(key, listing);
        }
        if let Err(err) = self.save().await {
            error!(error = %err, "failed to persist merged listings");
        }
        new_listings
    }

    pub async fn clear(&mut self) -> anyhow::Result<()> {
        self.jobs.clear();
        self.save().await?;
        info!("cleared job store");
        Ok(())
    }

    pub fn filter_by_keywords(&self, keywords: &[String]) -> Vec<Listing> {
        self.jobs
            .values()
            .filter(|l| filter::matches_keywords(l, keywords))
            .cloned()
            .collect()
    }

    pub fn filter_by_date(&self, days: i64, now: DateTime<FixedOffset>) -> Vec<Listing> {
        self.jobs
            .values()
            .filter(|l| {
                if days > 0 && !l.last_released_at.is_empty() && l.released_at().is_none() {
                    warn!(id = l.id, raw = %l.last_released_at, "unparseable release date");
                }
                filter::is_within_days(l, days, now)
            })
            .cloned()
            .collect()
    }

    /// Full criteria query, newest first.
    pub fn filter(&self, criteria: &FilterCriteria, now: DateTime<FixedOffset>) -> Vec<Listing> {
        filter::apply(self.all(), criteria, now)
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak.{stamp}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use cwmon_core::{jst, PaymentInfo};
    use tempfile::tempdir;

    fn now() -> DateTime<FixedOffset> {
        jst().with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
    }

    fn listing(id: u64, title: &str, days_ago: i64) -> Listing {
        Listing {
            id,
            title: title.to_string(),
            url: Listing::url_for_id(id),
            description: "説明".into(),
            category_id: Some(1),
            expired_on: "2025-04-01".into(),
            last_released_at: (now() - Duration::days(days_ago)).to_rfc3339(),
            payment_info: PaymentInfo::Text("10000円".into()),
            client_name: "client".into(),
            is_employer_certification: true,
        }
    }

    #[tokio::test]
    async fn missing_file_creates_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs_data.json");
        let store = JobStore::open(&path).await.unwrap();
        assert!(store.is_empty());
        let on_disk: Vec<Listing> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(on_disk.is_empty());
    }

    #[tokio::test]
    async fn merge_reports_only_unseen_ids_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs_data.json");
        let mut store = JobStore::open(&path).await.unwrap();

        let first = store.merge(vec![listing(1, "a", 0), listing(2, "b", 0)]).await;
        assert_eq!(first.len(), 2);

        let mut updated = listing(2, "b (updated)", 0);
        updated.client_name = "other".into();
        let second = store.merge(vec![updated, listing(3, "c", 0)]).await;
        assert_eq!(second.iter().map(|l| l.id).collect::<Vec<_>>(), vec![3]);

        let reopened = JobStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 3);
        let got = reopened.get_by_ids(&["2".to_string(), "99".to_string()]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].title, "b (updated)");
    }

    #[tokio::test]
    async fn duplicate_ids_within_one_fetch_count_once() {
        let dir = tempdir().unwrap();
        let mut store = JobStore::open(dir.path().join("jobs.json")).await.unwrap();
        let new = store.merge(vec![listing(7, "x", 0), listing(7, "x2", 0)]).await;
        assert_eq!(new.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].title, "x2");
    }

    #[tokio::test]
    async fn corrupt_file_is_backed_up_and_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs_data.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JobStore::open(&path).await.unwrap();
        assert!(store.is_empty());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("jobs_data.json.bak."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
    }

    #[tokio::test]
    async fn mistyped_record_is_skipped_without_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs_data.json");
        std::fs::write(
            &path,
            r#"[
                {"id": 1, "title": "a"},
                {"id": 2, "title": "b", "category_id": "226"},
                {"id": null, "title": "c"},
                {"id": 3, "title": "d"}
            ]"#,
        )
        .unwrap();

        let store = JobStore::open(&path).await.unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains(1));
        assert!(store.contains(3));

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .count();
        assert_eq!(backups, 0);
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"226\""));
    }

    #[tokio::test]
    async fn clear_empties_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let mut store = JobStore::open(&path).await.unwrap();
        store.merge(vec![listing(1, "a", 0)]).await;
        store.clear().await.unwrap();
        assert!(JobStore::open(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queries() {
        let dir = tempdir().unwrap();
        let mut store = JobStore::open(dir.path().join("jobs.json")).await.unwrap();
        store
            .merge(vec![
                listing(1, "Python scraper", 1),
                listing(2, "Logo design", 2),
                listing(3, "Python API", 20),
            ])
            .await;

        assert_eq!(store.filter_by_keywords(&["PYTHON".into()]).len(), 2);
        assert_eq!(store.filter_by_keywords(&[]).len(), 3);
        assert_eq!(store.filter_by_date(7, now()).len(), 2);
        assert_eq!(store.filter_by_date(0, now()).len(), 3);

        let criteria = FilterCriteria {
            keywords: vec!["python".into()],
            days: 7,
            min_price: 0,
            max_price: 0,
        };
        let hits = store.filter(&criteria, now());
        assert_eq!(hits.iter().map(|l| l.id).collect::<Vec<_>>(), vec![1]);
    }
}
