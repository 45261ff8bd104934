//! Monitor orchestration: fetch, extract, store, notify, and the periodic refresh.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use cwmon_adapters::{
    adapter_for_source, AdapterContext, AdapterError, ListingSource, CROWDWORKS_SOURCE_ID,
};
use cwmon_core::{filter, jst, FilterCriteria, Listing, LISTING_URL_BASE};
use cwmon_notify::{Notifier, NotifyOutcome, SmtpMailTransport};
use cwmon_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JobStore, PageArchive, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod scheduler;

pub use scheduler::{MonitorScheduler, SharedCriteria};

pub const CRATE_NAME: &str = "cwmon-monitor";

pub const DEFAULT_POPULAR_KEYWORDS: [&str; 5] =
    ["Python", "データ分析", "AI", "機械学習", "Webスクレイピング"];

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub listing_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub store_path: PathBuf,
    pub email_config_path: PathBuf,
    pub settings_path: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub refresh_interval_secs: u64,
    pub web_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            listing_url: LISTING_URL_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            http_max_retries: 0,
            store_path: PathBuf::from("jobs_data.json"),
            email_config_path: PathBuf::from("email_config.json"),
            settings_path: PathBuf::from("monitor.yaml"),
            artifacts_dir: None,
            refresh_interval_secs: 3600,
            web_port: 8000,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listing_url: std::env::var("CWMON_LISTING_URL").unwrap_or(defaults.listing_url),
            user_agent: std::env::var("CWMON_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("CWMON_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            http_max_retries: env_parse("CWMON_HTTP_MAX_RETRIES")
                .unwrap_or(defaults.http_max_retries),
            store_path: std::env::var("CWMON_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            email_config_path: std::env::var("CWMON_EMAIL_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.email_config_path),
            settings_path: std::env::var("CWMON_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.settings_path),
            artifacts_dir: std::env::var("CWMON_ARTIFACTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            refresh_interval_secs: env_parse("CWMON_REFRESH_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.refresh_interval_secs),
            web_port: env_parse("CWMON_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Optional `monitor.yaml`: starting filter criteria and the keyword chips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub criteria: FilterCriteria,
    pub popular_keywords: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            criteria: FilterCriteria::default(),
            popular_keywords: DEFAULT_POPULAR_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl MonitorSettings {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file; using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Progress,
    Success,
    Warning,
    Error,
}

/// UI-bound updates produced by background work, drained by the UI on its tick.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Status { level: StatusLevel, message: String },
    Notification { level: StatusLevel, message: String },
    SearchResults { listings: Vec<Listing> },
    StoreUpdated { new_count: usize, total: usize },
    SchedulerState { running: bool },
    /// Email is not configured; suggest setting it up.
    EmailPrompt,
}

impl MonitorEvent {
    pub fn status(level: StatusLevel, message: impl Into<String>) -> Self {
        MonitorEvent::Status {
            level,
            message: message.into(),
        }
    }

    pub fn notification(level: StatusLevel, message: impl Into<String>) -> Self {
        MonitorEvent::Notification {
            level,
            message: message.into(),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<MonitorEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MonitorEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub new_listings: Vec<Listing>,
    pub total_stored: usize,
    /// New listings that passed the criteria and went into the notification.
    pub notified: usize,
    pub notify_outcome: Option<NotifyOutcome>,
}

pub fn now_jst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&jst())
}

pub struct MonitorPipeline {
    source: Arc<dyn ListingSource>,
    http: HttpFetcher,
    archive: Option<PageArchive>,
    store: Mutex<JobStore>,
    notifier: Mutex<Notifier>,
    events: EventSender,
}

impl MonitorPipeline {
    pub async fn new(config: &MonitorConfig, events: EventSender) -> Result<Self> {
        let source: Arc<dyn ListingSource> =
            adapter_for_source(CROWDWORKS_SOURCE_ID, &config.listing_url)
                .with_context(|| format!("no adapter registered for {CROWDWORKS_SOURCE_ID}"))?
                .into();
        let http = HttpFetcher::new(config.http_client_config())?;
        let store = JobStore::open(&config.store_path).await?;
        let notifier = Notifier::load(
            &config.email_config_path,
            Arc::new(SmtpMailTransport::default()),
        )
        .await?;
        let archive = config.artifacts_dir.clone().map(PageArchive::new);
        Ok(Self::from_parts(source, http, store, notifier, archive, events))
    }

    pub fn from_parts(
        source: Arc<dyn ListingSource>,
        http: HttpFetcher,
        store: JobStore,
        notifier: Notifier,
        archive: Option<PageArchive>,
        events: EventSender,
    ) -> Self {
        Self {
            source,
            http,
            archive,
            store: Mutex::new(store),
            notifier: Mutex::new(notifier),
            events,
        }
    }

    pub fn store(&self) -> &Mutex<JobStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Mutex<Notifier> {
        &self.notifier
    }

    pub fn emit(&self, event: MonitorEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    /// Fetch the listing page and extract it, without touching the store.
    /// `Ok(None)` means `cancel` was raised between steps.
    pub async fn search(
        &self,
        criteria: &FilterCriteria,
        cancel: &AtomicBool,
    ) -> Result<Option<Vec<Listing>>, AdapterError> {
        let ctx = AdapterContext::now();
        let span = info_span!("search", run_id = %ctx.run_id);
        async {
            self.emit(MonitorEvent::status(StatusLevel::Progress, "案件を検索中..."));
            if self.cancelled(cancel) {
                return Ok(None);
            }

            let fetched = match self.fetch_listings(&ctx).await {
                Ok(listings) => listings,
                Err(err) => {
                    self.report_fetch_error(&err);
                    return Err(err);
                }
            };
            if self.cancelled(cancel) {
                return Ok(None);
            }

            let matched = filter::apply(fetched, criteria, now_jst());
            if self.cancelled(cancel) {
                return Ok(None);
            }

            if matched.is_empty() {
                self.emit(MonitorEvent::status(
                    StatusLevel::Warning,
                    "検索条件に合致する案件は見つかりませんでした",
                ));
            } else {
                self.emit(MonitorEvent::status(
                    StatusLevel::Success,
                    format!("{}件の案件が見つかりました", matched.len()),
                ));
            }
            self.emit(MonitorEvent::SearchResults {
                listings: matched.clone(),
            });
            Ok(Some(matched))
        }
        .instrument(span)
        .await
    }

    /// Fetch, merge into the store, and mail the new listings that match
    /// `criteria`. `initial_run` marks the first refresh of a scheduler start.
    pub async fn refresh(
        &self,
        criteria: &FilterCriteria,
        initial_run: bool,
    ) -> Result<RefreshSummary, AdapterError> {
        let ctx = AdapterContext::now();
        let span = info_span!("refresh", run_id = %ctx.run_id, initial_run);
        self.refresh_inner(ctx, criteria, initial_run)
            .instrument(span)
            .await
    }

    async fn refresh_inner(
        &self,
        ctx: AdapterContext,
        criteria: &FilterCriteria,
        initial_run: bool,
    ) -> Result<RefreshSummary, AdapterError> {
        let started_at = Utc::now();
        self.emit(MonitorEvent::status(StatusLevel::Progress, "案件情報を取得中..."));

        let fetched = match self.fetch_listings(&ctx).await {
            Ok(listings) => listings,
            Err(err) => {
                self.report_fetch_error(&err);
                return Err(err);
            }
        };
        let fetched_count = fetched.len();
        info!(fetched = fetched_count, "fetched listings");

        self.emit(MonitorEvent::status(StatusLevel::Progress, "データを保存中..."));
        let (new_listings, total_stored) = {
            let mut store = self.store.lock().await;
            let new_listings = store.merge(fetched).await;
            (new_listings, store.len())
        };
        self.emit(MonitorEvent::StoreUpdated {
            new_count: new_listings.len(),
            total: total_stored,
        });

        if new_listings.is_empty() {
            self.emit(MonitorEvent::status(
                StatusLevel::Info,
                "新しい案件はありませんでした",
            ));
        } else {
            self.emit(MonitorEvent::status(
                StatusLevel::Success,
                format!("{}件の新しい案件が見つかりました", new_listings.len()),
            ));
        }

        let (notified, notify_outcome) =
            self.notify_new(&new_listings, criteria, initial_run).await;

        Ok(RefreshSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            fetched: fetched_count,
            new_listings,
            total_stored,
            notified,
            notify_outcome,
        })
    }

    async fn notify_new(
        &self,
        new_listings: &[Listing],
        criteria: &FilterCriteria,
        initial_run: bool,
    ) -> (usize, Option<NotifyOutcome>) {
        let pending = {
            let notifier = self.notifier.lock().await;
            if !notifier.is_configured() {
                if initial_run {
                    self.emit(MonitorEvent::EmailPrompt);
                }
                return (0, None);
            }
            if new_listings.is_empty() {
                return (0, None);
            }

            let matched = filter::apply(new_listings.to_vec(), criteria, now_jst());
            if matched.is_empty() {
                info!("no new listings match the notification criteria");
                return (0, None);
            }
            notifier
                .prepare_new_listings(&matched)
                .map(|pending| (matched.len(), pending))
        };

        // The notifier stays unlocked for the SMTP exchange.
        let sent = match pending {
            Ok((count, pending)) => {
                let delivery = pending.deliver().await;
                Ok((count, self.notifier.lock().await.record(delivery).await))
            }
            Err(err) => Err(err),
        };

        match sent {
            Ok((count, outcome)) => {
                let level = match &outcome {
                    NotifyOutcome::Sent { .. } | NotifyOutcome::Simulated { .. } => {
                        StatusLevel::Success
                    }
                    NotifyOutcome::SimulatedAfterFallback { .. } => StatusLevel::Warning,
                    NotifyOutcome::Failed { .. } => StatusLevel::Error,
                };
                self.emit(MonitorEvent::notification(level, outcome.summary()));
                if let NotifyOutcome::SimulatedAfterFallback {
                    advice: Some(advice),
                    ..
                }
                | NotifyOutcome::Failed {
                    advice: Some(advice),
                    ..
                } = &outcome
                {
                    self.emit(MonitorEvent::notification(StatusLevel::Error, advice.clone()));
                }
                (count, Some(outcome))
            }
            Err(err) => {
                error!(error = %err, "email notification failed");
                self.emit(MonitorEvent::notification(
                    StatusLevel::Error,
                    format!("メール通知処理でエラーが発生しました: {err}"),
                ));
                (0, None)
            }
        }
    }

    /// Stored listings filtered by `criteria`, newest first.
    pub async fn stored(&self, criteria: &FilterCriteria) -> Vec<Listing> {
        self.store.lock().await.filter(criteria, now_jst())
    }

    async fn fetch_listings(&self, ctx: &AdapterContext) -> Result<Vec<Listing>, AdapterError> {
        let page = self.source.fetch_listing(&self.http, ctx).await?;
        if let Some(archive) = &self.archive {
            match archive
                .store_page(page.fetched_at, self.source.source_id(), page.body.as_bytes())
                .await
            {
                Ok(archived) => debug!(
                    path = %archived.absolute_path.display(),
                    deduplicated = archived.deduplicated,
                    "archived listing page"
                ),
                Err(err) => warn!(error = %err, "failed to archive listing page"),
            }
        }
        self.source.parse_listing(&page)
    }

    fn cancelled(&self, cancel: &AtomicBool) -> bool {
        if cancel.load(Ordering::SeqCst) {
            info!("search cancelled");
            self.emit(MonitorEvent::status(StatusLevel::Warning, "検索をキャンセルしました"));
            true
        } else {
            false
        }
    }

    fn report_fetch_error(&self, err: &AdapterError) {
        error!(error = %err, "failed to fetch listings");
        self.emit(MonitorEvent::status(
            StatusLevel::Error,
            format!("案件の取得に失敗しました: {err}"),
        ));
    }
}
