//! Axum + Askama UI for the job monitor: search tab, email settings tab, and a
//! one-second htmx poll that drains background events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use cwmon_core::filter::parse_keywords;
use cwmon_core::format::format_date;
use cwmon_core::{FilterCriteria, Listing};
use cwmon_monitor::{
    event_channel, EventReceiver, MonitorConfig, MonitorEvent, MonitorPipeline, MonitorScheduler,
    MonitorSettings, SharedCriteria, StatusLevel,
};
use cwmon_notify::{NotifyOutcome, APP_PASSWORD_INSTRUCTIONS};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

pub const CRATE_NAME: &str = "cwmon-web";

const APP_CSS: &str = include_str!("../assets/app.css");

const DAY_OPTIONS: [(i64, &str); 6] = [
    (1, "1日以内"),
    (3, "3日以内"),
    (7, "1週間以内"),
    (14, "2週間以内"),
    (30, "1ヶ月以内"),
    (0, "すべて"),
];

pub struct AppState {
    pipeline: Arc<MonitorPipeline>,
    scheduler: Arc<MonitorScheduler>,
    criteria: SharedCriteria,
    popular_keywords: Vec<String>,
    cancel: Arc<AtomicBool>,
    events: Mutex<EventReceiver>,
    ui: Mutex<UiState>,
}

#[derive(Debug)]
struct UiState {
    status: String,
    status_level: StatusLevel,
    toasts: Vec<Toast>,
    cards: Vec<ListingCard>,
    cards_dirty: bool,
    scheduler_running: bool,
    email_prompted: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            status: "準備完了".to_string(),
            status_level: StatusLevel::Info,
            toasts: Vec::new(),
            cards: Vec::new(),
            cards_dirty: false,
            scheduler_running: false,
            email_prompted: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Toast {
    class: &'static str,
    message: String,
    settings_link: bool,
}

#[derive(Debug, Clone)]
struct ListingCard {
    title: String,
    url: String,
    released: String,
    payment: String,
    client: String,
    certified: bool,
    expires: String,
}

impl From<&Listing> for ListingCard {
    fn from(listing: &Listing) -> Self {
        Self {
            title: if listing.title.is_empty() {
                "タイトルなし".to_string()
            } else {
                listing.title.clone()
            },
            url: listing.url.clone(),
            released: format_date(&listing.last_released_at),
            payment: listing.payment_info.display_text(),
            client: if listing.client_name.is_empty() {
                "不明".to_string()
            } else {
                listing.client_name.clone()
            },
            certified: listing.is_employer_certification,
            expires: if listing.expired_on.is_empty() {
                "なし".to_string()
            } else {
                listing.expired_on.clone()
            },
        }
    }
}

fn cards_for(listings: &[Listing]) -> Vec<ListingCard> {
    listings.iter().map(ListingCard::from).collect()
}

fn level_class(level: StatusLevel) -> &'static str {
    match level {
        StatusLevel::Info => "info",
        StatusLevel::Progress => "progress",
        StatusLevel::Success => "success",
        StatusLevel::Warning => "warning",
        StatusLevel::Error => "error",
    }
}

impl AppState {
    pub fn new(
        pipeline: Arc<MonitorPipeline>,
        scheduler: Arc<MonitorScheduler>,
        criteria: SharedCriteria,
        settings: &MonitorSettings,
        events: EventReceiver,
    ) -> Self {
        Self {
            pipeline,
            scheduler,
            criteria,
            popular_keywords: settings.popular_keywords.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            events: Mutex::new(events),
            ui: Mutex::new(UiState::default()),
        }
    }

    /// Apply every pending background event to the UI state.
    async fn drain_events(&self) {
        let mut events = self.events.lock().await;
        let mut ui = self.ui.lock().await;
        let mut reload = false;
        while let Ok(event) = events.try_recv() {
            match event {
                MonitorEvent::Status { level, message } => {
                    ui.status = message;
                    ui.status_level = level;
                }
                MonitorEvent::Notification { level, message } => ui.toasts.push(Toast {
                    class: level_class(level),
                    message,
                    settings_link: false,
                }),
                MonitorEvent::SearchResults { listings } => {
                    ui.cards = cards_for(&listings);
                    ui.cards_dirty = true;
                }
                MonitorEvent::StoreUpdated { .. } => reload = true,
                MonitorEvent::SchedulerState { running } => ui.scheduler_running = running,
                MonitorEvent::EmailPrompt => push_email_prompt(&mut ui),
            }
        }
        if reload {
            let criteria = self.criteria.read().await.clone();
            let listings = self.pipeline.stored(&criteria).await;
            ui.cards = cards_for(&listings);
            ui.cards_dirty = true;
        }
    }

    async fn prompt_email_if_unconfigured(&self) {
        if !self.pipeline.notifier().lock().await.is_configured() {
            push_email_prompt(&mut *self.ui.lock().await);
        }
    }
}

fn push_email_prompt(ui: &mut UiState) {
    if ui.email_prompted {
        return;
    }
    ui.email_prompted = true;
    ui.toasts.push(Toast {
        class: "info",
        message: "新着案件が見つかった時にメールで通知を受け取りませんか？".to_string(),
        settings_link: true,
    });
}

#[derive(Debug, Clone)]
struct DayOption {
    value: i64,
    label: &'static str,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    keywords: String,
    days: Vec<DayOption>,
    min_price: u64,
    max_price: u64,
    popular_keywords: Vec<String>,
    interval_minutes: u64,
    status: StatusView,
    cards: Vec<ListingCard>,
}

#[derive(Template)]
#[template(path = "listings_partial.html")]
struct ListingsPartialTemplate {
    cards: Vec<ListingCard>,
}

#[derive(Debug, Clone)]
struct StatusView {
    message: String,
    class: &'static str,
    scheduler_running: bool,
    toasts: Vec<Toast>,
}

#[derive(Template)]
#[template(path = "status_partial.html")]
struct StatusPartialTemplate {
    status: StatusView,
    refresh_cards: bool,
    cards: Vec<ListingCard>,
}

#[derive(Template)]
#[template(path = "settings.html")]
struct SettingsTemplate {
    enabled: bool,
    gmail_address: String,
    has_password: bool,
    simulation_mode: bool,
    auto_fallback: bool,
    last_sent: String,
}

#[derive(Template)]
#[template(path = "settings_message_partial.html")]
struct SettingsMessageTemplate {
    class: &'static str,
    lines: Vec<String>,
}

impl SettingsMessageTemplate {
    fn new(class: &'static str, lines: Vec<String>) -> Self {
        Self { class, lines }
    }

    fn from_outcome(outcome: &NotifyOutcome) -> Self {
        let class = match outcome {
            NotifyOutcome::Sent { .. } | NotifyOutcome::Simulated { .. } => "success",
            NotifyOutcome::SimulatedAfterFallback { .. } => "warning",
            NotifyOutcome::Failed { .. } => "error",
        };
        let mut lines = vec![outcome.summary()];
        match outcome {
            NotifyOutcome::SimulatedAfterFallback { error, advice, .. }
            | NotifyOutcome::Failed { error, advice } => {
                if matches!(outcome, NotifyOutcome::SimulatedAfterFallback { .. }) {
                    lines.push(format!("エラー: {error}"));
                }
                if let Some(advice) = advice {
                    lines.extend(advice.lines().map(str::to_string));
                }
            }
            _ => {}
        }
        Self { class, lines }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchForm {
    #[serde(default)]
    keywords: String,
    #[serde(default)]
    days: String,
    #[serde(default)]
    min_price: String,
    #[serde(default)]
    max_price: String,
}

impl SearchForm {
    /// Unparseable numbers become 0.
    fn criteria(&self) -> FilterCriteria {
        FilterCriteria {
            keywords: parse_keywords(&self.keywords),
            days: self.days.trim().parse().unwrap_or(0),
            min_price: self.min_price.trim().parse().unwrap_or(0),
            max_price: self.max_price.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct EmailForm {
    enabled: Option<String>,
    #[serde(default)]
    gmail_address: String,
    #[serde(default)]
    gmail_app_password: String,
}

#[derive(Debug, Deserialize, Default)]
struct ToggleForm {
    enabled: Option<String>,
}

pub fn app(state: AppState) -> Router {
    app_with_state(Arc::new(state))
}

pub fn app_with_state(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/listings", get(listings_handler))
        .route("/search", post(search_handler))
        .route("/search/cancel", post(search_cancel_handler))
        .route("/refresh", post(refresh_handler))
        .route("/scheduler/start", post(scheduler_start_handler))
        .route("/scheduler/stop", post(scheduler_stop_handler))
        .route("/status", get(status_handler))
        .route("/settings/email", get(settings_handler).post(settings_save_handler))
        .route("/settings/email/test", post(settings_test_handler))
        .route("/settings/email/simulation", post(settings_simulation_handler))
        .route("/settings/email/fallback", post(settings_fallback_handler))
        .route("/settings/email/instructions", get(instructions_handler))
        .route("/assets/app.css", get(app_css_handler))
        .with_state(state)
}

/// Build the pipeline, scheduler and router from `config` and serve on localhost.
pub async fn serve(config: MonitorConfig) -> anyhow::Result<()> {
    let settings = MonitorSettings::load(&config.settings_path).await?;
    let (tx, rx) = event_channel();
    let pipeline = Arc::new(MonitorPipeline::new(&config, tx).await?);
    let criteria: SharedCriteria = Arc::new(RwLock::new(settings.criteria.clone()));
    let scheduler = Arc::new(MonitorScheduler::new(
        pipeline.clone(),
        criteria.clone(),
        config.refresh_interval(),
    ));
    let state = AppState::new(pipeline, scheduler.clone(), criteria, &settings, rx);

    let listener = TcpListener::bind(("127.0.0.1", config.web_port)).await?;
    info!(addr = %listener.local_addr()?, "serving job monitor UI");
    let result = axum::serve(listener, app(state)).await;
    if let Err(err) = scheduler.stop().await {
        error!(error = %err, "failed to stop scheduler");
    }
    result?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let criteria = state.criteria.read().await.clone();
    let listings = state.pipeline.stored(&criteria).await;
    state.drain_events().await;
    let status = {
        let mut ui = state.ui.lock().await;
        ui.cards = cards_for(&listings);
        ui.cards_dirty = false;
        status_view(&mut ui)
    };
    render_html(IndexTemplate {
        keywords: criteria.keywords.join(", "),
        days: DAY_OPTIONS
            .iter()
            .map(|&(value, label)| DayOption {
                value,
                label,
                selected: value == criteria.days,
            })
            .collect(),
        min_price: criteria.min_price,
        max_price: criteria.max_price,
        popular_keywords: state.popular_keywords.clone(),
        interval_minutes: state.scheduler.interval().as_secs() / 60,
        status,
        cards: cards_for(&listings),
    })
}

/// Stored listings under the current criteria.
async fn listings_handler(State(state): State<Arc<AppState>>) -> Response {
    let criteria = state.criteria.read().await.clone();
    let cards = cards_for(&state.pipeline.stored(&criteria).await);
    {
        let mut ui = state.ui.lock().await;
        ui.cards = cards.clone();
        ui.cards_dirty = false;
    }
    render_html(ListingsPartialTemplate { cards })
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SearchForm>,
) -> Response {
    let criteria = form.criteria();
    info!(
        keywords = ?criteria.keywords,
        days = criteria.days,
        min_price = criteria.min_price,
        max_price = criteria.max_price,
        "search requested"
    );
    *state.criteria.write().await = criteria.clone();
    state.cancel.store(false, Ordering::SeqCst);

    let pipeline = state.pipeline.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = pipeline.search(&criteria, &cancel).await {
            error!(error = %err, "search failed");
        }
    });
    set_status(&state, StatusLevel::Progress, "案件を検索中...").await;
    status_response(&state).await
}

async fn search_cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    state.cancel.store(true, Ordering::SeqCst);
    set_status(&state, StatusLevel::Warning, "検索をキャンセルしています...").await;
    status_response(&state).await
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SearchForm>,
) -> Response {
    let criteria = form.criteria();
    *state.criteria.write().await = criteria.clone();
    state.prompt_email_if_unconfigured().await;

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(err) = pipeline.refresh(&criteria, false).await {
            error!(error = %err, "refresh failed");
        }
    });
    set_status(&state, StatusLevel::Progress, "案件情報を取得中...").await;
    status_response(&state).await
}

async fn scheduler_start_handler(State(state): State<Arc<AppState>>) -> Response {
    state.prompt_email_if_unconfigured().await;
    if let Err(err) = state.scheduler.start().await {
        error!(error = %err, "failed to start scheduler");
        set_status(&state, StatusLevel::Error, format!("定期更新を開始できませんでした: {err}")).await;
    }
    status_response(&state).await
}

async fn scheduler_stop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.stop().await {
        Ok(true) => {}
        Ok(false) => set_status(&state, StatusLevel::Info, "定期更新は実行されていません").await,
        Err(err) => {
            error!(error = %err, "failed to stop scheduler");
            set_status(&state, StatusLevel::Error, format!("定期更新を停止できませんでした: {err}"))
                .await;
        }
    }
    status_response(&state).await
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    status_response(&state).await
}

async fn settings_handler(State(state): State<Arc<AppState>>) -> Response {
    let notifier = state.pipeline.notifier().lock().await;
    let config = notifier.config();
    render_html(SettingsTemplate {
        enabled: config.enabled,
        gmail_address: config.gmail_address.clone(),
        has_password: !config.gmail_app_password.is_empty(),
        simulation_mode: config.simulation_mode,
        auto_fallback: config.auto_fallback,
        last_sent: config
            .last_sent
            .as_deref()
            .map(format_date)
            .unwrap_or_else(|| "なし".to_string()),
    })
}

async fn settings_save_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<EmailForm>,
) -> Response {
    let mut notifier = state.pipeline.notifier().lock().await;
    if form.enabled.is_none() {
        return match notifier.set_enabled(false).await {
            Ok(()) => render_html(SettingsMessageTemplate::new(
                "info",
                vec!["メール通知を無効にしました".to_string()],
            )),
            Err(err) => settings_error(err),
        };
    }

    // A blank password field keeps the stored one.
    let password = if form.gmail_app_password.is_empty() {
        notifier.config().gmail_app_password.clone()
    } else {
        form.gmail_app_password.clone()
    };
    match notifier.save_credentials(&form.gmail_address, &password).await {
        Ok(warnings) => {
            let mut lines = vec!["メール設定を保存しました".to_string()];
            if notifier.config().simulation_mode {
                lines.push("シミュレーションモードが有効です。実際のメールは送信されません".to_string());
            }
            lines.extend(warnings.iter().map(ToString::to_string));
            let class = if warnings.is_empty() { "success" } else { "warning" };
            render_html(SettingsMessageTemplate::new(class, lines))
        }
        Err(err) => settings_error(err),
    }
}

async fn settings_test_handler(State(state): State<Arc<AppState>>) -> Response {
    let pending = match state.pipeline.notifier().lock().await.prepare_test() {
        Ok(pending) => pending,
        Err(err) => return settings_error(err),
    };
    let delivery = pending.deliver().await;
    let outcome = state.pipeline.notifier().lock().await.record(delivery).await;
    render_html(SettingsMessageTemplate::from_outcome(&outcome))
}

async fn settings_simulation_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ToggleForm>,
) -> Response {
    let on = form.enabled.is_some();
    let mut notifier = state.pipeline.notifier().lock().await;
    match notifier.set_simulation_mode(on).await {
        Ok(()) => render_html(SettingsMessageTemplate::new(
            "info",
            vec![if on {
                "シミュレーションモードを有効にしました".to_string()
            } else {
                "シミュレーションモードを無効にしました".to_string()
            }],
        )),
        Err(err) => settings_error(err),
    }
}

async fn settings_fallback_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ToggleForm>,
) -> Response {
    let on = form.enabled.is_some();
    let mut notifier = state.pipeline.notifier().lock().await;
    match notifier.set_auto_fallback(on).await {
        Ok(()) => render_html(SettingsMessageTemplate::new(
            "info",
            vec![if on {
                "送信エラー時の自動シミュレーション切替を有効にしました".to_string()
            } else {
                "送信エラー時の自動シミュレーション切替を無効にしました".to_string()
            }],
        )),
        Err(err) => settings_error(err),
    }
}

async fn instructions_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        APP_PASSWORD_INSTRUCTIONS,
    )
        .into_response()
}

async fn app_css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

async fn set_status(state: &AppState, level: StatusLevel, message: impl Into<String>) {
    let mut ui = state.ui.lock().await;
    ui.status = message.into();
    ui.status_level = level;
}

fn status_view(ui: &mut UiState) -> StatusView {
    StatusView {
        message: ui.status.clone(),
        class: level_class(ui.status_level),
        scheduler_running: ui.scheduler_running,
        toasts: std::mem::take(&mut ui.toasts),
    }
}

async fn status_response(state: &AppState) -> Response {
    state.drain_events().await;
    let mut ui = state.ui.lock().await;
    let refresh_cards = std::mem::take(&mut ui.cards_dirty);
    let cards = if refresh_cards { ui.cards.clone() } else { Vec::new() };
    let status = status_view(&mut ui);
    drop(ui);
    render_html(StatusPartialTemplate {
        status,
        refresh_cards,
        cards,
    })
}

fn settings_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "email settings operation failed");
    render_html(SettingsMessageTemplate::new("error", vec![err.to_string()]))
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
