use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cwmon_core::FilterCriteria;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::{MonitorEvent, MonitorPipeline, StatusLevel};

/// Criteria the UI edits and each scheduled refresh reads.
pub type SharedCriteria = Arc<RwLock<FilterCriteria>>;

/// Background periodic refresh. The first refresh of every start runs
/// immediately with `initial_run = true`.
pub struct MonitorScheduler {
    pipeline: Arc<MonitorPipeline>,
    criteria: SharedCriteria,
    interval: Duration,
    running: Mutex<Option<JobScheduler>>,
}

impl MonitorScheduler {
    pub fn new(pipeline: Arc<MonitorPipeline>, criteria: SharedCriteria, interval: Duration) -> Self {
        Self {
            pipeline,
            criteria,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Returns `false` when already running.
    pub async fn start(&self) -> Result<bool> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            self.pipeline.emit(MonitorEvent::notification(
                StatusLevel::Info,
                "定期更新はすでに実行中です",
            ));
            return Ok(false);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = self.pipeline.clone();
        let criteria = self.criteria.clone();
        let initial = Job::new_one_shot_async(Duration::ZERO, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let criteria = criteria.clone();
            Box::pin(async move {
                run_refresh(&pipeline, &criteria, true).await;
            })
        })
        .context("creating initial refresh job")?;
        sched.add(initial).await.context("adding initial refresh job")?;

        let pipeline = self.pipeline.clone();
        let criteria = self.criteria.clone();
        let periodic = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let criteria = criteria.clone();
            Box::pin(async move {
                run_refresh(&pipeline, &criteria, false).await;
            })
        })
        .with_context(|| format!("creating periodic refresh job every {:?}", self.interval))?;
        sched.add(periodic).await.context("adding periodic refresh job")?;

        sched.start().await.context("starting scheduler")?;
        *running = Some(sched);

        info!(interval = ?self.interval, "scheduler started");
        self.pipeline.emit(MonitorEvent::SchedulerState { running: true });
        self.pipeline.emit(MonitorEvent::status(
            StatusLevel::Info,
            format!("定期更新を開始しました（{}分ごと）", self.interval.as_secs() / 60),
        ));
        Ok(true)
    }

    /// Returns `false` when nothing was running.
    pub async fn stop(&self) -> Result<bool> {
        let Some(mut sched) = self.running.lock().await.take() else {
            return Ok(false);
        };
        sched.shutdown().await.context("stopping scheduler")?;
        info!("scheduler stopped");
        self.pipeline.emit(MonitorEvent::SchedulerState { running: false });
        self.pipeline
            .emit(MonitorEvent::status(StatusLevel::Info, "定期更新を停止しました"));
        Ok(true)
    }
}

async fn run_refresh(pipeline: &MonitorPipeline, criteria: &SharedCriteria, initial_run: bool) {
    let criteria = criteria.read().await.clone();
    match pipeline.refresh(&criteria, initial_run).await {
        Ok(summary) => info!(
            run_id = %summary.run_id,
            fetched = summary.fetched,
            new = summary.new_listings.len(),
            notified = summary.notified,
            "scheduled refresh finished"
        ),
        Err(err) => warn!(error = %err, "scheduled refresh failed"),
    }
}
