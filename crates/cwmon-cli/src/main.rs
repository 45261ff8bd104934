use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cwmon_core::filter::parse_keywords;
use cwmon_core::format::format_date;
use cwmon_core::FilterCriteria;
use cwmon_monitor::{
    event_channel, EventReceiver, MonitorConfig, MonitorEvent, MonitorPipeline, MonitorSettings,
};
use cwmon_notify::NotifyOutcome;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cwmon")]
#[command(about = "CrowdWorks new job listing monitor")]
struct Cli {
    /// Log file written alongside stderr.
    #[arg(long, global = true, default_value = "crowdworks_monitor.log")]
    log_file: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the local web UI (default).
    Serve,
    /// Fetch once, store new listings and send the notification.
    Refresh(FilterArgs),
    /// Fetch once and print matching listings without storing them.
    Search(FilterArgs),
    /// Send the test email with the saved settings.
    TestEmail,
}

/// Overrides for the criteria from the settings file.
#[derive(Debug, Args)]
struct FilterArgs {
    /// Comma-separated keywords.
    #[arg(long)]
    keywords: Option<String>,
    /// Day window; 0 means any date.
    #[arg(long)]
    days: Option<i64>,
    #[arg(long)]
    min_price: Option<u64>,
    #[arg(long)]
    max_price: Option<u64>,
}

impl FilterArgs {
    fn apply(&self, mut criteria: FilterCriteria) -> FilterCriteria {
        if let Some(keywords) = &self.keywords {
            criteria.keywords = parse_keywords(keywords);
        }
        if let Some(days) = self.days {
            criteria.days = days;
        }
        if let Some(min_price) = self.min_price {
            criteria.min_price = min_price;
        }
        if let Some(max_price) = self.max_price {
            criteria.max_price = max_price;
        }
        criteria
    }
}

fn init_tracing(log_file: &PathBuf) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_file)?;

    let config = MonitorConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Serve);
    tracing::info!(?command, store = %config.store_path.display(), "starting cwmon");
    match command {
        Commands::Serve => cwmon_web::serve(config).await?,
        Commands::Refresh(args) => {
            let settings = MonitorSettings::load(&config.settings_path).await?;
            let (tx, mut rx) = event_channel();
            let pipeline = MonitorPipeline::new(&config, tx).await?;
            let result = pipeline.refresh(&args.apply(settings.criteria), true).await;
            print_events(&mut rx);
            let summary = result?;
            println!(
                "refresh complete: run_id={} fetched={} new={} stored={} notified={}",
                summary.run_id,
                summary.fetched,
                summary.new_listings.len(),
                summary.total_stored,
                summary.notified
            );
        }
        Commands::Search(args) => {
            let settings = MonitorSettings::load(&config.settings_path).await?;
            let (tx, _rx) = event_channel();
            let pipeline = MonitorPipeline::new(&config, tx).await?;
            let criteria = args.apply(settings.criteria);
            let listings = pipeline
                .search(&criteria, &AtomicBool::new(false))
                .await?
                .unwrap_or_default();
            for listing in &listings {
                println!(
                    "{}  {}  [{}]\n    {}",
                    format_date(&listing.last_released_at),
                    listing.title,
                    listing.payment_info.display_text(),
                    listing.url
                );
            }
            println!("{} listings matched", listings.len());
        }
        Commands::TestEmail => {
            let (tx, _rx) = event_channel();
            let pipeline = MonitorPipeline::new(&config, tx).await?;
            let outcome = pipeline.notifier().lock().await.send_test().await?;
            println!("{}", outcome.summary());
            if let NotifyOutcome::SimulatedAfterFallback {
                advice: Some(advice),
                ..
            }
            | NotifyOutcome::Failed {
                advice: Some(advice),
                ..
            } = &outcome
            {
                println!("{advice}");
            }
        }
    }

    Ok(())
}

fn print_events(rx: &mut EventReceiver) {
    while let Ok(event) = rx.try_recv() {
        match event {
            MonitorEvent::Status { message, .. } | MonitorEvent::Notification { message, .. } => {
                println!("{message}")
            }
            MonitorEvent::EmailPrompt => {
                println!("メール通知は未設定です。`cwmon serve` のメール設定から設定できます")
            }
            _ => {}
        }
    }
}
