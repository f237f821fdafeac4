use std::path::{Path, PathBuf};

use activitymonitor::config::{LoggingConfig, MonitorConfig};
use activitymonitor::inference::OllamaClient;
use activitymonitor::report::{format_duration, ActivityReport};
use activitymonitor::storage::summary::{day_range, day_start};
use activitymonitor::storage::ActivityStore;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "activitymonitor",
    about = "Desktop activity monitor with vision-model activity summaries",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (monitor + dispatcher + API server)
    Serve {
        /// Override the API bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// List recorded activity events
    Query {
        /// Start time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        from: Option<DateTime<Utc>>,

        /// End time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        to: Option<DateTime<Utc>>,

        /// Maximum number of events
        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show the most recent inference results
    Results {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Events in order, with the model's reading of the screen next to each
    Timeline {
        /// Start time (RFC 3339 or YYYY-MM-DD), default start of today
        #[arg(long, value_parser = parse_time)]
        from: Option<DateTime<Utc>>,

        /// End time (RFC 3339 or YYYY-MM-DD), default now
        #[arg(long, value_parser = parse_time)]
        to: Option<DateTime<Utc>>,

        /// Show at most the latest N events
        #[arg(long, default_value_t = 500)]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Full inference results for a range of days
    Detailed {
        /// First day (YYYY-MM-DD), default today
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,

        /// Last day, inclusive (YYYY-MM-DD), default today
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Daily breakdown by content type and application
    Summary {
        /// Day to summarize (YYYY-MM-DD), default today
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Write an activity report (check-in/out, active and idle time) to disk
    #[command(alias = "export")]
    Report {
        /// First day (YYYY-MM-DD), default today
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,

        /// Last day, inclusive (YYYY-MM-DD), default same as --from
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,

        /// Output file, default activity-report-<dates>-<time>.json
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
        format: ReportFormat,
    },

    /// Summarize stored activity
    Stats {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Delete old activity events and vacuum the database
    Compact {
        /// Override storage.max_event_age_days
        #[arg(long)]
        max_age_days: Option<u32>,
    },

    /// Check that the inference backend is reachable and has the model
    CheckBackend,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReportFormat {
    Json,
}

impl ReportFormat {
    fn extension(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| format!("expected YYYY-MM-DD, got '{s}'"))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| format!("expected RFC 3339 or YYYY-MM-DD, got '{s}'"))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}

fn default_report_path(from: NaiveDate, to: NaiveDate, format: ReportFormat) -> PathBuf {
    let mut name = format!("activity-report-{}", from.format("%Y%m%d"));
    if to != from {
        name.push_str(&format!("-{}", to.format("%Y%m%d")));
    }
    name.push_str(&format!("-{}.{}", Utc::now().format("%H%M%S"), format.extension()));
    PathBuf::from(name)
}

fn write_report(report: &ActivityReport, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write report {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = MonitorConfig::load_or_default(cli.config.as_deref())?;
    init_tracing(&loaded.config.logging);
    loaded.log();
    let mut config = loaded.config;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "starting activity monitor daemon");
            activitymonitor::serve(config).await?;
        }
        Commands::Query {
            from,
            to,
            limit,
            json,
        } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let events = store.query_events(from, to, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No events found.");
            } else {
                println!("{:<24} | {:<12} | {:<16} | Window", "Time", "Event", "Process");
                println!("{:-<24}-|-{:-<12}-|-{:-<16}-|-{:-<40}", "", "", "", "");
                for e in events {
                    let window = match (e.is_idle, e.idle_duration_secs) {
                        (true, Some(secs)) => format!("idle {}s", secs),
                        _ => e.window_title.unwrap_or_default(),
                    };
                    println!(
                        "{:<24} | {:<12} | {:<16} | {}",
                        e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        e.event_type,
                        truncate(e.process_name.as_deref().unwrap_or("-"), 16),
                        truncate(&window, 60)
                    );
                }
            }
        }
        Commands::Results { limit, json } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let results = store.recent_results(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No inference results found.");
            } else {
                for r in results {
                    println!(
                        "{}  {} ({:.0}%)  [{} / {} / {}]",
                        r.processed_at.format("%Y-%m-%d %H:%M:%S"),
                        r.activity_label,
                        r.confidence * 100.0,
                        r.application,
                        r.content_type,
                        r.action
                    );
                    println!("    {}", truncate(&r.summary, 120));
                }
            }
        }
        Commands::Timeline {
            from,
            to,
            limit,
            json,
        } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let from = from.unwrap_or_else(|| day_start(Utc::now().date_naive()));
            let to = to.unwrap_or_else(Utc::now);
            let entries = store.timeline(from, to, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No activity between {} and {}.", from.format("%Y-%m-%d %H:%M"), to.format("%Y-%m-%d %H:%M"));
            } else {
                println!("=== Activity Timeline: {} to {} ===\n", from.format("%Y-%m-%d"), to.format("%Y-%m-%d"));
                for e in &entries {
                    let time = e.timestamp.format("%H:%M:%S");
                    match &e.insight {
                        _ if e.is_idle => println!("{time}  * IDLE"),
                        Some(i) => {
                            println!("{time}  * {}", i.activity_label);
                            let details = [
                                ("App", i.application.as_deref(), 100),
                                ("Topic", i.topic.as_deref(), 100),
                                ("Action", i.action.as_deref(), 100),
                                ("Summary", Some(i.summary.as_str()), 100),
                                ("Text", i.visible_text.as_deref(), 80),
                            ];
                            for (name, value, max) in details {
                                if let Some(v) = value.filter(|v| !v.is_empty()) {
                                    println!("          {name}: {}", truncate(v, max));
                                }
                            }
                        }
                        None => println!(
                            "{time}  * {}  {}",
                            e.process_name.as_deref().unwrap_or("Unknown"),
                            truncate(e.window_title.as_deref().unwrap_or(""), 50)
                        ),
                    }
                }
                println!("\nTotal activities: {}", entries.len());
            }
        }
        Commands::Detailed {
            from,
            to,
            limit,
            json,
        } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let today = Utc::now().date_naive();
            let (start, end) = day_range(from.unwrap_or(today), to.unwrap_or(today));
            let results = store.results_between(start, end, Some(limit)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No detailed activity data found for this period.");
            } else {
                for r in &results {
                    println!("--- {} ---", r.processed_at.format("%Y-%m-%d %H:%M:%S"));
                    println!("{}", r.activity_label);
                    println!("  Application:  {}", r.application);
                    println!("  Content type: {}", r.content_type);
                    println!("  Topic:        {}", r.topic);
                    println!("  Action:       {}", r.action);
                    println!("  Summary:      {}", r.summary);
                    println!("  Visible text: {}", r.visible_text);
                    println!("  Confidence:   {:.0}%\n", r.confidence * 100.0);
                }
                println!("Showing {} detailed activities", results.len());
            }
        }
        Commands::Summary { date, json } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let summary = store.daily_summary(date).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\n=== Daily Summary: {} ===", summary.date);
                println!("\nActivity by content type:");
                if summary.by_content_type.is_empty() {
                    println!("  (none)");
                }
                for c in &summary.by_content_type {
                    println!("  {:<16} {:>5}  {}", c.content_type, c.count, truncate(&c.topics.join(", "), 60));
                }
                println!("\nTop applications:");
                if summary.top_applications.is_empty() {
                    println!("  (none)");
                }
                for a in &summary.top_applications {
                    println!("  {:<24} {}", truncate(&a.application, 24), a.count);
                }
                let d = &summary.distribution;
                if d.total > 0 {
                    println!("\nActivity distribution ({} inferences):", d.total);
                    for (name, n) in [
                        ("Coding", d.coding),
                        ("Web browsing", d.web_browsing),
                        ("Documents", d.documents),
                        ("Videos", d.videos),
                        ("Communication", d.communication),
                    ] {
                        let bar = "#".repeat((n * 40 / d.total) as usize);
                        println!("  {:<14} {:>5}  {}", name, n, bar);
                    }
                }
                println!();
            }
        }
        Commands::Report {
            from,
            to,
            output,
            format,
        } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let from = from.unwrap_or_else(|| Utc::now().date_naive());
            let to = to.unwrap_or(from);
            let (from, to) = if to < from { (to, from) } else { (from, to) };
            let path = output.unwrap_or_else(|| default_report_path(from, to, format));

            let report = store.activity_report(from, to).await?;
            write_report(&report, &path)?;

            println!("Report exported to {}", path.display());
            match (report.check_in, report.check_out) {
                (Some(check_in), Some(check_out)) => println!(
                    "Check-in: {}  Check-out: {}",
                    check_in.format("%H:%M:%S"),
                    check_out.format("%H:%M:%S")
                ),
                _ => println!("No activity events found in the specified date range."),
            }
            println!(
                "Tracked time: {} (Active: {}, Idle: {})",
                format_duration(report.total_tracked_secs),
                format_duration(report.total_active_secs),
                format_duration(report.total_idle_secs)
            );
        }
        Commands::Stats { json } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let stats = store.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("\n=== Activity Statistics ===");
                println!("Total events:     {}", stats.total_events);
                println!("Total inferences: {}", stats.total_inferences);
                println!("Events today:     {}", stats.events_today);
                println!("\nTop processes (last 7 days):");
                if stats.top_processes.is_empty() {
                    println!("  (none)");
                }
                for p in stats.top_processes {
                    println!("  {:<24} {}", p.process_name, p.count);
                }
                println!();
            }
        }
        Commands::Compact { max_age_days } => {
            let store = ActivityStore::open(&config.storage.database_path)?;
            let days = max_age_days.unwrap_or(config.storage.max_event_age_days);
            let deleted = store.compact(days).await?;
            println!("Deleted {} events older than {} days.", deleted, days);
        }
        Commands::CheckBackend => {
            let client = OllamaClient::new(&config.inference)?;
            match client.health_check().await {
                Ok(true) => println!(
                    "Backend {} is up and has model '{}'.",
                    config.inference.endpoint,
                    client.model()
                ),
                Ok(false) => {
                    println!(
                        "Backend {} is up but model '{}' is not installed.",
                        config.inference.endpoint,
                        client.model()
                    );
                    std::process::exit(1);
                }
                Err(e) => {
                    println!("Backend {} is unreachable: {}", config.inference.endpoint, e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
