//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;
pub mod store;
pub mod summary;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::inference::ActivityResult;

pub use self::store::{ActivityStore, ProcessCount, StoreStats};
pub use self::summary::{
    ActivityDistribution, ApplicationCount, ContentTypeCount, DailySummary, TimelineEntry,
    TimelineInsight,
};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create database directory {}", dir.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Where the request processor hands finished results.
///
/// Errors are logged by the caller and never change the request's
/// completed/failed classification. The caller awaits `save` to completion
/// even after `cancel` fires, so a write that has started should finish.
#[async_trait::async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save(&self, result: &ActivityResult, cancel: &CancellationToken) -> Result<()>;
}

/// A sampled desktop activity event (focus change, idle period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    #[serde(default)]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub process_id: Option<u32>,
    pub process_name: Option<String>,
    pub window_title: Option<String>,
    pub is_idle: bool,
    pub idle_duration_secs: Option<u64>,
    pub metadata: Option<String>,
}

impl ActivityEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            process_id: None,
            process_name: None,
            window_title: None,
            is_idle: false,
            idle_duration_secs: None,
            metadata: None,
        }
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so that string order
/// matches time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
