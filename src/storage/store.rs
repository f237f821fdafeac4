//! Activity events and inference results, read and written off the async
//! runtime.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{format_ts, open_pool, ActivityEvent, PersistenceSink, Pool};
use crate::inference::{ActivityResult, DetectedObject};

/// Number of processes reported by [`ActivityStore::stats`].
const TOP_PROCESSES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessCount {
    pub process_name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_events: u64,
    pub total_inferences: u64,
    /// Events since midnight UTC.
    pub events_today: u64,
    /// Most frequent focused processes over the last 7 days.
    pub top_processes: Vec<ProcessCount>,
}

#[derive(Clone)]
pub struct ActivityStore {
    pool: Pool,
}

impl ActivityStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_pool(path)?,
        })
    }

    /// Run `f` on a pooled connection inside the blocking thread pool.
    pub(super) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }

    /// Insert an event, returning its row id.
    pub async fn save_event(&self, event: &ActivityEvent) -> Result<i64> {
        let event = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO activity_events
                    (timestamp, event_type, process_id, process_name, window_title,
                     is_idle, idle_duration_secs, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    format_ts(&event.timestamp),
                    event.event_type,
                    event.process_id,
                    event.process_name,
                    event.window_title,
                    event.is_idle,
                    event.idle_duration_secs.map(|s| s as i64),
                    event.metadata,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn save_result(&self, result: &ActivityResult) -> Result<()> {
        let result = result.clone();
        let objects = serde_json::to_string(&result.detected_objects)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO inference_results
                    (request_id, processed_at, activity_label, application, content_type,
                     topic, action, summary, visible_text, confidence,
                     detected_objects_json, raw_response)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    result.request_id.to_string(),
                    format_ts(&result.processed_at),
                    result.activity_label,
                    result.application,
                    result.content_type,
                    result.topic,
                    result.action,
                    result.summary,
                    result.visible_text,
                    result.confidence,
                    objects,
                    result.raw_response,
                ],
            )?;
            debug!(request_id = %result.request_id, "saved inference result");
            Ok(())
        })
        .await
    }

    /// Events in `[from, to]`, newest first.
    pub async fn query_events(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ActivityEvent>> {
        let from = from.as_ref().map(format_ts);
        let to = to.as_ref().map(format_ts);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_type, process_id, process_name, window_title,
                        is_idle, idle_duration_secs, metadata
                 FROM activity_events
                 WHERE (?1 IS NULL OR timestamp >= ?1)
                   AND (?2 IS NULL OR timestamp <= ?2)
                 ORDER BY timestamp DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![from, to, limit as i64], event_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Most recent inference results, newest first.
    pub async fn recent_results(&self, limit: usize) -> Result<Vec<ActivityResult>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, processed_at, activity_label, application, content_type,
                        topic, action, summary, visible_text, confidence,
                        detected_objects_json, raw_response
                 FROM inference_results
                 ORDER BY processed_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], result_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let now = Utc::now();
        let midnight = format_ts(&now.date_naive().and_time(NaiveTime::MIN).and_utc());
        let week_ago = format_ts(&(now - Duration::days(7)));

        self.with_conn(move |conn| {
            let count = |sql: &str, args: &[&dyn rusqlite::ToSql]| -> rusqlite::Result<u64> {
                conn.query_row(sql, args, |row| row.get::<_, i64>(0))
                    .map(|n| n.max(0) as u64)
            };
            let total_events = count("SELECT COUNT(*) FROM activity_events", &[])?;
            let total_inferences = count("SELECT COUNT(*) FROM inference_results", &[])?;
            let events_today = count(
                "SELECT COUNT(*) FROM activity_events WHERE timestamp >= ?1",
                &[&midnight as &dyn rusqlite::ToSql],
            )?;

            let mut stmt = conn.prepare(
                "SELECT process_name, COUNT(*) AS n
                 FROM activity_events
                 WHERE process_name IS NOT NULL AND timestamp >= ?1
                 GROUP BY process_name
                 ORDER BY n DESC, process_name ASC
                 LIMIT ?2",
            )?;
            let top_processes = stmt
                .query_map(params![week_ago, TOP_PROCESSES], |row| {
                    Ok(ProcessCount {
                        process_name: row.get(0)?,
                        count: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(StoreStats {
                total_events,
                total_inferences,
                events_today,
                top_processes,
            })
        })
        .await
    }

    /// Delete events older than `max_age_days` and reclaim the space.
    /// Inference results are kept.
    pub async fn compact(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = format_ts(&(Utc::now() - Duration::days(i64::from(max_age_days))));
        let deleted = self
            .with_conn(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM activity_events WHERE timestamp < ?1",
                    params![cutoff],
                )?;
                conn.execute_batch("VACUUM")?;
                Ok(deleted)
            })
            .await?;
        info!(deleted, max_age_days, "compacted old events");
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl PersistenceSink for ActivityStore {
    // The blocking insert cannot be interrupted, so the token is not consulted.
    async fn save(&self, result: &ActivityResult, _cancel: &CancellationToken) -> Result<()> {
        self.save_result(result).await
    }
}

pub(super) fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(super) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(super) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityEvent> {
    Ok(ActivityEvent {
        id: Some(row.get(0)?),
        timestamp: ts_column(row, 1)?,
        event_type: row.get(2)?,
        process_id: row.get(3)?,
        process_name: row.get(4)?,
        window_title: row.get(5)?,
        is_idle: row.get(6)?,
        idle_duration_secs: row.get::<_, Option<i64>>(7)?.map(|s| s.max(0) as u64),
        metadata: row.get(8)?,
    })
}

pub(super) fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityResult> {
    let request_id: String = row.get(0)?;
    let objects: Option<String> = row.get(10)?;
    let detected_objects: Vec<DetectedObject> = match objects {
        Some(json) => serde_json::from_str(&json).map_err(|e| conversion_error(10, e))?,
        None => Vec::new(),
    };

    Ok(ActivityResult {
        request_id: Uuid::parse_str(&request_id).map_err(|e| conversion_error(0, e))?,
        processed_at: ts_column(row, 1)?,
        activity_label: row.get(2)?,
        application: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        content_type: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        topic: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        action: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        summary: row.get(7)?,
        visible_text: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        confidence: row.get(9)?,
        detected_objects,
        raw_response: row.get(11)?,
    })
}
