//! Read-side aggregations over stored activity: daily summaries, the
//! event timeline and the inputs of the activity report.
//!
//! Day boundaries are UTC midnights, matching [`ActivityStore::stats`].

use anyhow::Result;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use super::store::{conversion_error, event_from_row, result_from_row, ts_column};
use super::{format_ts, ActivityEvent, ActivityStore};
use crate::inference::ActivityResult;
use crate::report::ActivityReport;

/// Applications listed in a [`DailySummary`].
const TOP_APPLICATIONS: i64 = 10;

/// Largest gap between an event and an inference result for the two to be
/// shown together on the timeline.
const TIMELINE_MATCH_SECS: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentTypeCount {
    pub content_type: String,
    pub count: u64,
    /// Distinct non-empty topics, sorted.
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationCount {
    pub application: String,
    pub count: u64,
}

/// Inference results bucketed into broad activity kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivityDistribution {
    pub total: u64,
    pub coding: u64,
    pub web_browsing: u64,
    pub documents: u64,
    pub videos: u64,
    pub communication: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub by_content_type: Vec<ContentTypeCount>,
    pub top_applications: Vec<ApplicationCount>,
    pub distribution: ActivityDistribution,
}

/// What the vision model said about the screen around a timeline event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineInsight {
    pub activity_label: String,
    pub application: Option<String>,
    pub content_type: Option<String>,
    pub topic: Option<String>,
    pub action: Option<String>,
    pub summary: String,
    pub visible_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub process_name: Option<String>,
    pub window_title: Option<String>,
    pub is_idle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insight: Option<TimelineInsight>,
}

/// Midnight UTC at the start of `date`.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// `[start of from, start of the day after to)`. Reversed dates are swapped.
pub fn day_range(from: NaiveDate, to: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let (from, to) = if to < from { (to, from) } else { (from, to) };
    let end = to.checked_add_days(Days::new(1)).unwrap_or(to);
    (day_start(from), day_start(end))
}

fn limit_param(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as unbounded.
    limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

impl ActivityStore {
    /// Events in `[from, to)`, oldest first.
    pub async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>> {
        let (from, to) = (format_ts(&from), format_ts(&to));
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_type, process_id, process_name, window_title,
                        is_idle, idle_duration_secs, metadata
                 FROM activity_events
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![from, to], event_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Inference results in `[from, to)`, newest first, at most `limit`.
    pub async fn results_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityResult>> {
        let (from, to) = (format_ts(&from), format_ts(&to));
        let limit = limit_param(limit);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, processed_at, activity_label, application, content_type,
                        topic, action, summary, visible_text, confidence,
                        detected_objects_json, raw_response
                 FROM inference_results
                 WHERE processed_at >= ?1 AND processed_at < ?2
                 ORDER BY processed_at DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![from, to, limit], result_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Inference results of one UTC day grouped by content type and
    /// application.
    pub async fn daily_summary(&self, date: NaiveDate) -> Result<DailySummary> {
        let (from, to) = day_range(date, date);
        let (from, to) = (format_ts(&from), format_ts(&to));

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT COALESCE(NULLIF(content_type, ''), 'Unknown') AS category,
                        COUNT(*) AS n,
                        json_group_array(DISTINCT topic)
                            FILTER (WHERE topic IS NOT NULL AND topic <> '')
                 FROM inference_results
                 WHERE processed_at >= ?1 AND processed_at < ?2
                 GROUP BY category
                 ORDER BY n DESC, category ASC",
            )?;
            let by_content_type = stmt
                .query_map(params![from, to], |row| {
                    let topics: String = row.get(2)?;
                    let mut topics: Vec<String> =
                        serde_json::from_str(&topics).map_err(|e| conversion_error(2, e))?;
                    topics.sort();
                    Ok(ContentTypeCount {
                        content_type: row.get(0)?,
                        count: count_column(row, 1)?,
                        topics,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT COALESCE(NULLIF(application, ''), 'Unknown') AS app, COUNT(*) AS n
                 FROM inference_results
                 WHERE processed_at >= ?1 AND processed_at < ?2
                 GROUP BY app
                 ORDER BY n DESC, app ASC
                 LIMIT ?3",
            )?;
            let top_applications = stmt
                .query_map(params![from, to, TOP_APPLICATIONS], |row| {
                    Ok(ApplicationCount {
                        application: row.get(0)?,
                        count: count_column(row, 1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let distribution = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(content_type = 'code'), 0),
                        COALESCE(SUM(content_type LIKE '%web%' OR content_type = 'article'), 0),
                        COALESCE(SUM(content_type = 'document'), 0),
                        COALESCE(SUM(content_type = 'video'), 0),
                        COALESCE(SUM(content_type IN ('email', 'chat')), 0)
                 FROM inference_results
                 WHERE processed_at >= ?1 AND processed_at < ?2",
                params![from, to],
                |row| {
                    Ok(ActivityDistribution {
                        total: count_column(row, 0)?,
                        coding: count_column(row, 1)?,
                        web_browsing: count_column(row, 2)?,
                        documents: count_column(row, 3)?,
                        videos: count_column(row, 4)?,
                        communication: count_column(row, 5)?,
                    })
                },
            )?;

            Ok(DailySummary {
                date,
                by_content_type,
                top_applications,
                distribution,
            })
        })
        .await
    }

    /// The latest `limit` events in `[from, to]`, oldest first, each paired
    /// with the inference result closest to it within a minute.
    pub async fn timeline(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineEntry>> {
        let (from, to) = (format_ts(&from), format_ts(&to));
        let limit = limit_param(Some(limit));
        let mut entries = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT ae.timestamp, ae.event_type, ae.process_name, ae.window_title, ae.is_idle,
                            ir.activity_label, ir.application, ir.content_type, ir.topic,
                            ir.action, ir.summary, ir.visible_text
                     FROM activity_events ae
                     LEFT JOIN inference_results ir ON ir.id = (
                         SELECT r.id FROM inference_results r
                         WHERE ABS(julianday(r.processed_at) - julianday(ae.timestamp)) * 86400.0 < ?4
                         ORDER BY ABS(julianday(r.processed_at) - julianday(ae.timestamp))
                         LIMIT 1
                     )
                     WHERE ae.timestamp >= ?1 AND ae.timestamp <= ?2
                     ORDER BY ae.timestamp DESC, ae.id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![from, to, limit, TIMELINE_MATCH_SECS],
                    timeline_from_row,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        entries.reverse();
        Ok(entries)
    }

    /// Build the activity report for the UTC days `from..=to`.
    pub async fn activity_report(&self, from: NaiveDate, to: NaiveDate) -> Result<ActivityReport> {
        let (start, end) = day_range(from, to);
        let events = self.events_between(start, end).await?;
        let mut results = self.results_between(start, end, None).await?;
        results.reverse();
        Ok(ActivityReport::build(start, end, &events, &results, Utc::now()))
    }
}

fn count_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
}

fn timeline_from_row(row: &Row<'_>) -> rusqlite::Result<TimelineEntry> {
    let label: Option<String> = row.get(5)?;
    let insight = match label {
        Some(activity_label) => Some(TimelineInsight {
            activity_label,
            application: row.get(6)?,
            content_type: row.get(7)?,
            topic: row.get(8)?,
            action: row.get(9)?,
            summary: row.get(10)?,
            visible_text: row.get(11)?,
        }),
        None => None,
    };

    Ok(TimelineEntry {
        timestamp: ts_column(row, 0)?,
        event_type: row.get(1)?,
        process_name: row.get(2)?,
        window_title: row.get(3)?,
        is_idle: row.get(4)?,
        insight,
    })
}
