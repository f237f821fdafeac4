//! Activity report: how the tracked time between the first and last event of
//! a date range splits across applications, windows and idle periods, plus
//! the inference results recorded in the same range.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::inference::ActivityResult;
use crate::storage::ActivityEvent;

pub const SCHEMA_VERSION: &str = "2.0";

/// Longest visible-text excerpt kept per insight.
const VISIBLE_TEXT_CHARS: usize = 200;

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Serialize)]
pub struct ActivityReport {
    pub schema_version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub range_start: DateTime<Utc>,
    /// Last instant covered by the range.
    pub range_end: DateTime<Utc>,
    /// First event in the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in: Option<DateTime<Utc>>,
    /// Last event in the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out: Option<DateTime<Utc>>,
    pub total_tracked_secs: u64,
    pub total_active_secs: u64,
    pub total_idle_secs: u64,
    pub focus_events_analyzed: usize,
    pub applications: Vec<ApplicationUsage>,
    pub detailed_activities: Vec<ActivityInsight>,
    pub content_type_breakdown: Vec<ContentTypeSummary>,
    pub segments: Vec<TimelineSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationUsage {
    pub process_name: String,
    pub total_active_secs: u64,
    /// Longest first.
    pub windows: Vec<WindowUsage>,
    /// Positions in `detailed_activities` whose application matches this
    /// process.
    pub insight_indices: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub title: String,
    pub active_secs: u64,
}

/// Time from one event until the next, attributed to the earlier event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSegment {
    pub end: DateTime<Utc>,
    pub duration_secs: u64,
    pub is_idle: bool,
    pub process_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityInsight {
    pub timestamp: DateTime<Utc>,
    pub activity_label: String,
    pub application: String,
    pub content_type: String,
    pub topic: String,
    pub action: String,
    pub summary: String,
    pub visible_text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentTypeSummary {
    pub content_type: String,
    pub activity_count: usize,
    pub distinct_topics: Vec<String>,
    pub distinct_applications: Vec<String>,
}

impl ActivityReport {
    /// Build a report for `[start, end)` from events and results in that
    /// range, both oldest first.
    pub fn build(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        events: &[ActivityEvent],
        results: &[ActivityResult],
        generated_at: DateTime<Utc>,
    ) -> Self {
        let check_in = events.first().map(|e| e.timestamp);
        let check_out = events.last().map(|e| e.timestamp);
        let total_tracked_secs = match (check_in, check_out) {
            (Some(a), Some(b)) => whole_secs(b - a),
            _ => 0,
        };

        let mut segments = Vec::new();
        let mut usage = UsageBuilder::default();
        let mut total_active_secs = 0;
        for pair in events.windows(2) {
            let (event, next) = (&pair[0], &pair[1]);
            let secs = whole_secs(next.timestamp - event.timestamp);
            if secs == 0 {
                continue;
            }

            let process = non_blank(event.process_name.as_deref()).unwrap_or(UNKNOWN);
            let window = non_blank(event.window_title.as_deref());
            segments.push(TimelineSegment {
                end: next.timestamp,
                duration_secs: secs,
                is_idle: event.is_idle,
                process_name: if event.is_idle { "Idle".into() } else { process.into() },
                window_title: if event.is_idle { None } else { window.map(String::from) },
            });

            if !event.is_idle {
                usage.add(process, window.unwrap_or(UNKNOWN), secs);
                total_active_secs += secs;
            }
        }
        // Whatever part of the tracked window was not active counts as idle.
        let total_idle_secs = total_tracked_secs.saturating_sub(total_active_secs);

        let detailed_activities: Vec<ActivityInsight> = results.iter().map(ActivityInsight::from).collect();
        let content_type_breakdown = content_breakdown(&detailed_activities);
        let applications = usage.finish(&detailed_activities);

        Self {
            schema_version: SCHEMA_VERSION,
            generated_at,
            range_start: start,
            range_end: end - Duration::milliseconds(1),
            check_in,
            check_out,
            total_tracked_secs,
            total_active_secs,
            total_idle_secs,
            focus_events_analyzed: events.len(),
            applications,
            detailed_activities,
            content_type_breakdown,
            segments,
        }
    }
}

impl From<&ActivityResult> for ActivityInsight {
    fn from(r: &ActivityResult) -> Self {
        Self {
            timestamp: r.processed_at,
            activity_label: r.activity_label.clone(),
            application: non_blank(Some(r.application.as_str())).unwrap_or(UNKNOWN).to_string(),
            content_type: non_blank(Some(r.content_type.as_str())).unwrap_or(UNKNOWN).to_string(),
            topic: r.topic.clone(),
            action: r.action.clone(),
            summary: r.summary.clone(),
            visible_text: truncate(&r.visible_text, VISIBLE_TEXT_CHARS),
            confidence: r.confidence,
        }
    }
}

/// Per-process and per-window active time. Names compare case-insensitively;
/// the first spelling seen is the one reported.
#[derive(Default)]
struct UsageBuilder {
    apps: Vec<AppEntry>,
    index: HashMap<String, usize>,
}

struct AppEntry {
    name: String,
    secs: u64,
    windows: Vec<WindowUsage>,
    window_index: HashMap<String, usize>,
}

impl UsageBuilder {
    fn add(&mut self, process: &str, window: &str, secs: u64) {
        let next = self.apps.len();
        let slot = *self.index.entry(process.to_lowercase()).or_insert(next);
        if slot == next {
            self.apps.push(AppEntry {
                name: process.to_string(),
                secs: 0,
                windows: Vec::new(),
                window_index: HashMap::new(),
            });
        }

        let app = &mut self.apps[slot];
        app.secs += secs;
        let next = app.windows.len();
        let w = *app.window_index.entry(window.to_lowercase()).or_insert(next);
        if w == next {
            app.windows.push(WindowUsage {
                title: window.to_string(),
                active_secs: 0,
            });
        }
        app.windows[w].active_secs += secs;
    }

    fn finish(self, insights: &[ActivityInsight]) -> Vec<ApplicationUsage> {
        let mut apps: Vec<ApplicationUsage> = self
            .apps
            .into_iter()
            .map(|mut app| {
                app.windows.sort_by(|a, b| b.active_secs.cmp(&a.active_secs));
                ApplicationUsage {
                    insight_indices: matching_insights(&app.name, insights),
                    process_name: app.name,
                    total_active_secs: app.secs,
                    windows: app.windows,
                }
            })
            .collect();
        apps.sort_by(|a, b| b.total_active_secs.cmp(&a.total_active_secs));
        apps
    }
}

fn content_breakdown(insights: &[ActivityInsight]) -> Vec<ContentTypeSummary> {
    let mut order: Vec<ContentTypeSummary> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for insight in insights {
        let next = order.len();
        let slot = *index.entry(insight.content_type.to_lowercase()).or_insert(next);
        if slot == next {
            order.push(ContentTypeSummary {
                content_type: insight.content_type.clone(),
                activity_count: 0,
                distinct_topics: Vec::new(),
                distinct_applications: Vec::new(),
            });
        }
        let summary = &mut order[slot];
        summary.activity_count += 1;
        push_distinct(&mut summary.distinct_topics, &insight.topic);
        push_distinct(&mut summary.distinct_applications, &insight.application);
    }

    for summary in &mut order {
        summary.distinct_topics.sort();
        summary.distinct_applications.sort();
    }
    order.sort_by(|a, b| b.activity_count.cmp(&a.activity_count));
    order
}

fn push_distinct(list: &mut Vec<String>, value: &str) {
    if value.trim().is_empty() || list.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        return;
    }
    list.push(value.to_string());
}

/// Indices of insights whose application names the same program as
/// `process`: equal, or one contains the other, after normalization.
fn matching_insights(process: &str, insights: &[ActivityInsight]) -> Vec<usize> {
    let process = normalize_key(process);
    if process.is_empty() {
        return Vec::new();
    }
    insights
        .iter()
        .enumerate()
        .filter(|(_, insight)| {
            let app = normalize_key(&insight.application);
            !app.is_empty() && (app.contains(&process) || process.contains(&app))
        })
        .map(|(i, _)| i)
        .collect()
}

/// Lowercased letters and digits only.
fn normalize_key(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

fn whole_secs(d: Duration) -> u64 {
    d.num_seconds().max(0) as u64
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// `mm:ss`, `hh:mm:ss` from an hour, `Nd hh:mm:ss` from a day.
pub fn format_duration(secs: u64) -> String {
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (h, m, s) = (rem / 3600, rem % 3600 / 60, rem % 60);
    if days > 0 {
        format!("{days}d {h:02}:{m:02}:{s:02}")
    } else if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 22, h, m, s).unwrap()
    }

    fn day() -> (DateTime<Utc>, DateTime<Utc>) {
        (t(0, 0, 0), t(0, 0, 0) + Duration::days(1))
    }

    fn focus(at: DateTime<Utc>, process: &str, window: &str) -> ActivityEvent {
        ActivityEvent {
            timestamp: at,
            process_name: Some(process.into()),
            window_title: Some(window.into()),
            ..ActivityEvent::new("focus_change")
        }
    }

    fn idle(at: DateTime<Utc>) -> ActivityEvent {
        ActivityEvent {
            timestamp: at,
            is_idle: true,
            idle_duration_secs: Some(300),
            ..ActivityEvent::new("idle")
        }
    }

    fn insight(at: DateTime<Utc>, application: &str, content_type: &str, topic: &str) -> ActivityResult {
        ActivityResult {
            request_id: Uuid::new_v4(),
            processed_at: at,
            activity_label: "Working".into(),
            application: application.into(),
            content_type: content_type.into(),
            topic: topic.into(),
            action: "editing".into(),
            summary: "summary".into(),
            visible_text: "x".repeat(250),
            confidence: 0.8,
            detected_objects: Vec::new(),
            raw_response: None,
        }
    }

    #[test]
    fn test_empty_range() {
        let (start, end) = day();
        let report = ActivityReport::build(start, end, &[], &[], t(12, 0, 0));

        assert_eq!(report.check_in, None);
        assert_eq!(report.check_out, None);
        assert_eq!(report.total_tracked_secs, 0);
        assert_eq!(report.total_idle_secs, 0);
        assert!(report.segments.is_empty());
        assert_eq!(report.range_end, end - Duration::milliseconds(1));

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("check_in").is_none());
        assert_eq!(json["schema_version"], "2.0");
    }

    #[test]
    fn test_time_split_between_apps_windows_and_idle() {
        let (start, end) = day();
        let events = vec![
            focus(t(9, 0, 0), "code", "engine.rs"),
            focus(t(9, 20, 0), "firefox", "docs.rs"),
            focus(t(9, 30, 0), "Code", "queue.rs"),
            idle(t(9, 40, 0)),
            focus(t(10, 0, 0), "code", "engine.rs"),
            focus(t(10, 5, 0), "code", "ENGINE.rs"),
        ];
        let report = ActivityReport::build(start, end, &events, &[], t(12, 0, 0));

        assert_eq!(report.check_in, Some(t(9, 0, 0)));
        assert_eq!(report.check_out, Some(t(10, 5, 0)));
        assert_eq!(report.total_tracked_secs, 65 * 60);
        assert_eq!(report.total_active_secs, 45 * 60);
        assert_eq!(report.total_idle_secs, 20 * 60);
        assert_eq!(report.focus_events_analyzed, 6);

        assert_eq!(report.applications.len(), 2);
        let code = &report.applications[0];
        assert_eq!(code.process_name, "code");
        assert_eq!(code.total_active_secs, 35 * 60);
        assert_eq!(
            code.windows,
            vec![
                WindowUsage {
                    title: "engine.rs".into(),
                    active_secs: 25 * 60
                },
                WindowUsage {
                    title: "queue.rs".into(),
                    active_secs: 10 * 60
                },
            ]
        );
        assert_eq!(report.applications[1].process_name, "firefox");

        assert_eq!(report.segments.len(), 5);
        let idle_segment = &report.segments[3];
        assert!(idle_segment.is_idle);
        assert_eq!(idle_segment.process_name, "Idle");
        assert_eq!(idle_segment.window_title, None);
        assert_eq!(idle_segment.duration_secs, 20 * 60);
    }

    #[test]
    fn test_insights_breakdown_and_matching() {
        let (start, end) = day();
        let events = vec![
            focus(t(9, 0, 0), "firefox-bin", "docs"),
            focus(t(9, 10, 0), "code", "main.rs"),
            focus(t(9, 20, 0), "code", "main.rs"),
        ];
        let results = vec![
            insight(t(9, 1, 0), "Firefox", "web", "tokio"),
            insight(t(9, 11, 0), "VS Code", "code", "report"),
            insight(t(9, 12, 0), "", "", ""),
            insight(t(9, 13, 0), "firefox", "WEB", "Tokio"),
        ];
        let report = ActivityReport::build(start, end, &events, &results, t(12, 0, 0));

        assert_eq!(report.detailed_activities.len(), 4);
        assert_eq!(report.detailed_activities[2].application, "Unknown");
        assert_eq!(report.detailed_activities[2].content_type, "Unknown");
        assert_eq!(report.detailed_activities[0].visible_text.chars().count(), 200);
        assert!(report.detailed_activities[0].visible_text.ends_with("..."));

        let web = &report.content_type_breakdown[0];
        assert_eq!(web.content_type, "web");
        assert_eq!(web.activity_count, 2);
        assert_eq!(web.distinct_topics, vec!["tokio".to_string()]);
        assert_eq!(web.distinct_applications, vec!["Firefox".to_string()]);

        let firefox = report
            .applications
            .iter()
            .find(|a| a.process_name == "firefox-bin")
            .unwrap();
        assert_eq!(firefox.insight_indices, vec![0, 3]);
        let code = report.applications.iter().find(|a| a.process_name == "code").unwrap();
        assert_eq!(code.insight_indices, vec![1]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(754), "12:34");
        assert_eq!(format_duration(3_725), "01:02:05");
        assert_eq!(format_duration(90_061), "1d 01:01:01");
    }
}
