use crate::models::{CacheRecord, UsageBucket, WidgetPosition, WidgetState};
use crate::orchestrator::WidgetView;
use chrono::{DateTime, Local, Utc};

pub const WIDGET_WIDTH: u16 = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRow {
    pub title: &'static str,
    pub percentage: u32,
    pub reset_label: String,
}

impl BucketRow {
    fn from_bucket(title: &'static str, bucket: &UsageBucket) -> Self {
        Self {
            title,
            percentage: bucket.percentage,
            reset_label: bucket.reset_label.clone(),
        }
    }

    /// Bar fill in 0.0..=1.0; percentages above 100 render as a full bar.
    pub fn ratio(&self) -> f64 {
        f64::from(self.percentage.min(100)) / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Loading,
    Usage {
        rows: Vec<BucketRow>,
        last_update: String,
        stale: bool,
    },
    Info(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub widget: WidgetState,
    pub body: Body,
    pub status: String,
    pub on_usage_page: bool,
    pub fetching: bool,
    pub auto_refresh: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: true,
            widget: WidgetState::default(),
            body: Body::Loading,
            status: "ready".into(),
            on_usage_page: false,
            fetching: false,
            auto_refresh: false,
        }
    }
}

pub fn format_update_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

fn usage_body(record: &CacheRecord, stale: bool) -> Body {
    Body::Usage {
        rows: record
            .snapshot
            .buckets()
            .into_iter()
            .map(|(title, bucket)| BucketRow::from_bucket(title, bucket))
            .collect(),
        last_update: format_update_time(record.captured_at),
        stale,
    }
}

impl AppState {
    pub fn apply_view(&mut self, view: &WidgetView) {
        self.body = match view {
            WidgetView::Live(record) => usage_body(record, false),
            WidgetView::Cached { record, stale } => usage_body(record, *stale),
            WidgetView::NoData => Body::Info("No data yet. Press r to fetch.".into()),
            WidgetView::NotFound(msg) => {
                Body::Info(format!("Could not read usage data. {msg}"))
            }
            WidgetView::Error(msg) => Body::Error(msg.clone()),
        };
    }

    pub fn apply_record(&mut self, record: &CacheRecord) {
        self.body = usage_body(record, false);
    }

    /// Moves the widget, keeping its top-left corner non-negative.
    pub fn nudge(&mut self, dx: i32, dy: i32) -> WidgetPosition {
        let current = self.widget.position.unwrap_or(WidgetPosition { x: 0, y: 0 });
        let next = WidgetPosition {
            x: (current.x + dx).max(0),
            y: (current.y + dy).max(0),
        };
        self.widget.position = Some(next);
        next
    }
}
