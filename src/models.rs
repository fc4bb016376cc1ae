use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const UNKNOWN_RESET: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub percentage: u32,
    #[serde(rename = "reset")]
    pub reset_label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session: Option<UsageBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_models: Option<UsageBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opus_only: Option<UsageBucket>,
}

impl UsageSnapshot {
    pub fn is_empty(&self) -> bool {
        self.current_session.is_none() && self.all_models.is_none() && self.opus_only.is_none()
    }

    /// Present buckets in display order, paired with their titles.
    pub fn buckets(&self) -> Vec<(&'static str, &UsageBucket)> {
        [
            ("Current Session", self.current_session.as_ref()),
            ("All Models", self.all_models.as_ref()),
            ("Opus Only", self.opus_only.as_ref()),
        ]
        .into_iter()
        .filter_map(|(title, bucket)| bucket.map(|b| (title, b)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub snapshot: UsageSnapshot,
    pub captured_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.captured_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) >= threshold
    }

    pub fn captured_at_millis(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetPosition {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetState {
    pub visible: bool,
    pub collapsed: bool,
    pub position: Option<WidgetPosition>,
    pub has_shown_initial_fetch: bool,
}

impl Default for WidgetState {
    fn default() -> Self {
        Self {
            visible: true,
            collapsed: false,
            position: None,
            has_shown_initial_fetch: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bucket(percentage: u32) -> UsageBucket {
        UsageBucket {
            percentage,
            reset_label: UNKNOWN_RESET.into(),
        }
    }

    #[test]
    fn snapshot_serializes_with_wire_names() {
        let snap = UsageSnapshot {
            current_session: Some(bucket(45)),
            all_models: None,
            opus_only: None,
        };
        let value = serde_json::to_value(&snap).expect("serialize");
        assert_eq!(value["currentSession"]["percentage"], 45);
        assert_eq!(value["currentSession"]["reset"], "--");
        assert!(value.get("allModels").is_none());
        assert!(value.get("opusOnly").is_none());

        let back: UsageSnapshot = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, snap);
    }

    #[test]
    fn buckets_skips_absent_sections() {
        let snap = UsageSnapshot {
            current_session: None,
            all_models: Some(bucket(10)),
            opus_only: Some(bucket(3)),
        };
        let titles: Vec<_> = snap.buckets().into_iter().map(|(t, _)| t).collect();
        assert_eq!(titles, vec!["All Models", "Opus Only"]);
        assert!(UsageSnapshot::default().is_empty());
    }

    #[test]
    fn record_is_stale_at_threshold() {
        let captured_at = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        let record = CacheRecord {
            snapshot: UsageSnapshot::default(),
            captured_at,
        };
        let threshold = Duration::minutes(5);
        assert!(!record.is_stale(captured_at + Duration::minutes(4), threshold));
        assert!(record.is_stale(captured_at + Duration::minutes(5), threshold));
    }
}
