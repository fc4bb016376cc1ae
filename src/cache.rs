use crate::error::AppError;
use crate::models::{CacheRecord, UsageSnapshot, WidgetPosition, WidgetState};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

pub const KEY_USAGE_DATA: &str = "usageData";
pub const KEY_LAST_UPDATE: &str = "lastUpdate";
pub const KEY_WIDGET_VISIBLE: &str = "widgetVisible";
pub const KEY_WIDGET_COLLAPSED: &str = "widgetCollapsed";
pub const KEY_WIDGET_POSITION: &str = "widgetPosition";
pub const KEY_INITIAL_FETCH: &str = "hasShownInitialFetch";

/// What the widget has to show before any fresh data arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheView {
    Fresh(CacheRecord),
    Stale(CacheRecord),
    Empty,
}

/// Persistent key-value state shared by every part of the app. Values are JSON.
pub struct CacheStore {
    conn: Mutex<Connection>,
}

impl CacheStore {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AppError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |r| r.get(0))
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AppError> {
        let raw = serde_json::to_string(value)?;
        self.conn.lock().execute(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, raw],
        )?;
        Ok(())
    }

    pub fn get(&self) -> Result<Option<CacheRecord>, AppError> {
        let snapshot: Option<UsageSnapshot> = self.get_value(KEY_USAGE_DATA)?;
        let millis: Option<i64> = self.get_value(KEY_LAST_UPDATE)?;
        let (Some(snapshot), Some(millis)) = (snapshot, millis) else {
            return Ok(None);
        };
        let Some(captured_at) = Utc.timestamp_millis_opt(millis).single() else {
            tracing::warn!(millis, "ignoring cached record with invalid timestamp");
            return Ok(None);
        };
        Ok(Some(CacheRecord {
            snapshot,
            captured_at,
        }))
    }

    /// Replaces the cached snapshot and its timestamp together.
    pub fn put(&self, snapshot: &UsageSnapshot, captured_at: DateTime<Utc>) -> Result<CacheRecord, AppError> {
        // Stored at millisecond precision; return exactly what a later get() sees.
        let captured_at = Utc
            .timestamp_millis_opt(captured_at.timestamp_millis())
            .single()
            .unwrap_or(captured_at);
        let data = serde_json::to_string(snapshot)?;
        let millis = serde_json::to_string(&captured_at.timestamp_millis())?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?;
            upsert.execute(params![KEY_USAGE_DATA, data])?;
            upsert.execute(params![KEY_LAST_UPDATE, millis])?;
        }
        tx.commit()?;

        tracing::debug!(captured_at = %captured_at, "cached usage snapshot");
        Ok(CacheRecord {
            snapshot: snapshot.clone(),
            captured_at,
        })
    }

    pub fn view(&self, now: DateTime<Utc>, freshness: Duration) -> Result<CacheView, AppError> {
        Ok(match self.get()? {
            Some(record) if record.is_stale(now, freshness) => CacheView::Stale(record),
            Some(record) => CacheView::Fresh(record),
            None => CacheView::Empty,
        })
    }

    pub fn widget_state(&self) -> Result<WidgetState, AppError> {
        let defaults = WidgetState::default();
        Ok(WidgetState {
            visible: self.get_value(KEY_WIDGET_VISIBLE)?.unwrap_or(defaults.visible),
            collapsed: self.get_value(KEY_WIDGET_COLLAPSED)?.unwrap_or(defaults.collapsed),
            position: self.get_value(KEY_WIDGET_POSITION)?,
            has_shown_initial_fetch: self
                .get_value(KEY_INITIAL_FETCH)?
                .unwrap_or(defaults.has_shown_initial_fetch),
        })
    }

    pub fn set_widget_visible(&self, visible: bool) -> Result<(), AppError> {
        self.set_value(KEY_WIDGET_VISIBLE, &visible)
    }

    pub fn set_widget_collapsed(&self, collapsed: bool) -> Result<(), AppError> {
        self.set_value(KEY_WIDGET_COLLAPSED, &collapsed)
    }

    pub fn set_widget_position(&self, position: WidgetPosition) -> Result<(), AppError> {
        self.set_value(KEY_WIDGET_POSITION, &position)
    }

    pub fn mark_initial_fetch_shown(&self) -> Result<(), AppError> {
        self.set_value(KEY_INITIAL_FETCH, &true)
    }

    pub fn export_json(&self) -> Result<String, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Map::new();
        for (key, raw) in rows {
            out.insert(key, serde_json::from_str::<Value>(&raw)?);
        }
        Ok(serde_json::to_string_pretty(&Value::Object(out))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageBucket;
    use tempfile::TempDir;

    fn sample_snapshot(percentage: u32) -> UsageSnapshot {
        UsageSnapshot {
            current_session: Some(UsageBucket {
                percentage,
                reset_label: "2時間後".into(),
            }),
            all_models: None,
            opus_only: None,
        }
    }

    fn fixed_ts(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + (minute * 60), 0)
            .single()
            .expect("valid fixed timestamp")
    }

    #[test]
    fn empty_store_has_no_record() {
        let store = CacheStore::open_in_memory().expect("open");
        assert!(store.get().expect("get").is_none());
        assert_eq!(
            store.view(fixed_ts(0), Duration::minutes(5)).expect("view"),
            CacheView::Empty
        );
    }

    #[test]
    fn put_replaces_previous_record() {
        let tmp = TempDir::new().expect("tempdir");
        let db = tmp.path().join("cache.sqlite");
        let store = CacheStore::open(&db).expect("open");

        store.put(&sample_snapshot(10), fixed_ts(0)).expect("first put");
        store.put(&sample_snapshot(55), fixed_ts(3)).expect("second put");

        let reopened = CacheStore::open(&db).expect("reopen");
        let record = reopened.get().expect("get").expect("record");
        assert_eq!(record.snapshot, sample_snapshot(55));
        assert_eq!(record.captured_at, fixed_ts(3));
    }

    #[test]
    fn view_classifies_stale_records_but_keeps_them() {
        let store = CacheStore::open_in_memory().expect("open");
        let record = store.put(&sample_snapshot(20), fixed_ts(0)).expect("put");

        let fresh = store.view(fixed_ts(4), Duration::minutes(5)).expect("view");
        assert_eq!(fresh, CacheView::Fresh(record.clone()));

        let stale = store.view(fixed_ts(30), Duration::minutes(5)).expect("view");
        assert_eq!(stale, CacheView::Stale(record));
    }

    #[test]
    fn widget_state_defaults_to_visible() {
        let store = CacheStore::open_in_memory().expect("open");
        assert_eq!(store.widget_state().expect("state"), WidgetState::default());

        store.set_widget_visible(false).expect("hide");
        store.set_widget_collapsed(true).expect("collapse");
        store
            .set_widget_position(WidgetPosition { x: 12, y: -3 })
            .expect("move");
        store.mark_initial_fetch_shown().expect("flag");

        let state = store.widget_state().expect("state");
        assert!(!state.visible);
        assert!(state.collapsed);
        assert_eq!(state.position, Some(WidgetPosition { x: 12, y: -3 }));
        assert!(state.has_shown_initial_fetch);
    }

    #[test]
    fn export_json_uses_storage_keys() {
        let store = CacheStore::open_in_memory().expect("open");
        store.put(&sample_snapshot(45), fixed_ts(0)).expect("put");
        store.set_widget_visible(true).expect("visible");

        let json: Value = serde_json::from_str(&store.export_json().expect("export")).expect("parse");
        assert_eq!(json["usageData"]["currentSession"]["percentage"], 45);
        assert_eq!(json["lastUpdate"], fixed_ts(0).timestamp_millis());
        assert_eq!(json["widgetVisible"], true);
    }
}
