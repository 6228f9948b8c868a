use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{named_params, params_from_iter, Connection, Row};

use super::{AuditError, AuditEvent, AuditFilter, AuditOrder, AuditRecord, AuditStore};

// Timestamps are microseconds since the epoch so range scans and ordering
// stay numeric. stage/transition/subject are lifted out of the payload for
// filtering; `payload` stays the source of truth.
const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS pipeline_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recorded_at INTEGER NOT NULL,
        kind TEXT NOT NULL,
        item_id TEXT,
        actor TEXT,
        stage TEXT,
        transition TEXT,
        subject TEXT,
        payload TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_pipeline_events_item ON pipeline_events(item_id, id);
    CREATE INDEX IF NOT EXISTS idx_pipeline_events_kind ON pipeline_events(kind, recorded_at);
    CREATE INDEX IF NOT EXISTS idx_pipeline_events_stage ON pipeline_events(stage, transition);
    CREATE INDEX IF NOT EXISTS idx_pipeline_events_recorded ON pipeline_events(recorded_at);
"#;

const COLUMNS: &str = "id, recorded_at, kind, item_id, actor, payload";

/// SQLite-backed pipeline event trail.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

/// WHERE fragments and the values bound to them, in order.
#[derive(Default)]
struct Conditions {
    clauses: Vec<&'static str>,
    values: Vec<Value>,
}

impl Conditions {
    fn for_filter(filter: &AuditFilter) -> Self {
        let mut conditions = Self::default();

        let text_columns = [
            ("item_id = ?", &filter.item_id),
            ("kind = ?", &filter.event_type),
            ("actor = ?", &filter.actor),
            ("stage = ?", &filter.stage),
            ("transition = ?", &filter.transition),
            ("subject = ?", &filter.subject),
        ];
        for (clause, value) in text_columns {
            if let Some(value) = value {
                conditions.push(clause, Value::Text(value.clone()));
            }
        }

        if let Some(from) = filter.from {
            conditions.push("recorded_at >= ?", Value::Integer(from.timestamp_micros()));
        }
        if let Some(to) = filter.to {
            conditions.push("recorded_at <= ?", Value::Integer(to.timestamp_micros()));
        }

        conditions
    }

    fn push(&mut self, clause: &'static str, value: Value) {
        self.clauses.push(clause);
        self.values.push(value);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

impl SqliteAuditStore {
    /// Open (or create) the event trail at `path`.
    pub fn new(path: &Path) -> Result<Self, AuditError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn
            .lock()
            .map_err(|_| AuditError::Database("audit connection poisoned".to_string()))
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
        Ok(StoredEvent {
            id: row.get(0)?,
            recorded_at: row.get(1)?,
            kind: row.get(2)?,
            item_id: row.get(3)?,
            actor: row.get(4)?,
            payload: row.get(5)?,
        })
    }
}

/// A row before its payload is decoded.
struct StoredEvent {
    id: i64,
    recorded_at: i64,
    kind: String,
    item_id: Option<String>,
    actor: Option<String>,
    payload: String,
}

impl TryFrom<StoredEvent> for AuditRecord {
    type Error = AuditError;

    fn try_from(row: StoredEvent) -> Result<Self, Self::Error> {
        let timestamp = DateTime::<Utc>::from_timestamp_micros(row.recorded_at).ok_or_else(|| {
            AuditError::Database(format!("event {} has an out-of-range timestamp", row.id))
        })?;
        let data: AuditEvent = serde_json::from_str(&row.payload)?;
        Ok(AuditRecord {
            id: row.id,
            timestamp,
            event_type: row.kind,
            item_id: row.item_id,
            actor: row.actor,
            data,
        })
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError> {
        let payload = serde_json::to_string(&record.data)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pipeline_events
                (recorded_at, kind, item_id, actor, stage, transition, subject, payload)
             VALUES (:recorded_at, :kind, :item_id, :actor, :stage, :transition, :subject, :payload)",
            named_params! {
                ":recorded_at": record.timestamp.timestamp_micros(),
                ":kind": record.event_type,
                ":item_id": record.item_id,
                ":actor": record.actor,
                ":stage": record.data.stage(),
                ":transition": record.data.transition(),
                ":subject": record.data.subject(),
                ":payload": payload,
            },
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let conditions = Conditions::for_filter(filter);
        // id breaks ties between events recorded in the same microsecond.
        let order = match filter.order {
            AuditOrder::NewestFirst => "recorded_at DESC, id DESC",
            AuditOrder::OldestFirst => "recorded_at ASC, id ASC",
        };
        let sql = format!(
            "SELECT {} FROM pipeline_events{} ORDER BY {} LIMIT ? OFFSET ?",
            COLUMNS,
            conditions.sql(),
            order
        );

        let mut values = conditions.values;
        values.push(Value::Integer(filter.limit));
        values.push(Value::Integer(filter.offset));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), Self::read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(AuditRecord::try_from).collect()
    }

    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError> {
        let conditions = Conditions::for_filter(filter);
        let sql = format!("SELECT COUNT(*) FROM pipeline_events{}", conditions.sql());

        let conn = self.conn()?;
        let count = conn.query_row(&sql, params_from_iter(conditions.values), |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(data: AuditEvent) -> AuditRecord {
        AuditRecord {
            id: 0,
            timestamp: Utc::now(),
            event_type: data.event_type().to_string(),
            item_id: data.item_id().map(String::from),
            actor: data.actor().map(String::from),
            data,
        }
    }

    fn stage_changed(item_id: &str, from: &str, to: &str, transition: &str) -> AuditRecord {
        record(AuditEvent::StageChanged {
            item_id: item_id.to_string(),
            from_stage: from.to_string(),
            to_stage: to.to_string(),
            transition: transition.to_string(),
            retry_count: u32::from(transition == "fail"),
            reason: None,
        })
    }

    fn selected(item_id: &str, subject: &str, source: &str) -> AuditRecord {
        record(AuditEvent::CandidateSelected {
            item_id: item_id.to_string(),
            subject: subject.to_string(),
            candidate_id: format!("c-{}", source),
            source_identifier: source.to_string(),
            score: 4200,
            candidates_considered: 12,
            used_fallback: false,
        })
    }

    fn started() -> AuditRecord {
        record(AuditEvent::ServiceStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc123".to_string(),
        })
    }

    #[test]
    fn test_insert_and_query_newest_first() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let first = store.insert(&started()).unwrap();
        let second = store
            .insert(&stage_changed("i-1", "new", "indexed", "advance"))
            .unwrap();
        assert!(second > first);

        let results = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, second);
        assert_eq!(results[0].event_type, "stage_changed");
        assert_eq!(results[1].event_type, "service_started");
    }

    #[test]
    fn test_item_history_replays_in_order() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let at = Utc::now();
        // Same instant, so insertion order decides
        for (from, to) in [("new", "indexed"), ("indexed", "library_matched")] {
            let mut event = stage_changed("i-1", from, to, "advance");
            event.timestamp = at;
            store.insert(&event).unwrap();
        }
        store.insert(&stage_changed("i-2", "new", "indexed", "advance")).unwrap();
        store.insert(&selected("i-1", "movie", "aaa")).unwrap();

        let history = store.item_history("i-1", 10).unwrap();
        let kinds: Vec<&str> = history.iter().map(|r| r.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["stage_changed", "stage_changed", "candidate_selected"]);
        assert!(matches!(
            &history[1].data,
            AuditEvent::StageChanged { to_stage, .. } if to_stage == "library_matched"
        ));
    }

    #[test]
    fn test_filter_by_stage_transition_and_subject() {
        let store = SqliteAuditStore::in_memory().unwrap();
        store.insert(&stage_changed("i-1", "scraped", "downloaded", "advance")).unwrap();
        store.insert(&stage_changed("i-2", "scraped", "download_failed", "fail")).unwrap();
        store.insert(&stage_changed("i-2", "download_failed", "download_failed", "fail")).unwrap();
        store.insert(&selected("i-3", "season:1", "pack")).unwrap();
        store.insert(&selected("i-3", "movie", "bbb")).unwrap();
        store
            .insert(&record(AuditEvent::ItemReset {
                item_id: "i-4".to_string(),
                reset_by: "api".to_string(),
                previous_stage: "failed_scrape".to_string(),
            }))
            .unwrap();

        let failures = AuditFilter::new().with_stage("download_failed");
        assert_eq!(store.count(&failures).unwrap(), 2);

        let fails = AuditFilter::new().with_transition("fail").with_item_id("i-2");
        assert_eq!(store.query(&fails).unwrap().len(), 2);

        let resets = AuditFilter::new().with_transition("reset");
        let results = store.query(&resets).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].actor.as_deref(), Some("api"));

        let packs = AuditFilter::new().with_subject("season:1");
        let results = store.query(&packs).unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0].data,
            AuditEvent::CandidateSelected { source_identifier, .. } if source_identifier == "pack"
        ));
    }

    #[test]
    fn test_query_with_time_range() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let now = Utc::now();

        let mut old = started();
        old.timestamp = now - Duration::hours(2);
        store.insert(&old).unwrap();
        let mut recent = started();
        recent.timestamp = now;
        store.insert(&recent).unwrap();

        let filter = AuditFilter::new().with_time_range(Some(now - Duration::hours(1)), None);
        assert_eq!(store.query(&filter).unwrap().len(), 1);

        let filter = AuditFilter::new().with_time_range(None, Some(now - Duration::hours(1)));
        let results = store.query(&filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].timestamp.timestamp_micros(),
            old.timestamp.timestamp_micros()
        );
    }

    #[test]
    fn test_pagination_and_count_ignore_page() {
        let store = SqliteAuditStore::in_memory().unwrap();
        for i in 0..5 {
            store
                .insert(&stage_changed(&format!("i-{}", i), "new", "indexed", "advance"))
                .unwrap();
        }

        let page = AuditFilter::new().with_limit(2).with_offset(4);
        assert_eq!(store.query(&page).unwrap().len(), 1);
        assert_eq!(store.count(&page).unwrap(), 5);

        let oldest = AuditFilter::new().with_order(AuditOrder::OldestFirst).with_limit(1);
        assert_eq!(store.query(&oldest).unwrap()[0].item_id.as_deref(), Some("i-0"));
    }

    #[test]
    fn test_file_based_store_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("audit.db");

        let store = SqliteAuditStore::new(&db_path).unwrap();
        store.insert(&selected("i-1", "movie", "aaa")).unwrap();
        drop(store);

        let reopened = SqliteAuditStore::new(&db_path).unwrap();
        let history = reopened.item_history("i-1", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "candidate_selected");
    }
}
