use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const DEFAULT_QUERY_LIMIT: u32 = 100;
const MAX_QUERY_LIMIT: u32 = 1000;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub user_id: Option<String>,
}

/// Query parameters for searching persisted logs. Deserializes from a
/// request query string.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub user_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs, so failed cleanups and dropped
/// callbacks can be looked up per user after the fact.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 user_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.user_id,
            ],
        );
    }

    /// Matching records, newest first. `limit` defaults to 100 and is
    /// capped at 1000.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let filters = [
            ("level = ?", q.level.as_ref().map(|l| l.to_uppercase())),
            ("target LIKE ?", q.target.as_ref().map(|t| format!("%{t}%"))),
            ("user_id = ?", q.user_id.clone()),
            ("timestamp >= ?", q.since.clone()),
        ];
        let (clauses, values): (Vec<&str>, Vec<String>) = filters
            .into_iter()
            .filter_map(|(clause, value)| value.map(|v| (clause, v)))
            .unzip();

        let mut sql = String::from("SELECT id, timestamp, level, target, message, fields, user_id FROM logs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        let limit = i64::from(q.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT));

        let mut params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
        params.push(&limit);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                user_id: row.get(6)?,
            })
        })?;
        rows.collect()
    }

}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    user_id: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    user_id: Option<String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(val),
            "user_id" => self.user_id = Some(val.trim_matches('"').to_string()),
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "user_id" => self.user_id = Some(value.to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit the span's `user_id`.
struct SpanUser(String);

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.user_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                visitor.user_id = scope.into_iter().find_map(|span| {
                    let extensions = span.extensions();
                    extensions.get::<SpanUser>().map(|u| u.0.clone())
                });
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            user_id: visitor.user_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if let (Some(user_id), Some(span)) = (visitor.user_id, ctx.span(id)) {
            span.extensions_mut().insert(SpanUser(user_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn sink() -> (tempfile::TempDir, Arc<SqliteLogSink>) {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::new(&dir.path().join("logs.db")).unwrap();
        (dir, Arc::new(sink))
    }

    fn insert(sink: &SqliteLogSink, ts: &str, level: &str, target: &str, msg: &str, user: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: ts.into(),
            level: level.into(),
            target: target.into(),
            message: msg.into(),
            fields: None,
            user_id: user.map(Into::into),
        });
    }

    #[test]
    fn query_filters_by_user_and_level() {
        let (_dir, sink) = sink();
        insert(&sink, "2026-10-01T12:00:00Z", "WARN", "relay_sessions::cleanup", "still locked", Some("7"));
        insert(&sink, "2026-10-01T12:00:01Z", "ERROR", "relay_sessions::cleanup", "gave up", Some("7"));
        insert(&sink, "2026-10-01T12:00:02Z", "ERROR", "relay_sessions::notifier", "callback failed", Some("8"));

        let for_user = sink
            .query(&LogQuery {
                user_id: Some("7".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_user.len(), 2);
        assert_eq!(for_user[0].message, "gave up");

        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                target: Some("notifier".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].user_id.as_deref(), Some("8"));

        let warnings = sink
            .query(&LogQuery {
                level: Some("warn".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn query_since_and_limit() {
        let (_dir, sink) = sink();
        for i in 0..10 {
            insert(&sink, &format!("2026-10-01T12:00:{i:02}Z"), "WARN", "t", &format!("msg {i}"), None);
        }

        let recent = sink
            .query(&LogQuery {
                since: Some("2026-10-01T12:00:05Z".into()),
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "msg 9");

        let all = sink
            .query(&LogQuery {
                limit: Some(50),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn layer_persists_warn_and_inherits_span_user() {
        let (_dir, sink) = sink();
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not persisted");
            let span = tracing::info_span!("session", user_id = "42");
            let _entered = span.enter();
            tracing::warn!(attempt = 3u64, "cleanup retry");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "cleanup retry");
        assert_eq!(records[0].user_id.as_deref(), Some("42"));
        assert!(records[0].fields.as_deref().unwrap_or_default().contains("attempt"));
    }
}
