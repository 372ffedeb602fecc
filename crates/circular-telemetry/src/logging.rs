use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const DEFAULT_LIMIT: u32 = 100;

/// A persisted WARN or ERROR event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub response_id: Option<String>,
    pub campaign_id: Option<String>,
}

/// Newest-first lookup of persisted events for one response and/or campaign.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub response_id: Option<String>,
    pub campaign_id: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite table of WARN+ events, keyed by the ids the signing pipeline logs.
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
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 response_id TEXT,
                 campaign_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_response ON logs(response_id);
             CREATE INDEX IF NOT EXISTS idx_logs_campaign ON logs(campaign_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, level, target, message, fields, response_id, campaign_id
             FROM logs
             WHERE (?1 IS NULL OR response_id = ?1) AND (?2 IS NULL OR campaign_id = ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![q.response_id, q.campaign_id, q.limit.unwrap_or(DEFAULT_LIMIT)],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    response_id: row.get(6)?,
                    campaign_id: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    fn insert(&self, level: &str, target: &str, event: EventFields) {
        let fields = (!event.rest.is_empty())
            .then(|| serde_json::to_string(&event.rest).ok())
            .flatten();
        let conn = self.conn.lock();
        // A lost log line must never fail the caller.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, response_id, campaign_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                level,
                target,
                event.message.unwrap_or_default(),
                fields,
                event.ids.response_id,
                event.ids.campaign_id,
            ],
        );
    }
}

/// `tracing` layer feeding [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Ids carried by a span or an event. Stored in span extensions.
#[derive(Clone, Default)]
struct Ids {
    response_id: Option<String>,
    campaign_id: Option<String>,
}

impl Ids {
    fn fill_from(&mut self, outer: &Ids) {
        if self.response_id.is_none() {
            self.response_id.clone_from(&outer.response_id);
        }
        if self.campaign_id.is_none() {
            self.campaign_id.clone_from(&outer.campaign_id);
        }
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    ids: Ids,
    rest: Map<String, Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "response_id" => self.ids.response_id = Some(value),
            "campaign_id" => self.ids.campaign_id = Some(value),
            name => {
                self.rest.insert(name.to_string(), Value::String(value));
            }
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.ids.response_id.is_none() && fields.ids.campaign_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.ids);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > tracing::Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        // Innermost span first, so the closest id wins.
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(ids) = span.extensions().get::<Ids>() {
                    fields.ids.fill_from(ids);
                }
            }
        }

        let level = metadata.level().as_str();
        self.sink.insert(level, metadata.target(), fields);
    }
}
