//! Calendar store backed by SQLite
//!
//! Content lives in typed columns. Tracking fields live in a loosely typed
//! JSON `attributes` column, the way a hosted calendar keeps custom
//! properties; this adapter alone converts them to [`TrackingFields`].

use std::sync::{Mutex, MutexGuard};

use appt_core::{Appointment, AppointmentPatch, StoreKind, SyncState, TrackingFields};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info};

use crate::error::{Result, StoreError};
use crate::store::{CalendarStore, StoreQuery, TrackingQuery};

/// Native attribute names for tracking fields
const ATTR_SYNCED_PEER_ID: &str = "synced_peer_id";
const ATTR_SOURCE_USER_ID: &str = "source_user_id";
const ATTR_SOURCE_PRIVATE_ID: &str = "source_private_id";
const ATTR_SYNC_STATE: &str = "sync_state";

/// Columns that must exist for this adapter to work
const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "title",
    "start_at",
    "start_utc",
    "end_at",
    "description",
    "location",
    "tags",
    "partner_relevant",
    "attributes",
    "created_at",
];

const SELECT_COLUMNS: &str = "id, title, start_at, end_at, description, location, tags, \
     partner_relevant, attributes, created_at";

/// SQLite-based calendar store
pub struct SqliteStore {
    name: String,
    kind: StoreKind,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: &str, name: impl Into<String>, kind: StoreKind) -> Result<Self> {
        debug!("Opening calendar database at: {}", db_path);
        let conn = Connection::open(db_path)?;
        let store = Self::from_connection(conn, name, kind)?;
        info!(store = %store.name, "SqliteStore initialized successfully");
        Ok(store)
    }

    /// Create an in-memory store (useful for testing)
    pub fn in_memory(name: impl Into<String>, kind: StoreKind) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, name, kind)
    }

    fn from_connection(conn: Connection, name: impl Into<String>, kind: StoreKind) -> Result<Self> {
        let store = Self {
            name: name.into(),
            kind,
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        store.verify_schema()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS appointments (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                start_at TEXT NOT NULL,
                start_utc TEXT NOT NULL,
                end_at TEXT NOT NULL,
                description TEXT,
                location TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                partner_relevant INTEGER NOT NULL DEFAULT 0,
                attributes TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_appointments_start ON appointments(start_utc)",
            [],
        )?;
        Ok(())
    }

    /// A pre-existing table missing a column is a configuration problem of
    /// the store; it is reported here once instead of failing every write.
    fn verify_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("PRAGMA table_info(appointments)")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for required in REQUIRED_COLUMNS {
            if !columns.iter().any(|c| c == required) {
                error!(store = %self.name, field = %required, "Calendar schema is missing a required field");
                return Err(StoreError::SchemaMissing {
                    field: (*required).to_string(),
                });
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable(format!("store '{}' lock poisoned", self.name)))
    }

    /// Rows don't record their origin; it is the store's own kind
    fn stamp(&self, mut record: Appointment) -> Appointment {
        record.origin = self.kind;
        record
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Appointment>> {
        let sql = format!("SELECT {} FROM appointments WHERE id = ?1", SELECT_COLUMNS);
        let raw = conn
            .query_row(&sql, params![id], RawRow::from_row)
            .optional()?;
        raw.map(RawRow::into_appointment).transpose()
    }

    fn write(conn: &Connection, record: &Appointment, id: &str, created_at: &str) -> Result<()> {
        let tags = serde_json::to_string(&record.tags)
            .map_err(|e| StoreError::Marshalling(e.to_string()))?;
        let attributes = encode_attributes(&record.tracking).to_string();

        conn.execute(
            "INSERT OR REPLACE INTO appointments
                (id, title, start_at, start_utc, end_at, description, location, tags,
                 partner_relevant, attributes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                record.title,
                record.start.to_rfc3339(),
                utc_key(&record.start),
                record.end.to_rfc3339(),
                record.description,
                record.location,
                tags,
                record.partner_relevant,
                attributes,
                created_at,
            ],
        )?;
        Ok(())
    }

    fn query(&self, query: &StoreQuery) -> Result<Vec<Appointment>> {
        let conn = self.lock()?;
        let order = "ORDER BY created_at ASC, id ASC";

        let (sql, arg) = match query {
            StoreQuery::TimeRange { start, end } => {
                let sql = format!(
                    "SELECT {} FROM appointments WHERE start_utc >= ?1 AND start_utc <= ?2 {}",
                    SELECT_COLUMNS, order
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        params![
                            start.to_rfc3339_opts(SecondsFormat::Secs, true),
                            end.to_rfc3339_opts(SecondsFormat::Secs, true)
                        ],
                        RawRow::from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                return rows.into_iter().map(RawRow::into_appointment).collect();
            }
            StoreQuery::TitlePrefix(prefix) => (
                format!(
                    "SELECT {} FROM appointments WHERE title LIKE ?1 ESCAPE '\\' {}",
                    SELECT_COLUMNS, order
                ),
                format!("{}%", escape_like(prefix)),
            ),
            StoreQuery::Tracking(tracking) => {
                let (attr, value) = match tracking {
                    TrackingQuery::SyncedPeerId(v) => (ATTR_SYNCED_PEER_ID, v),
                    TrackingQuery::SourcePrivateId(v) => (ATTR_SOURCE_PRIVATE_ID, v),
                    TrackingQuery::SourceUserId(v) => (ATTR_SOURCE_USER_ID, v),
                };
                (
                    format!(
                        "SELECT {} FROM appointments WHERE json_extract(attributes, '$.{}') = ?1 {}",
                        SELECT_COLUMNS, attr, order
                    ),
                    value.clone(),
                )
            }
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![arg], RawRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(RawRow::into_appointment)
            // LIKE folds ASCII only
            .filter(|r| r.as_ref().map(|a| query.matches(a)).unwrap_or(true))
            .collect()
    }
}

#[async_trait]
impl CalendarStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn create(&self, record: &Appointment) -> Result<String> {
        let id = uuid::Uuid::now_v7().to_string();
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let conn = self.lock()?;
        Self::write(&conn, record, &id, &created_at)?;
        debug!(store = %self.name, id = %id, "Created record");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Appointment>> {
        let conn = self.lock()?;
        Ok(Self::load(&conn, id)?.map(|record| self.stamp(record)))
    }

    async fn update(&self, id: &str, patch: &AppointmentPatch) -> Result<()> {
        let conn = self.lock()?;
        let mut record = Self::load(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let created_at = record
            .created_at
            .map(|c| c.to_rfc3339_opts(SecondsFormat::Micros, true))
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));

        patch.apply(&mut record);
        Self::write(&conn, &record, id, &created_at)?;
        debug!(store = %self.name, id = %id, "Updated record");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let rows_affected = conn.execute("DELETE FROM appointments WHERE id = ?1", params![id])?;
        if rows_affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        debug!(store = %self.name, id = %id, "Deleted record");
        Ok(())
    }

    async fn find(&self, query: &StoreQuery) -> Result<Vec<Appointment>> {
        let found = self.query(query)?;
        debug!(store = %self.name, count = found.len(), "Found records for {:?}", query);
        Ok(found.into_iter().map(|record| self.stamp(record)).collect())
    }
}

/// Row as stored, before marshalling
struct RawRow {
    id: String,
    title: String,
    start_at: String,
    end_at: String,
    description: Option<String>,
    location: Option<String>,
    tags: String,
    partner_relevant: bool,
    attributes: String,
    created_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            start_at: row.get(2)?,
            end_at: row.get(3)?,
            description: row.get(4)?,
            location: row.get(5)?,
            tags: row.get(6)?,
            partner_relevant: row.get(7)?,
            attributes: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_appointment(self) -> Result<Appointment> {
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| StoreError::Marshalling(format!("tags of {}: {}", self.id, e)))?;
        let attributes: JsonValue = serde_json::from_str(&self.attributes)
            .map_err(|e| StoreError::Marshalling(format!("attributes of {}: {}", self.id, e)))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Marshalling(format!("created_at of {}: {}", self.id, e)))?;

        Ok(Appointment {
            title: self.title,
            start: parse_instant(&self.start_at)?,
            end: parse_instant(&self.end_at)?,
            description: self.description,
            location: self.location,
            tags,
            partner_relevant: self.partner_relevant,
            origin: StoreKind::default(),
            tracking: decode_attributes(&attributes)?,
            created_at: Some(created_at),
            id: Some(self.id),
        })
    }
}

fn parse_instant(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|e| StoreError::Marshalling(format!("invalid instant '{}': {}", value, e)))
}

/// Sortable UTC text used for range scans
fn utc_key(instant: &DateTime<FixedOffset>) -> String {
    instant
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn encode_attributes(tracking: &TrackingFields) -> JsonValue {
    let mut map = Map::new();
    if let Some(peer) = &tracking.synced_peer_id {
        map.insert(ATTR_SYNCED_PEER_ID.to_string(), JsonValue::from(peer.as_str()));
    }
    if let Some(user) = &tracking.source_user_id {
        map.insert(ATTR_SOURCE_USER_ID.to_string(), JsonValue::from(user.as_str()));
    }
    if let Some(private_id) = &tracking.source_private_id {
        map.insert(
            ATTR_SOURCE_PRIVATE_ID.to_string(),
            JsonValue::from(private_id.as_str()),
        );
    }
    map.insert(
        ATTR_SYNC_STATE.to_string(),
        JsonValue::from(tracking.sync_state.as_str()),
    );
    JsonValue::Object(map)
}

fn decode_attributes(attributes: &JsonValue) -> Result<TrackingFields> {
    let text = |key: &str| -> Option<String> {
        attributes
            .get(key)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let sync_state = match text(ATTR_SYNC_STATE) {
        Some(raw) => raw.parse::<SyncState>().map_err(StoreError::Marshalling)?,
        None => SyncState::Unsynced,
    };

    Ok(TrackingFields {
        synced_peer_id: text(ATTR_SYNCED_PEER_ID),
        source_user_id: text(ATTR_SOURCE_USER_ID),
        source_private_id: text(ATTR_SOURCE_PRIVATE_ID),
        sync_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appointment(title: &str, hour: u32) -> Appointment {
        let tz = FixedOffset::east_opt(-5 * 3600).unwrap();
        Appointment::new(
            title,
            tz.with_ymd_and_hms(2025, 11, 3, hour, 30, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 11, 3, hour + 1, 30, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_round_trip_preserves_offset_and_tracking() -> Result<()> {
        let store = SqliteStore::in_memory("shared", StoreKind::Shared)?;

        let mut record = appointment("School conference", 16)
            .with_location("Room 4")
            .with_tags(vec!["school".to_string()])
            .with_partner_relevant(true);
        record.tracking = TrackingFields::mirror_of("bob", "p-42");

        let id = store.create(&record).await?;
        let loaded = store.get(&id).await?.unwrap();

        assert_eq!(loaded.start, record.start);
        assert_eq!(loaded.start.offset().local_minus_utc(), -5 * 3600);
        assert_eq!(loaded.tags, vec!["school".to_string()]);
        assert!(loaded.partner_relevant);
        assert_eq!(loaded.tracking.source_private_id.as_deref(), Some("p-42"));
        assert_eq!(loaded.tracking.source_user_id.as_deref(), Some("bob"));
        Ok(())
    }

    #[tokio::test]
    async fn test_find_by_tracking_field() -> Result<()> {
        let store = SqliteStore::in_memory("shared", StoreKind::Shared)?;

        let mut mirror = appointment("Dinner", 19);
        mirror.tracking = TrackingFields::mirror_of("alice", "p-1");
        let mirror_id = store.create(&mirror).await?;
        store.create(&appointment("Dinner", 19)).await?;

        let found = store.find(&StoreQuery::source_private_id("p-1")).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_deref(), Some(mirror_id.as_str()));
        assert_eq!(found[0].origin, StoreKind::Shared);

        let loaded = store.get(&mirror_id).await?.unwrap();
        assert_eq!(loaded.origin, StoreKind::Shared);
        Ok(())
    }

    #[tokio::test]
    async fn test_find_by_time_range_and_prefix() -> Result<()> {
        let store = SqliteStore::in_memory("private", StoreKind::Private)?;
        store.create(&appointment("Yoga 100%", 7)).await?;
        store.create(&appointment("Yoga class", 18)).await?;

        // 07:30 at -05:00 is 12:30 UTC
        let range = StoreQuery::time_range(
            Utc.with_ymd_and_hms(2025, 11, 3, 12, 25, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 11, 3, 12, 35, 0).unwrap(),
        );
        let found = store.find(&range).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Yoga 100%");

        assert_eq!(store.find(&StoreQuery::title_prefix("yoga")).await?.len(), 2);
        assert_eq!(store.find(&StoreQuery::title_prefix("Yoga 100%")).await?.len(), 1);
        assert_eq!(store.find(&StoreQuery::title_prefix("Yoga_")).await?.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_patches_tracking_only() -> Result<()> {
        let store = SqliteStore::in_memory("private", StoreKind::Private)?;
        let id = store.create(&appointment("Vet", 10)).await?;
        let before = store.get(&id).await?.unwrap();

        store.update(&id, &AppointmentPatch::link_peer("s-1")).await?;
        let after = store.get(&id).await?.unwrap();

        assert_eq!(after.tracking.synced_peer_id.as_deref(), Some("s-1"));
        assert_eq!(after.tracking.sync_state, SyncState::Synced);
        assert!(!after.content_differs(&before));
        assert_eq!(after.created_at, before.created_at);

        assert!(store.update("missing", &AppointmentPatch::unlink_peer()).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() -> Result<()> {
        let store = SqliteStore::in_memory("private", StoreKind::Private)?;
        let id = store.create(&appointment("Haircut", 11)).await?;
        store.delete(&id).await?;
        assert!(store.delete(&id).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn test_schema_missing_field_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE appointments (id TEXT PRIMARY KEY, title TEXT, start_at TEXT,
             start_utc TEXT, end_at TEXT, description TEXT, location TEXT, tags TEXT,
             partner_relevant INTEGER, created_at TEXT)",
            [],
        )
        .unwrap();

        let result = SqliteStore::from_connection(conn, "legacy", StoreKind::Shared);
        match result {
            Err(StoreError::SchemaMissing { field }) => assert_eq!(field, "attributes"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected schema error"),
        }
    }

    #[test]
    fn test_open_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.db");
        let store = SqliteStore::open(path.to_str().unwrap(), "file", StoreKind::Business).unwrap();
        assert_eq!(store.kind(), StoreKind::Business);
    }
}
