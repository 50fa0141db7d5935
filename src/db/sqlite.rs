use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use crate::db::schema_sqlite::{
    backfill_cursor, last_seen_timestamp, registered_bridges, synced_messages,
};

use super::{
    DatabaseError,
    models::{MappingEntry, MappingKind, SyncedOrigin, mirror_key, synced_key},
    stores::{CursorStore, MappingStore, SyncedMessageStore, WatermarkStore},
};

const SIDE_A: &str = "a";
const SIDE_B: &str = "b";

// SQLite has no timestamptz, timestamps are kept as RFC3339 text
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = registered_bridges)]
struct DbBridgeRow {
    map_key: String,
    map_value: String,
    parent: Option<String>,
    created_at: String,
}

impl DbBridgeRow {
    fn to_mapping_entry(&self, kind: MappingKind) -> Result<MappingEntry, DatabaseError> {
        let prefix = format!("{}:", kind.prefixes().0);
        Ok(MappingEntry {
            kind,
            key_a: self
                .map_key
                .strip_prefix(&prefix)
                .unwrap_or(&self.map_key)
                .to_string(),
            key_b: self.map_value.clone(),
            parent: self.parent.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = registered_bridges)]
struct NewBridgeRow<'a> {
    map_key: &'a str,
    map_value: &'a str,
    namespace: &'a str,
    side: &'a str,
    parent: Option<&'a str>,
    created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = synced_messages)]
struct NewSyncedRow<'a> {
    map_key: &'a str,
    scope: &'a str,
    message_id: &'a str,
    mirror_id: &'a str,
    created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = last_seen_timestamp)]
struct NewWatermark<'a> {
    conversation_id: &'a str,
    last_seen: i64,
    updated_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = backfill_cursor)]
struct NewCursor<'a> {
    conversation_id: &'a str,
    token: &'a str,
    updated_at: String,
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    let mut conn = SqliteConnection::establish(path)
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    // concurrent backfills open their own connections
    conn.batch_execute("PRAGMA busy_timeout = 5000;")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    Ok(conn)
}

async fn with_connection<T, F>(db_path: Arc<String>, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct SqliteMappingStore {
    db_path: Arc<String>,
    kind: MappingKind,
}

impl SqliteMappingStore {
    pub fn new(db_path: Arc<String>, kind: MappingKind) -> Self {
        Self { db_path, kind }
    }

    async fn lookup(&self, key: String) -> Result<Option<String>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            registered_bridges::table
                .filter(registered_bridges::map_key.eq(&key))
                .select(registered_bridges::map_value)
                .first::<String>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn register(
        &self,
        key_a: &str,
        key_b: &str,
        parent: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let kind = self.kind;
        let key_a = key_a.to_string();
        let key_b = key_b.to_string();
        let parent = parent.map(ToOwned::to_owned);
        with_connection(self.db_path.clone(), move |conn| {
            conn.immediate_transaction::<_, DatabaseError, _>(|conn| {
                let forward = kind.forward_key(&key_a);
                let reverse = kind.reverse_key(&key_b);

                let taken: i64 = registered_bridges::table
                    .filter(
                        registered_bridges::map_key
                            .eq(&forward)
                            .or(registered_bridges::map_key.eq(&reverse)),
                    )
                    .count()
                    .get_result(conn)?;
                if taken > 0 {
                    return Err(DatabaseError::AlreadyRegistered(format!(
                        "{} {} <-> {}",
                        kind.name(),
                        key_a,
                        key_b
                    )));
                }

                let now = datetime_to_string(&Utc::now());
                diesel::insert_into(registered_bridges::table)
                    .values(NewBridgeRow {
                        map_key: &forward,
                        map_value: &key_b,
                        namespace: kind.name(),
                        side: SIDE_A,
                        parent: parent.as_deref(),
                        created_at: now.clone(),
                    })
                    .execute(conn)?;
                diesel::insert_into(registered_bridges::table)
                    .values(NewBridgeRow {
                        map_key: &reverse,
                        map_value: &key_a,
                        namespace: kind.name(),
                        side: SIDE_B,
                        parent: parent.as_deref(),
                        created_at: now,
                    })
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn unregister(&self, key_a: &str, key_b: &str) -> Result<(), DatabaseError> {
        let kind = self.kind;
        let key_a = key_a.to_string();
        let key_b = key_b.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            conn.immediate_transaction::<_, DatabaseError, _>(|conn| {
                let forward = kind.forward_key(&key_a);
                let reverse = kind.reverse_key(&key_b);

                let stored_b = registered_bridges::table
                    .filter(registered_bridges::map_key.eq(&forward))
                    .select(registered_bridges::map_value)
                    .first::<String>(conn)
                    .optional()?;
                let stored_a = registered_bridges::table
                    .filter(registered_bridges::map_key.eq(&reverse))
                    .select(registered_bridges::map_value)
                    .first::<String>(conn)
                    .optional()?;
                if stored_b.as_deref() != Some(key_b.as_str())
                    || stored_a.as_deref() != Some(key_a.as_str())
                {
                    return Err(DatabaseError::NotRegistered(format!(
                        "{} {} <-> {}",
                        kind.name(),
                        key_a,
                        key_b
                    )));
                }

                diesel::delete(
                    registered_bridges::table.filter(
                        registered_bridges::map_key
                            .eq(&forward)
                            .or(registered_bridges::map_key.eq(&reverse)),
                    ),
                )
                .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn lookup_by_a(&self, key_a: &str) -> Result<Option<String>, DatabaseError> {
        self.lookup(self.kind.forward_key(key_a)).await
    }

    async fn lookup_by_b(&self, key_b: &str) -> Result<Option<String>, DatabaseError> {
        self.lookup(self.kind.reverse_key(key_b)).await
    }

    async fn list_children(&self, parent_key: &str) -> Result<Vec<String>, DatabaseError> {
        let kind = self.kind;
        let parent_key = parent_key.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            registered_bridges::table
                .filter(registered_bridges::namespace.eq(kind.name()))
                .filter(registered_bridges::side.eq(SIDE_A))
                .filter(registered_bridges::parent.eq(&parent_key))
                .order(registered_bridges::created_at.asc())
                .select(registered_bridges::map_value)
                .load::<String>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn list_entries(&self) -> Result<Vec<MappingEntry>, DatabaseError> {
        let kind = self.kind;
        with_connection(self.db_path.clone(), move |conn| {
            registered_bridges::table
                .filter(registered_bridges::namespace.eq(kind.name()))
                .filter(registered_bridges::side.eq(SIDE_A))
                .order(registered_bridges::created_at.asc())
                .select(DbBridgeRow::as_select())
                .load::<DbBridgeRow>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .iter()
                .map(|row| row.to_mapping_entry(kind))
                .collect()
        })
        .await
    }
}

pub struct SqliteSyncedMessageStore {
    db_path: Arc<String>,
}

impl SqliteSyncedMessageStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl SyncedMessageStore for SqliteSyncedMessageStore {
    async fn mirror_of(
        &self,
        scope: &str,
        message_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let key = synced_key(scope, message_id);
        with_connection(self.db_path.clone(), move |conn| {
            synced_messages::table
                .filter(synced_messages::map_key.eq(&key))
                .select(synced_messages::mirror_id)
                .first::<String>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn record(
        &self,
        scope: &str,
        message_id: &str,
        mirror_id: &str,
    ) -> Result<(), DatabaseError> {
        let scope = scope.to_string();
        let message_id = message_id.to_string();
        let mirror_id = mirror_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            conn.immediate_transaction::<_, DatabaseError, _>(|conn| {
                let forward = synced_key(&scope, &message_id);
                let reverse = mirror_key(&mirror_id);

                let taken: i64 = synced_messages::table
                    .filter(
                        synced_messages::map_key
                            .eq(&forward)
                            .or(synced_messages::map_key.eq(&reverse)),
                    )
                    .count()
                    .get_result(conn)?;
                if taken > 0 {
                    return Err(DatabaseError::AlreadyRegistered(forward));
                }

                let now = datetime_to_string(&Utc::now());
                for key in [&forward, &reverse] {
                    diesel::insert_into(synced_messages::table)
                        .values(NewSyncedRow {
                            map_key: key,
                            scope: &scope,
                            message_id: &message_id,
                            mirror_id: &mirror_id,
                            created_at: now.clone(),
                        })
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn record_delivery(
        &self,
        scope: &str,
        remote_id: &str,
        mirror_id: &str,
    ) -> Result<(), DatabaseError> {
        let scope = scope.to_string();
        let remote_id = remote_id.to_string();
        let mirror_id = mirror_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            conn.immediate_transaction::<_, DatabaseError, _>(|conn| {
                let key = synced_key(&scope, &remote_id);
                let exists = synced_messages::table
                    .filter(synced_messages::map_key.eq(&key))
                    .select(synced_messages::map_key)
                    .first::<String>(conn)
                    .optional()?
                    .is_some();
                if exists {
                    return Ok(());
                }

                diesel::insert_into(synced_messages::table)
                    .values(NewSyncedRow {
                        map_key: &key,
                        scope: &scope,
                        message_id: &remote_id,
                        mirror_id: &mirror_id,
                        created_at: datetime_to_string(&Utc::now()),
                    })
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn origin_of(&self, mirror_id: &str) -> Result<Option<SyncedOrigin>, DatabaseError> {
        let key = mirror_key(mirror_id);
        with_connection(self.db_path.clone(), move |conn| {
            synced_messages::table
                .filter(synced_messages::map_key.eq(&key))
                .select((synced_messages::scope, synced_messages::message_id))
                .first::<(String, String)>(conn)
                .optional()
                .map(|row| row.map(|(scope, message_id)| SyncedOrigin { scope, message_id }))
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct SqliteWatermarkStore {
    db_path: Arc<String>,
}

impl SqliteWatermarkStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl WatermarkStore for SqliteWatermarkStore {
    async fn last_seen(&self, conversation: &str) -> Result<Option<i64>, DatabaseError> {
        let conversation = conversation.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            last_seen_timestamp::table
                .filter(last_seen_timestamp::conversation_id.eq(&conversation))
                .select(last_seen_timestamp::last_seen)
                .first::<i64>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn advance(&self, conversation: &str, timestamp: i64) -> Result<bool, DatabaseError> {
        let conversation = conversation.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            conn.immediate_transaction::<_, DatabaseError, _>(|conn| {
                let now = datetime_to_string(&Utc::now());
                let inserted = diesel::insert_into(last_seen_timestamp::table)
                    .values(NewWatermark {
                        conversation_id: &conversation,
                        last_seen: timestamp,
                        updated_at: now.clone(),
                    })
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                if inserted > 0 {
                    return Ok(true);
                }

                let raised = diesel::update(
                    last_seen_timestamp::table
                        .filter(last_seen_timestamp::conversation_id.eq(&conversation))
                        .filter(last_seen_timestamp::last_seen.lt(timestamp)),
                )
                .set((
                    last_seen_timestamp::last_seen.eq(timestamp),
                    last_seen_timestamp::updated_at.eq(now),
                ))
                .execute(conn)?;
                Ok(raised > 0)
            })
        })
        .await
    }
}

pub struct SqliteCursorStore {
    db_path: Arc<String>,
}

impl SqliteCursorStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn cursor(&self, conversation: &str) -> Result<Option<String>, DatabaseError> {
        let conversation = conversation.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            backfill_cursor::table
                .filter(backfill_cursor::conversation_id.eq(&conversation))
                .select(backfill_cursor::token)
                .first::<String>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn put_cursor(&self, conversation: &str, token: &str) -> Result<(), DatabaseError> {
        let conversation = conversation.to_string();
        let token = token.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            conn.immediate_transaction::<_, DatabaseError, _>(|conn| {
                let now = datetime_to_string(&Utc::now());
                let updated = diesel::update(
                    backfill_cursor::table
                        .filter(backfill_cursor::conversation_id.eq(&conversation)),
                )
                .set((
                    backfill_cursor::token.eq(&token),
                    backfill_cursor::updated_at.eq(&now),
                ))
                .execute(conn)?;

                if updated == 0 {
                    diesel::insert_into(backfill_cursor::table)
                        .values(NewCursor {
                            conversation_id: &conversation,
                            token: &token,
                            updated_at: now,
                        })
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }
}
