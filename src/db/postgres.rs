use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::Pool;
use crate::db::schema::{backfill_cursor, last_seen_timestamp, registered_bridges, synced_messages};

use super::{
    DatabaseError,
    models::{MappingEntry, MappingKind, SyncedOrigin, mirror_key, synced_key},
    stores::{CursorStore, MappingStore, SyncedMessageStore, WatermarkStore},
};

const SIDE_A: &str = "a";
const SIDE_B: &str = "b";

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = registered_bridges)]
struct DbBridgeRow {
    map_key: String,
    map_value: String,
    parent: Option<String>,
    created_at: DateTime<Utc>,
}

impl DbBridgeRow {
    fn into_mapping_entry(self, kind: MappingKind) -> MappingEntry {
        let prefix = format!("{}:", kind.prefixes().0);
        MappingEntry {
            kind,
            key_a: self
                .map_key
                .strip_prefix(&prefix)
                .unwrap_or(&self.map_key)
                .to_string(),
            key_b: self.map_value,
            parent: self.parent,
            created_at: self.created_at,
        }
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
    created_at: &'a DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = synced_messages)]
struct NewSyncedRow<'a> {
    map_key: &'a str,
    scope: &'a str,
    message_id: &'a str,
    mirror_id: &'a str,
    created_at: &'a DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = last_seen_timestamp)]
struct NewWatermark<'a> {
    conversation_id: &'a str,
    last_seen: i64,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = backfill_cursor)]
struct NewCursor<'a> {
    conversation_id: &'a str,
    token: &'a str,
    updated_at: &'a DateTime<Utc>,
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct PostgresMappingStore {
    pool: Pool,
    kind: MappingKind,
}

impl PostgresMappingStore {
    pub fn new(pool: Pool, kind: MappingKind) -> Self {
        Self { pool, kind }
    }

    async fn lookup(&self, key: String) -> Result<Option<String>, DatabaseError> {
        with_connection(self.pool.clone(), move |conn| {
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
impl MappingStore for PostgresMappingStore {
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
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
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

                let now = Utc::now();
                let rows = [
                    NewBridgeRow {
                        map_key: &forward,
                        map_value: &key_b,
                        namespace: kind.name(),
                        side: SIDE_A,
                        parent: parent.as_deref(),
                        created_at: &now,
                    },
                    NewBridgeRow {
                        map_key: &reverse,
                        map_value: &key_a,
                        namespace: kind.name(),
                        side: SIDE_B,
                        parent: parent.as_deref(),
                        created_at: &now,
                    },
                ];
                diesel::insert_into(registered_bridges::table)
                    .values(&rows[..])
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
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                let forward = kind.forward_key(&key_a);
                let reverse = kind.reverse_key(&key_b);

                let stored_b = registered_bridges::table
                    .filter(registered_bridges::map_key.eq(&forward))
                    .select(registered_bridges::map_value)
                    .for_update()
                    .first::<String>(conn)
                    .optional()?;
                let stored_a = registered_bridges::table
                    .filter(registered_bridges::map_key.eq(&reverse))
                    .select(registered_bridges::map_value)
                    .for_update()
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
        with_connection(self.pool.clone(), move |conn| {
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
        with_connection(self.pool.clone(), move |conn| {
            registered_bridges::table
                .filter(registered_bridges::namespace.eq(kind.name()))
                .filter(registered_bridges::side.eq(SIDE_A))
                .order(registered_bridges::created_at.asc())
                .select(DbBridgeRow::as_select())
                .load::<DbBridgeRow>(conn)
                .map(|rows| {
                    rows.into_iter()
                        .map(|row| row.into_mapping_entry(kind))
                        .collect()
                })
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresSyncedMessageStore {
    pool: Pool,
}

impl PostgresSyncedMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncedMessageStore for PostgresSyncedMessageStore {
    async fn mirror_of(
        &self,
        scope: &str,
        message_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let key = synced_key(scope, message_id);
        with_connection(self.pool.clone(), move |conn| {
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
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
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

                let now = Utc::now();
                let rows = [
                    NewSyncedRow {
                        map_key: &forward,
                        scope: &scope,
                        message_id: &message_id,
                        mirror_id: &mirror_id,
                        created_at: &now,
                    },
                    NewSyncedRow {
                        map_key: &reverse,
                        scope: &scope,
                        message_id: &message_id,
                        mirror_id: &mirror_id,
                        created_at: &now,
                    },
                ];
                diesel::insert_into(synced_messages::table)
                    .values(&rows[..])
                    .execute(conn)?;
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
        with_connection(self.pool.clone(), move |conn| {
            let key = synced_key(&scope, &remote_id);
            let now = Utc::now();
            diesel::insert_into(synced_messages::table)
                .values(NewSyncedRow {
                    map_key: &key,
                    scope: &scope,
                    message_id: &remote_id,
                    mirror_id: &mirror_id,
                    created_at: &now,
                })
                .on_conflict(synced_messages::map_key)
                .do_nothing()
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn origin_of(&self, mirror_id: &str) -> Result<Option<SyncedOrigin>, DatabaseError> {
        let key = mirror_key(mirror_id);
        with_connection(self.pool.clone(), move |conn| {
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

pub struct PostgresWatermarkStore {
    pool: Pool,
}

impl PostgresWatermarkStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    async fn last_seen(&self, conversation: &str) -> Result<Option<i64>, DatabaseError> {
        let conversation = conversation.to_string();
        with_connection(self.pool.clone(), move |conn| {
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
        with_connection(self.pool.clone(), move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                let now = Utc::now();
                let inserted = diesel::insert_into(last_seen_timestamp::table)
                    .values(NewWatermark {
                        conversation_id: &conversation,
                        last_seen: timestamp,
                        updated_at: &now,
                    })
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                if inserted > 0 {
                    return Ok(true);
                }

                // The row exists, possibly from a concurrent first advance. Only raise it.
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

pub struct PostgresCursorStore {
    pool: Pool,
}

impl PostgresCursorStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PostgresCursorStore {
    async fn cursor(&self, conversation: &str) -> Result<Option<String>, DatabaseError> {
        let conversation = conversation.to_string();
        with_connection(self.pool.clone(), move |conn| {
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
        with_connection(self.pool.clone(), move |conn| {
            let now = Utc::now();
            diesel::insert_into(backfill_cursor::table)
                .values(NewCursor {
                    conversation_id: &conversation,
                    token: &token,
                    updated_at: &now,
                })
                .on_conflict(backfill_cursor::conversation_id)
                .do_update()
                .set((
                    backfill_cursor::token.eq(&token),
                    backfill_cursor::updated_at.eq(&now),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}
