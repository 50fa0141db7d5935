use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{
    CursorStore, DatabaseError, MappingKind, MappingStore, SyncedMessageStore, WatermarkStore,
};
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresCursorStore, PostgresMappingStore, PostgresSyncedMessageStore,
    PostgresWatermarkStore,
};
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteCursorStore, SqliteMappingStore, SqliteSyncedMessageStore, SqliteWatermarkStore,
    establish_connection,
};

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    mapping_stores: HashMap<MappingKind, Arc<dyn MappingStore>>,
    synced_store: Arc<dyn SyncedMessageStore>,
    watermark_store: Arc<dyn WatermarkStore>,
    cursor_store: Arc<dyn CursorStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                let mapping_stores = MappingKind::ALL
                    .into_iter()
                    .map(|kind| {
                        let store: Arc<dyn MappingStore> =
                            Arc::new(PostgresMappingStore::new(pool.clone(), kind));
                        (kind, store)
                    })
                    .collect();

                Ok(Self {
                    synced_store: Arc::new(PostgresSyncedMessageStore::new(pool.clone())),
                    watermark_store: Arc::new(PostgresWatermarkStore::new(pool.clone())),
                    cursor_store: Arc::new(PostgresCursorStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    mapping_stores,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path is not configured".to_string())
                })?;
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            DatabaseError::Connection(format!(
                                "failed to create data directory {}: {e}",
                                parent.display()
                            ))
                        })?;
                    }
                }
                let path_arc = Arc::new(path.clone());

                let mapping_stores = MappingKind::ALL
                    .into_iter()
                    .map(|kind| {
                        let store: Arc<dyn MappingStore> =
                            Arc::new(SqliteMappingStore::new(path_arc.clone(), kind));
                        (kind, store)
                    })
                    .collect();

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    mapping_stores,
                    synced_store: Arc::new(SqliteSyncedMessageStore::new(path_arc.clone())),
                    watermark_store: Arc::new(SqliteWatermarkStore::new(path_arc.clone())),
                    cursor_store: Arc::new(SqliteCursorStore::new(path_arc)),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool is not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path is not initialized".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS registered_bridges (
                    map_key TEXT PRIMARY KEY,
                    map_value TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    side TEXT NOT NULL,
                    parent TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS synced_messages (
                    map_key TEXT PRIMARY KEY,
                    scope TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    mirror_id TEXT NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS last_seen_timestamp (
                    conversation_id TEXT PRIMARY KEY,
                    last_seen BIGINT NOT NULL,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS backfill_cursor (
                    conversation_id TEXT PRIMARY KEY,
                    token TEXT NOT NULL,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_registered_bridges_namespace ON registered_bridges(namespace, side)",
                "CREATE INDEX IF NOT EXISTS idx_registered_bridges_parent ON registered_bridges(parent)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        use diesel::RunQueryDsl;
        use diesel::connection::SimpleConnection;

        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&path)?;
            conn.batch_execute("PRAGMA journal_mode = WAL;")
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS registered_bridges (
                    map_key TEXT PRIMARY KEY NOT NULL,
                    map_value TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    side TEXT NOT NULL,
                    parent TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS synced_messages (
                    map_key TEXT PRIMARY KEY NOT NULL,
                    scope TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    mirror_id TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS last_seen_timestamp (
                    conversation_id TEXT PRIMARY KEY NOT NULL,
                    last_seen BIGINT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS backfill_cursor (
                    conversation_id TEXT PRIMARY KEY NOT NULL,
                    token TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_registered_bridges_namespace ON registered_bridges(namespace, side)",
                "CREATE INDEX IF NOT EXISTS idx_registered_bridges_parent ON registered_bridges(parent)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn mapping_store(&self, kind: MappingKind) -> Arc<dyn MappingStore> {
        // every kind is populated in `new`
        self.mapping_stores[&kind].clone()
    }

    pub fn synced_store(&self) -> Arc<dyn SyncedMessageStore> {
        self.synced_store.clone()
    }

    pub fn watermark_store(&self) -> Arc<dyn WatermarkStore> {
        self.watermark_store.clone()
    }

    pub fn cursor_store(&self) -> Arc<dyn CursorStore> {
        self.cursor_store.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::DatabaseConfig;
    use crate::db::{DatabaseError, MappingKind};

    pub(crate) async fn sqlite_manager(file: &NamedTempFile) -> DatabaseManager {
        let config = DatabaseConfig {
            url: None,
            filename: Some(file.path().to_string_lossy().to_string()),
            data_dir: String::new(),
            max_connections: Some(1),
            min_connections: Some(1),
        };

        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        manager
    }

    #[tokio::test]
    async fn mapping_roundtrip_in_both_directions() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.mapping_store(MappingKind::GuildSpace);

        store.register("G1", "S1", None).await.expect("register");

        assert_eq!(store.lookup_by_a("G1").await.unwrap().as_deref(), Some("S1"));
        assert_eq!(store.lookup_by_b("S1").await.unwrap().as_deref(), Some("G1"));
        assert!(store.lookup_by_a("S1").await.unwrap().is_none());

        let entries = store.list_entries().await.expect("list entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key_a, "G1");
        assert_eq!(entries[0].key_b, "S1");
    }

    #[tokio::test]
    async fn registering_either_side_twice_fails() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.mapping_store(MappingKind::GuildSpace);

        store.register("a", "b", None).await.expect("register");

        assert!(matches!(
            store.register("a", "c", None).await,
            Err(DatabaseError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            store.register("c", "b", None).await,
            Err(DatabaseError::AlreadyRegistered(_))
        ));
        assert!(store.lookup_by_a("c").await.unwrap().is_none());
        assert_eq!(store.lookup_by_b("b").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;

        manager
            .mapping_store(MappingKind::GuildSpace)
            .register("123", "S1", None)
            .await
            .expect("guild mapping");
        manager
            .mapping_store(MappingKind::MatrixSpace)
            .register("!space:example.org", "S1", None)
            .await
            .expect("matrix space may share the space id");

        assert!(
            manager
                .mapping_store(MappingKind::ChannelThread)
                .lookup_by_a("123")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unregister_requires_the_exact_pair() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.mapping_store(MappingKind::GuildSpace);

        store.register("G1", "S1", None).await.expect("register");

        assert!(matches!(
            store.unregister("G1", "S2").await,
            Err(DatabaseError::NotRegistered(_))
        ));
        assert_eq!(store.lookup_by_a("G1").await.unwrap().as_deref(), Some("S1"));
        assert_eq!(store.lookup_by_b("S1").await.unwrap().as_deref(), Some("G1"));

        store.unregister("G1", "S1").await.expect("unregister");
        assert!(store.lookup_by_a("G1").await.unwrap().is_none());
        assert!(store.lookup_by_b("S1").await.unwrap().is_none());

        assert!(matches!(
            store.unregister("G1", "S1").await,
            Err(DatabaseError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn children_are_listed_by_parent() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.mapping_store(MappingKind::ChannelThread);

        store.register("c1", "t1", Some("S1")).await.unwrap();
        store.register("c2", "t2", Some("S1")).await.unwrap();
        store.register("c3", "t3", Some("S2")).await.unwrap();

        let mut children = store.list_children("S1").await.expect("children");
        children.sort();
        assert_eq!(children, vec!["t1".to_string(), "t2".to_string()]);
        assert!(store.list_children("S9").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_do_not_hit_lock_errors() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let watermarks = manager.watermark_store();

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..16_i64 {
            let watermarks = watermarks.clone();
            tasks.spawn(async move {
                for step in 1..=25_i64 {
                    watermarks.advance(&format!("conv-{worker}"), step).await?;
                    watermarks.advance("shared", worker * 100 + step).await?;
                }
                Ok::<_, DatabaseError>(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task").expect("advance without lock errors");
        }

        assert_eq!(watermarks.last_seen("conv-7").await.unwrap(), Some(25));
        assert_eq!(watermarks.last_seen("shared").await.unwrap(), Some(1525));
    }

    #[tokio::test]
    async fn watermark_keeps_the_maximum() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let watermarks = manager.watermark_store();

        assert!(watermarks.last_seen("conv").await.unwrap().is_none());
        assert!(watermarks.advance("conv", 50).await.unwrap());
        assert!(!watermarks.advance("conv", 10).await.unwrap());
        assert!(!watermarks.advance("conv", 50).await.unwrap());
        assert!(watermarks.advance("conv", 70).await.unwrap());
        assert!(!watermarks.advance("conv", 60).await.unwrap());

        assert_eq!(watermarks.last_seen("conv").await.unwrap(), Some(70));
        assert!(watermarks.last_seen("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cursor_is_overwritten_and_survives_reopen() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;

        manager.cursor_store().put_cursor("c", "100").await.unwrap();
        manager.cursor_store().put_cursor("c", "200").await.unwrap();

        let reopened = sqlite_manager(&file).await;
        assert_eq!(
            reopened.cursor_store().cursor("c").await.unwrap().as_deref(),
            Some("200")
        );
    }

    #[tokio::test]
    async fn synced_messages_are_insert_once() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let synced = manager.synced_store();

        synced.record("discord>space", "m1", "mirror-1").await.unwrap();
        assert!(matches!(
            synced.record("discord>space", "m1", "mirror-2").await,
            Err(DatabaseError::AlreadyRegistered(_))
        ));
        assert_eq!(
            synced.mirror_of("discord>space", "m1").await.unwrap().as_deref(),
            Some("mirror-1")
        );
        assert!(synced.mirror_of("matrix>space", "m1").await.unwrap().is_none());

        let origin = synced.origin_of("mirror-1").await.unwrap().expect("origin");
        assert_eq!(origin.scope, "discord>space");
        assert_eq!(origin.message_id, "m1");

        synced.record_delivery("space>discord", "r1", "mirror-1").await.unwrap();
        synced.record_delivery("space>discord", "r1", "mirror-1").await.unwrap();
        assert_eq!(
            synced.mirror_of("space>discord", "r1").await.unwrap().as_deref(),
            Some("mirror-1")
        );
    }
}
