//! SQLite event store, schema migrations and the station query engine.

use std::path::PathBuf;
use std::time::Duration;

use bikestat_core::{
    collapse_change_points, format_store_timestamp, parse_store_timestamp, resample_hourly,
    Aggregation, HourlyStats, JsonMap, KnownStation, ModelError, NetworkInfo, Reading, StatPoint,
    StatRecord, StationHistory, StationKey, StationSnapshot, TimeRange,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("schema version {found} is newer than the {supported} migrations this build knows")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// A forward-only schema change. Its position in [`MIGRATIONS`] is its version.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "initial",
        sql: include_str!("../migrations/0001_initial.sql"),
    },
    Migration {
        name: "station_snapshots",
        sql: include_str!("../migrations/0002_station_snapshots.sql"),
    },
    Migration {
        name: "indexes_and_last_stats",
        sql: include_str!("../migrations/0003_indexes_and_last_stats.sql"),
    },
    Migration {
        name: "last_stats_tiebreak",
        sql: include_str!("../migrations/0004_last_stats_tiebreak.sql"),
    },
];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
            max_connections: 8,
        }
    }

    pub fn from_env() -> Self {
        let path = std::env::var("DB_URI").unwrap_or_else(|_| "citybikes.db".to_string());
        let mut config = Self::new(path);
        if let Some(max) = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_connections = max;
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn open_migrated(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self::open(config).await?;
        if let Err(err) = store.migrate().await {
            store.close().await;
            return Err(err);
        }
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let version = sqlx::query_scalar::<_, i64>("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    pub async fn migrate(&self) -> Result<usize, StoreError> {
        self.migrate_with(MIGRATIONS).await
    }

    pub async fn migrate_with(&self, migrations: &[Migration]) -> Result<usize, StoreError> {
        let supported = migrations.len() as i64;
        let current = self.schema_version().await?;
        if current > supported {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported,
            });
        }

        let mut applied = 0;
        for (index, migration) in migrations.iter().enumerate().skip(current as usize) {
            let version = index as i64 + 1;
            if self.apply_migration(version, supported, migration).await? {
                info!(version, name = migration.name, "applied schema migration");
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Run one unit under the write lock. Another process may have migrated
    /// since the version was last read, so it is read again once the lock is
    /// held and the unit is skipped if already applied.
    async fn apply_migration(
        &self,
        version: i64,
        supported: i64,
        migration: &Migration,
    ) -> Result<bool, StoreError> {
        let failure = |source: sqlx::Error| StoreError::Migration {
            version,
            name: migration.name,
            source,
        };

        let mut conn = self.pool.acquire().await.map_err(failure)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(failure)?;

        let outcome = async {
            let current = sqlx::query_scalar::<_, i64>("PRAGMA user_version")
                .fetch_one(&mut *conn)
                .await
                .map_err(failure)?;
            if current > supported {
                return Err(StoreError::UnsupportedSchemaVersion {
                    found: current,
                    supported,
                });
            }
            if current >= version {
                return Ok(false);
            }
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(migration.sql))
                .await
                .map_err(failure)?;
            let bump = format!("PRAGMA user_version = {version}");
            sqlx::query(&bump).execute(&mut *conn).await.map_err(failure)?;
            Ok(true)
        }
        .await;

        match outcome {
            Ok(true) => {
                if let Err(err) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(failure(err));
                }
                Ok(true)
            }
            Ok(false) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Ok(false)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    pub async fn append(
        &self,
        network: &NetworkInfo,
        records: &[StatRecord],
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;

        // Take the write lock up front instead of upgrading a deferred
        // transaction, which can fail with SQLITE_BUSY under contention.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::insert_update(&mut conn, network, records).await {
            Ok(()) => {
                if let Err(err) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(err.into());
                }
                debug!(network = %network.tag, rows = records.len(), "appended station records");
                Ok(())
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    async fn insert_update(
        conn: &mut SqliteConnection,
        network: &NetworkInfo,
        records: &[StatRecord],
    ) -> Result<(), StoreError> {
        let meta = serde_json::to_string(&network.meta)?;
        sqlx::query(
            r#"
            INSERT INTO networks (tag, name, latitude, longitude, meta)
            VALUES (?, ?, ?, ?, json(?))
            ON CONFLICT(tag) DO UPDATE SET
                name = excluded.name,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                meta = excluded.meta
            "#,
        )
        .bind(&network.tag)
        .bind(&network.name)
        .bind(network.latitude)
        .bind(network.longitude)
        .bind(meta)
        .execute(&mut *conn)
        .await?;

        for record in records {
            let station = serde_json::to_string(&record.station)?;
            sqlx::query("INSERT INTO stats (network_tag, station, timestamp) VALUES (?, ?, ?)")
                .bind(&record.network_tag)
                .bind(station)
                .bind(format_store_timestamp(record.timestamp))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    pub async fn network(&self, tag: &str) -> Result<Option<NetworkInfo>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT tag, name, latitude, longitude, CAST(meta AS TEXT) AS meta
              FROM networks
             WHERE tag = ?
            "#,
        )
        .bind(tag)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let meta: Option<String> = row.try_get("meta")?;
        let meta = match meta {
            Some(text) => serde_json::from_str::<JsonMap>(&text)?,
            None => JsonMap::new(),
        };
        Ok(Some(NetworkInfo {
            tag: row.try_get("tag")?,
            name: row.try_get("name")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            meta,
        }))
    }

    pub async fn last_readings(&self) -> Result<Vec<(StationKey, Reading)>, StoreError> {
        let rows = sqlx::query("SELECT network_tag, entity_id, nuid, bikes, free FROM last_stats")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = StationKey::new(
                row.try_get::<String, _>("network_tag")?,
                row.try_get::<String, _>("entity_id")?,
                row.try_get::<Option<String>, _>("nuid")?,
            );
            let reading = Reading::new(row.try_get("bikes")?, row.try_get("free")?);
            out.push((key, reading));
        }
        Ok(out)
    }

    /// Resolve a station by network tag and station id from the last-known
    /// view. When several identities share the id, the most recently seen wins.
    pub async fn find_station(
        &self,
        network_tag: &str,
        station_id: &str,
    ) -> Result<Option<KnownStation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT network_tag, entity_id, nuid, station, timestamp
              FROM last_stats
             WHERE network_tag = ?
               AND entity_id = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(network_tag)
        .bind(station_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let station: StationSnapshot =
            serde_json::from_str(&row.try_get::<String, _>("station")?)?;
        Ok(Some(KnownStation {
            key: StationKey::new(
                row.try_get::<String, _>("network_tag")?,
                row.try_get::<String, _>("entity_id")?,
                row.try_get::<Option<String>, _>("nuid")?,
            ),
            station,
            last_seen: parse_store_timestamp(&row.try_get::<String, _>("timestamp")?)?,
        }))
    }

    pub async fn station_points(
        &self,
        key: &StationKey,
        range: &TimeRange,
    ) -> Result<Vec<StatPoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bikes,
                   free,
                   timestamp,
                   json_extract(station, '$.extra') AS extra
              FROM stats
             WHERE entity_id = ?
               AND network_tag = ?
               AND nuid IS ?
               AND timestamp >= ?
               AND timestamp < ?
             ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(&key.station_id)
        .bind(&key.network_tag)
        .bind(&key.nuid)
        .bind(format_store_timestamp(range.from))
        .bind(format_store_timestamp(range.to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(point_from_row).collect()
    }

    pub async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stats WHERE timestamp < ?")
            .bind(format_store_timestamp(cutoff))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn delete_oldest_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM stats
             WHERE id IN (
                SELECT id FROM stats
                 WHERE timestamp < ?
                 ORDER BY timestamp ASC
                 LIMIT ?
             )
            "#,
        )
        .bind(format_store_timestamp(cutoff))
        .bind(i64::from(limit))
        .execute(&mut *conn)
        .await;

        match deleted {
            Ok(result) => {
                if let Err(err) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(err.into());
                }
                Ok(result.rows_affected())
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err.into())
            }
        }
    }
}

fn point_from_row(row: &SqliteRow) -> Result<StatPoint, StoreError> {
    let extra = match row.try_get::<Option<String>, _>("extra")? {
        Some(text) => serde_json::from_str::<JsonMap>(&text)?,
        None => JsonMap::new(),
    };
    Ok(StatPoint {
        bikes: row.try_get("bikes")?,
        free: row.try_get("free")?,
        timestamp: parse_store_timestamp(&row.try_get::<String, _>("timestamp")?)?,
        extra,
    })
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("station {station_id} not found in network {network_tag}")]
    NotFound {
        network_tag: String,
        station_id: String,
    },
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("unsupported aggregation `{0}`")]
    UnsupportedAggregation(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<ModelError> for QueryError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidRange(msg) => Self::InvalidRange(msg),
            ModelError::InvalidTimestamp(raw) => {
                Self::InvalidRange(format!("unparsable timestamp {raw}"))
            }
            ModelError::UnsupportedAggregation(agg) => Self::UnsupportedAggregation(agg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: Store,
}

impl QueryEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get_history(
        &self,
        network_tag: &str,
        station_id: &str,
        range: TimeRange,
    ) -> Result<StationHistory, QueryError> {
        let known = self.resolve(network_tag, station_id).await?;
        let points = self.store.station_points(&known.key, &range).await?;
        let stats = collapse_change_points(points);
        Ok(StationHistory {
            id: known.station.id,
            latitude: known.station.latitude,
            longitude: known.station.longitude,
            name: known.station.name,
            stats,
        })
    }

    pub async fn get_hourly_stats(
        &self,
        network_tag: &str,
        station_id: &str,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<HourlyStats, QueryError> {
        let known = self.resolve(network_tag, station_id).await?;
        let points = self.store.station_points(&known.key, &range).await?;
        let stats = match aggregation {
            Aggregation::Hourly => resample_hourly(&points),
        };
        Ok(HourlyStats {
            id: known.station.id,
            latitude: known.station.latitude,
            longitude: known.station.longitude,
            stats,
        })
    }

    async fn resolve(
        &self,
        network_tag: &str,
        station_id: &str,
    ) -> Result<KnownStation, QueryError> {
        self.store
            .find_station(network_tag, station_id)
            .await?
            .ok_or_else(|| QueryError::NotFound {
                network_tag: network_tag.to_string(),
                station_id: station_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bikestat_core::Summary;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    async fn test_store() -> (TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open_migrated(&StoreConfig::new(dir.path().join("stats.db")))
            .await
            .expect("open store");
        (dir, store)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).single().unwrap()
    }

    fn snapshot(id: &str, nuid: Option<&str>, bikes: i64, free: i64) -> StationSnapshot {
        let mut extra = JsonMap::new();
        extra.insert("ebikes".into(), serde_json::json!(bikes / 2));
        StationSnapshot {
            id: id.to_string(),
            nuid: nuid.map(ToString::to_string),
            name: format!("Station {id}"),
            latitude: 41.38,
            longitude: 2.17,
            bikes,
            free,
            extra,
        }
    }

    fn network(tag: &str) -> NetworkInfo {
        NetworkInfo {
            tag: tag.to_string(),
            name: Some("Bicing".into()),
            latitude: Some(41.3),
            longitude: Some(2.1),
            meta: JsonMap::new(),
        }
    }

    async fn seed(store: &Store, tag: &str, id: &str, readings: &[(DateTime<Utc>, i64, i64)]) {
        let records = readings
            .iter()
            .map(|(ts, bikes, free)| StatRecord::new(tag, snapshot(id, None, *bikes, *free), *ts))
            .collect::<Vec<_>>();
        store.append(&network(tag), &records).await.expect("append");
    }

    fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> TimeRange {
        TimeRange::new(from, to).unwrap()
    }

    async fn table_exists(store: &Store, name: &str) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sqlite_master WHERE name = ?")
            .bind(name)
            .fetch_one(&store.pool)
            .await
            .unwrap()
            > 0
    }

    #[tokio::test]
    async fn migrations_apply_once_and_track_version() {
        let (_dir, store) = test_store().await;
        assert_eq!(store.schema_version().await.unwrap(), MIGRATIONS.len() as i64);
        assert_eq!(store.migrate().await.unwrap(), 0);
        assert!(table_exists(&store, "last_stats").await);
        assert!(!table_exists(&store, "stations").await);
    }

    #[tokio::test]
    async fn failed_migration_rolls_back_and_stops() {
        let dir = tempdir().unwrap();
        let store = Store::open(&StoreConfig::new(dir.path().join("broken.db"))).await.unwrap();
        let units = [
            Migration {
                name: "create_a",
                sql: "CREATE TABLE a (x INTEGER);",
            },
            Migration {
                name: "broken",
                sql: "CREATE TABLE b (x INTEGER); INSERT INTO nowhere VALUES (1);",
            },
            Migration {
                name: "create_c",
                sql: "CREATE TABLE c (x INTEGER);",
            },
        ];

        let err = store.migrate_with(&units).await.unwrap_err();
        assert!(matches!(err, StoreError::Migration { version: 2, name: "broken", .. }));
        assert_eq!(store.schema_version().await.unwrap(), 1);
        assert!(table_exists(&store, "a").await);
        assert!(!table_exists(&store, "b").await);
        assert!(!table_exists(&store, "c").await);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let (_dir, store) = test_store().await;
        sqlx::query("PRAGMA user_version = 99").execute(&store.pool).await.unwrap();
        assert!(matches!(
            store.migrate().await,
            Err(StoreError::UnsupportedSchemaVersion { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn legacy_rows_are_backfilled_into_snapshots() {
        let dir = tempdir().unwrap();
        let store = Store::open(&StoreConfig::new(dir.path().join("legacy.db"))).await.unwrap();
        store.migrate_with(&MIGRATIONS[..1]).await.unwrap();
        sqlx::raw_sql(
            r#"
            INSERT INTO stations (hash, name, latitude, longitude, network_tag)
            VALUES ('s1', 'Pl. Catalunya', 41.38, 2.17, 'bicing');
            INSERT INTO stats (entity_id, network_tag, stat, latitude, longitude, timestamp)
            VALUES ('s1', 'bicing', json('{"bikes": 5, "free": 2, "extra": {"ebikes": 1}}'), 41.38, 2.17, '2024-05-01 10:00:00'),
                   ('s1', 'bicing', json('{"bikes": 3, "free": 4, "extra": {"ebikes": 0}}'), 41.38, 2.17, '2024-05-01 10:30:00');
            "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();

        assert_eq!(store.migrate().await.unwrap(), 3);

        let history = QueryEngine::new(store.clone())
            .get_history("bicing", "s1", range(at(0, 0), at(23, 0)))
            .await
            .unwrap();
        assert_eq!(history.name, "Pl. Catalunya");
        assert_eq!(history.stats.len(), 2);
        assert_eq!(history.stats[0].timestamp, at(10, 0));
        assert_eq!(history.stats[0].extra["ebikes"], 1);
        assert_eq!(history.stats[1].reading(), Reading::new(3, 4));
    }

    #[tokio::test]
    async fn derived_columns_follow_the_snapshot() {
        let (_dir, store) = test_store().await;
        let record = StatRecord::new("bicing", snapshot("s9", Some("77"), 6, 1), at(9, 0));
        store.append(&network("bicing"), &[record]).await.unwrap();

        let row = sqlx::query("SELECT entity_id, nuid, name, bikes, free, latitude FROM stats")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("entity_id"), "s9");
        assert_eq!(row.get::<Option<String>, _>("nuid").as_deref(), Some("77"));
        assert_eq!(row.get::<String, _>("name"), "Station s9");
        assert_eq!(row.get::<i64, _>("bikes"), 6);
        assert_eq!(row.get::<i64, _>("free"), 1);
        assert_eq!(row.get::<f64, _>("latitude"), 41.38);

        let info = store.network("bicing").await.unwrap().unwrap();
        assert_eq!(info.name.as_deref(), Some("Bicing"));
    }

    #[tokio::test]
    async fn append_is_all_or_nothing() {
        let (_dir, store) = test_store().await;
        sqlx::raw_sql(
            r#"
            CREATE TRIGGER reject_poison BEFORE INSERT ON stats
            WHEN json_extract(NEW.station, '$.id') = 'poison'
            BEGIN SELECT RAISE(ABORT, 'poisoned snapshot'); END;
            "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let records = vec![
            StatRecord::new("bicing", snapshot("ok", None, 1, 1), at(9, 0)),
            StatRecord::new("bicing", snapshot("poison", None, 1, 1), at(9, 0)),
        ];
        assert!(store.append(&network("bicing"), &records).await.is_err());
        assert_eq!(store.count_older_than(at(23, 0)).await.unwrap(), 0);
        assert!(store.network("bicing").await.unwrap().is_none());

        // The connection must be usable again after the rollback.
        seed(&store, "bicing", "ok", &[(at(9, 0), 1, 1)]).await;
        assert_eq!(store.count_older_than(at(23, 0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn last_readings_report_latest_row_per_identity() {
        let (_dir, store) = test_store().await;
        seed(&store, "bicing", "a", &[(at(9, 0), 1, 9), (at(10, 0), 2, 8)]).await;
        seed(&store, "velib", "a", &[(at(8, 0), 5, 5)]).await;
        let with_nuid = StatRecord::new("bicing", snapshot("a", Some("n1"), 7, 3), at(7, 0));
        store.append(&network("bicing"), &[with_nuid]).await.unwrap();

        let mut readings = store.last_readings().await.unwrap();
        readings.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            readings,
            vec![
                (StationKey::new("bicing", "a", None), Reading::new(2, 8)),
                (StationKey::new("velib", "a", None), Reading::new(5, 5)),
                (StationKey::new("bicing", "a", Some("n1".into())), Reading::new(7, 3)),
            ]
        );
    }

    #[tokio::test]
    async fn same_timestamp_readings_resolve_to_the_last_inserted() {
        let (_dir, store) = test_store().await;
        seed(&store, "bicing", "a", &[(at(9, 0), 1, 1), (at(9, 0), 2, 2)]).await;

        let readings = store.last_readings().await.unwrap();
        assert_eq!(
            readings,
            vec![(StationKey::new("bicing", "a", None), Reading::new(2, 2))]
        );
        let known = store.find_station("bicing", "a").await.unwrap().unwrap();
        assert_eq!(known.station.reading(), Reading::new(2, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_migrations_apply_each_unit_once() {
        for round in 0..10 {
            let dir = tempdir().unwrap();
            let config = StoreConfig::new(dir.path().join(format!("race-{round}.db")));
            let a = Store::open(&config).await.unwrap();
            let b = Store::open(&config).await.unwrap();

            let first = tokio::spawn({
                let a = a.clone();
                async move { a.migrate().await }
            });
            let second = tokio::spawn({
                let b = b.clone();
                async move { b.migrate().await }
            });
            let applied = first.await.unwrap().unwrap() + second.await.unwrap().unwrap();

            assert_eq!(applied, MIGRATIONS.len(), "round {round}");
            assert_eq!(a.schema_version().await.unwrap(), MIGRATIONS.len() as i64);
            assert!(table_exists(&a, "last_stats").await);
            assert!(!table_exists(&a, "stations").await);
            assert_eq!(b.migrate().await.unwrap(), 0);
            a.close().await;
            b.close().await;
        }
    }

    #[tokio::test]
    async fn readers_do_not_wait_for_an_open_write_transaction() {
        let (_dir, store) = test_store().await;
        seed(&store, "bicing", "s1", &[(at(9, 0), 1, 1)]).await;

        let mut writer = store.pool.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *writer).await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO stats (network_tag, station, timestamp)
            VALUES ('bicing',
                    json_object('id', 's1', 'name', 'S1', 'latitude', 0.0, 'longitude', 0.0,
                                'bikes', 9, 'free', 9, 'extra', json('{}')),
                    '2024-05-01 10:30:00.000000')
            "#,
        )
        .execute(&mut *writer)
        .await
        .unwrap();

        let engine = QueryEngine::new(store.clone());
        let history = tokio::time::timeout(
            Duration::from_millis(500),
            engine.get_history("bicing", "s1", range(at(0, 0), at(23, 0))),
        )
        .await
        .expect("read finished while the write lock was held")
        .unwrap();
        assert_eq!(history.stats.len(), 1);

        sqlx::query("ROLLBACK").execute(&mut *writer).await.unwrap();
    }

    #[tokio::test]
    async fn history_collapses_repeated_readings() {
        let (_dir, store) = test_store().await;
        seed(
            &store,
            "bicing",
            "s1",
            &[
                (at(10, 0), 5, 2),
                (at(10, 1), 5, 2),
                (at(10, 2), 3, 4),
                (at(10, 3), 3, 4),
                (at(10, 4), 3, 4),
            ],
        )
        .await;

        let history = QueryEngine::new(store)
            .get_history("bicing", "s1", range(at(0, 0), at(23, 0)))
            .await
            .unwrap();
        let got = history
            .stats
            .iter()
            .map(|p| (p.bikes, p.free, p.timestamp))
            .collect::<Vec<_>>();
        assert_eq!(got, vec![(5, 2, at(10, 0)), (3, 4, at(10, 2))]);
        assert_eq!(history.id, "s1");
        assert_eq!(history.name, "Station s1");
    }

    #[tokio::test]
    async fn history_window_keeps_first_record_and_excludes_end() {
        let (_dir, store) = test_store().await;
        seed(
            &store,
            "bicing",
            "s1",
            &[(at(9, 59), 4, 4), (at(10, 0), 4, 4), (at(10, 30), 1, 7), (at(11, 0), 2, 6)],
        )
        .await;

        let history = QueryEngine::new(store)
            .get_history("bicing", "s1", range(at(10, 0), at(11, 0)))
            .await
            .unwrap();
        let got = history.stats.iter().map(|p| p.timestamp).collect::<Vec<_>>();
        assert_eq!(got, vec![at(10, 0), at(10, 30)]);
    }

    #[tokio::test]
    async fn history_is_scoped_to_the_resolved_identity() {
        let (_dir, store) = test_store().await;
        seed(&store, "bicing", "s1", &[(at(9, 0), 1, 1)]).await;
        let other = StatRecord::new("bicing", snapshot("s1", Some("n2"), 8, 8), at(10, 0));
        store.append(&network("bicing"), &[other]).await.unwrap();

        let history = QueryEngine::new(store)
            .get_history("bicing", "s1", range(at(0, 0), at(23, 0)))
            .await
            .unwrap();
        assert_eq!(history.stats.len(), 1);
        assert_eq!(history.stats[0].reading(), Reading::new(8, 8));
    }

    #[tokio::test]
    async fn hourly_stats_use_last_value_per_hour() {
        let (_dir, store) = test_store().await;
        seed(
            &store,
            "bicing",
            "s1",
            &[(at(10, 5), 4, 6), (at(10, 50), 6, 4), (at(11, 10), 2, 8)],
        )
        .await;

        let hourly = QueryEngine::new(store)
            .get_hourly_stats("bicing", "s1", range(at(0, 0), at(23, 0)), Aggregation::Hourly)
            .await
            .unwrap();
        assert_eq!(hourly.stats.len(), 2);
        assert_eq!(hourly.stats[0].timestamp, at(10, 0));
        assert_eq!(hourly.stats[0].bikes, Summary { avg: 6.0, max: 6, min: 6 });
        assert_eq!(hourly.stats[0].free, Summary { avg: 4.0, max: 4, min: 4 });
        assert_eq!(hourly.stats[1].timestamp, at(11, 0));
        assert_eq!(hourly.stats[1].bikes, Summary { avg: 2.0, max: 2, min: 2 });
        assert_eq!(hourly.stats[1].free, Summary { avg: 8.0, max: 8, min: 8 });
    }

    #[tokio::test]
    async fn unknown_station_is_not_found() {
        let (_dir, store) = test_store().await;
        seed(&store, "bicing", "s1", &[(at(9, 0), 1, 1)]).await;
        let engine = QueryEngine::new(store);

        let err = engine
            .get_history("bicing", "missing", range(at(0, 0), at(23, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NotFound { .. }));

        let err = engine
            .get_hourly_stats("velib", "s1", range(at(0, 0), at(23, 0)), Aggregation::Hourly)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn batched_deletes_remove_oldest_rows_first() {
        let (_dir, store) = test_store().await;
        seed(
            &store,
            "bicing",
            "s1",
            &[(at(1, 0), 1, 1), (at(2, 0), 2, 2), (at(3, 0), 3, 3), (at(12, 0), 4, 4)],
        )
        .await;

        let cutoff = at(6, 0);
        assert_eq!(store.count_older_than(cutoff).await.unwrap(), 3);
        assert_eq!(store.delete_oldest_before(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.count_older_than(at(2, 30)).await.unwrap(), 0);
        assert_eq!(store.delete_oldest_before(cutoff, 2).await.unwrap(), 1);
        assert_eq!(store.delete_oldest_before(cutoff, 2).await.unwrap(), 0);
        assert_eq!(store.count_older_than(at(23, 0)).await.unwrap(), 1);
    }

    #[test]
    fn model_errors_map_to_query_errors() {
        assert!(matches!(
            QueryError::from(ModelError::InvalidRange("missing `from`".into())),
            QueryError::InvalidRange(_)
        ));
        assert!(matches!(
            QueryError::from(ModelError::UnsupportedAggregation("daily".into())),
            QueryError::UnsupportedAggregation(a) if a == "daily"
        ));
    }
}
