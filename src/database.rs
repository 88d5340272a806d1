//! SQLite store of validated proxies
//!
//! The unique index on `(server, port)` is the only thing deduplicating
//! proxies: concurrent creates race on the index, not on a client-side lock.

use crate::models::{CountryCount, ProxyOrder, ProxyQuery, StoredProxy, Summary, TypeCount};
use crate::proxy::models::ValidationRecord;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Error, QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECTIONS: u32 = 8;
const CREATE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct ProxyDatabase {
    pool: SqlitePool,
}

impl ProxyDatabase {
    /// Open (creating if needed) the database file at `path`
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        debug!(path = %path.display(), "opened proxy database");
        Ok(db)
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // every connection would get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS proxies (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    type TEXT NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    source TEXT NOT NULL DEFAULT '',
                    server TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    config TEXT NOT NULL,
                    country TEXT NOT NULL DEFAULT '',
                    country_code TEXT NOT NULL DEFAULT '',
                    delay INTEGER NOT NULL DEFAULT 0
                )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_server_port ON proxies (server, port)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_delay ON proxies (delay)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert a validated proxy unless `(server, port)` is already stored
    ///
    /// Returns the stored row and whether this call inserted it. When the
    /// key exists the earlier row wins and is returned unchanged. If that row
    /// is deleted between the skipped insert and the read-back, the insert is
    /// tried once more.
    pub async fn create(&self, record: &ValidationRecord) -> Result<(StoredProxy, bool), Error> {
        let descriptor = &record.descriptor;
        let header = descriptor.header();
        let config = descriptor
            .config_map()
            .map_err(|e| Error::Encode(Box::new(e)))?;
        let config = serde_json::to_string(&config).map_err(|e| Error::Encode(Box::new(e)))?;

        for _ in 0..CREATE_ATTEMPTS {
            if let Some(proxy) = self.insert(record, &config).await? {
                return Ok((proxy, true));
            }
            if let Some(existing) = self.find_endpoint(&header.server, header.port).await? {
                return Ok((existing, false));
            }
            debug!(server = %header.server, port = header.port, "stored row vanished, retrying insert");
        }

        Err(Error::RowNotFound)
    }

    async fn insert(&self, record: &ValidationRecord, config: &str) -> Result<Option<StoredProxy>, Error> {
        let descriptor = &record.descriptor;
        let header = descriptor.header();
        let now = Utc::now();

        sqlx::query_as::<_, StoredProxy>(
            r#"
                INSERT INTO proxies
                    (created_at, updated_at, type, name, source, server, port, config, country, country_code, delay)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (server, port) DO NOTHING
                RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(descriptor.kind().as_str())
        .bind(&header.name)
        .bind(&header.source)
        .bind(&header.server)
        .bind(i64::from(header.port))
        .bind(config)
        .bind(&record.country.name)
        .bind(&record.country.code)
        .bind(i64::from(record.delay))
        .fetch_optional(&self.pool)
        .await
    }

    /// The row stored for `server:port`, if any
    pub async fn find_endpoint(&self, server: &str, port: u16) -> Result<Option<StoredProxy>, Error> {
        sqlx::query_as::<_, StoredProxy>("SELECT * FROM proxies WHERE server = ? AND port = ?")
            .bind(server)
            .bind(i64::from(port))
            .fetch_optional(&self.pool)
            .await
    }

    /// Persist delay and country of `proxy`; the config blob is never touched
    pub async fn update(&self, proxy: &StoredProxy) -> Result<(), Error> {
        sqlx::query(
            r#"
                UPDATE proxies
                SET delay = ?, country = ?, country_code = ?, updated_at = ?
                WHERE id = ?
            "#,
        )
        .bind(i64::from(proxy.delay))
        .bind(&proxy.country)
        .bind(&proxy.country_code)
        .bind(Utc::now())
        .bind(proxy.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a proxy, returning whether a row was removed
    pub async fn remove(&self, id: i64) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM proxies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_proxy(&self, id: i64) -> Result<Option<StoredProxy>, Error> {
        sqlx::query_as::<_, StoredProxy>("SELECT * FROM proxies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List proxies matching `query`
    pub async fn get_proxies(&self, query: &ProxyQuery) -> Result<Vec<StoredProxy>, Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM proxies WHERE 1 = 1");

        if let Some(id) = query.id {
            builder.push(" AND id = ").push_bind(id);
        }
        if !query.country_codes.is_empty() {
            builder.push(" AND country_code IN (");
            let mut list = builder.separated(", ");
            for code in &query.country_codes {
                list.push_bind(code.clone());
            }
            list.push_unseparated(")");
        }
        if !query.not_country_codes.is_empty() {
            builder.push(" AND country_code NOT IN (");
            let mut list = builder.separated(", ");
            for code in &query.not_country_codes {
                list.push_bind(code.clone());
            }
            list.push_unseparated(")");
        }

        match query.order {
            ProxyOrder::Fastest => builder.push(" ORDER BY delay ASC, id ASC"),
            ProxyOrder::Random => builder.push(" ORDER BY RANDOM()"),
        };

        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        builder
            .build_query_as::<StoredProxy>()
            .fetch_all(&self.pool)
            .await
    }

    /// Count stored proxies per protocol and per country
    pub async fn summary(&self) -> Result<Summary, Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;

        let by_type = sqlx::query_as::<_, TypeCount>(
            r#"
                SELECT type, COUNT(*) AS count
                FROM proxies
                GROUP BY type
                ORDER BY count DESC, type ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let by_country = sqlx::query_as::<_, CountryCount>(
            r#"
                SELECT country_code, MAX(country) AS country, COUNT(*) AS count
                FROM proxies
                GROUP BY country_code
                ORDER BY count DESC, country_code ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(Summary {
            total,
            by_type,
            by_country,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::Country;
    use crate::proxy::parser::LinkDecoder;

    fn record(link: &str, delay: u16, code: &str) -> ValidationRecord {
        ValidationRecord::new(LinkDecoder::decode_from("test", link).unwrap())
            .with_delay(delay)
            .with_country(Country {
                code: code.to_string(),
                name: format!("country {code}"),
            })
    }

    fn ss(host: &str, port: u16) -> String {
        format!("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@{host}:{port}#n")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let (proxy, created) = db.create(&record(&ss("1.2.3.4", 8080), 120, "US")).await.unwrap();
        assert!(created);
        assert_eq!(proxy.server, "1.2.3.4");
        assert_eq!(proxy.port, 8080);
        assert_eq!(proxy.kind, "ss");
        assert_eq!(proxy.source, "test");
        assert_eq!(proxy.delay, 120);
        assert_eq!(proxy.country_code, "US");

        let descriptor = proxy.descriptor().unwrap();
        assert_eq!(descriptor.server(), "1.2.3.4");
        assert_eq!(descriptor.port(), 8080);

        let fetched = db.get_proxy(proxy.id).await.unwrap().unwrap();
        assert_eq!(fetched, proxy);
    }

    #[tokio::test]
    async fn test_same_endpoint_is_stored_once() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let (first, created) = db.create(&record(&ss("1.2.3.4", 8080), 120, "US")).await.unwrap();
        assert!(created);

        // a different protocol on the same endpoint loses to the first insert
        let trojan = record("trojan://pw@1.2.3.4:8080", 50, "DE");
        let (second, created) = db.create(&trojan).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.kind, "ss");

        let all = db.get_proxies(&ProxyQuery::new()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_create() {
        let path = std::env::temp_dir().join(format!("freeproxy-{}.db", uuid::Uuid::new_v4()));
        let db = ProxyDatabase::new(&path).await.unwrap();
        let link = ss("5.6.7.8", 443);

        for _ in 0..10 {
            let (ra, rb) = (record(&link, 10, ""), record(&link, 20, ""));
            let (a, b) = tokio::join!(db.create(&ra), db.create(&rb));
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_eq!(a.0.id, b.0.id);
            assert_ne!(a.1, b.1);

            assert!(db.remove(a.0.id).await.unwrap());
        }

        db.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_create_after_stored_row_removed() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let link = ss("4.4.4.4", 8388);
        let (first, _) = db.create(&record(&link, 10, "")).await.unwrap();

        assert!(db.remove(first.id).await.unwrap());
        assert!(db.find_endpoint("4.4.4.4", 8388).await.unwrap().is_none());

        let (second, created) = db.create(&record(&link, 20, "")).await.unwrap();
        assert!(created);
        assert_ne!(second.id, first.id);
        assert_eq!(second.delay, 20);
        assert_eq!(db.find_endpoint("4.4.4.4", 8388).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_create_races_with_remove() {
        let path = std::env::temp_dir().join(format!("freeproxy-{}.db", uuid::Uuid::new_v4()));
        let db = ProxyDatabase::new(&path).await.unwrap();
        let link = ss("6.6.6.6", 443);

        for _ in 0..20 {
            let (stored, _) = db.create(&record(&link, 10, "")).await.unwrap();
            let next = record(&link, 20, "");
            let (created, removed) = tokio::join!(db.create(&next), db.remove(stored.id));
            created.unwrap();
            removed.unwrap();
        }

        db.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_update_only_touches_measurements() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let (mut proxy, _) = db.create(&record(&ss("1.2.3.4", 1), 500, "")).await.unwrap();
        let config = proxy.config.clone();

        proxy.delay = 42;
        proxy.country_code = "FR".to_string();
        proxy.country = "France".to_string();
        proxy.config = "{}".to_string();
        db.update(&proxy).await.unwrap();

        let stored = db.get_proxy(proxy.id).await.unwrap().unwrap();
        assert_eq!(stored.delay, 42);
        assert_eq!(stored.country_code, "FR");
        assert_eq!(stored.config, config);
    }

    #[tokio::test]
    async fn test_remove() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let (proxy, _) = db.create(&record(&ss("1.2.3.4", 1), 5, "")).await.unwrap();

        assert!(db.remove(proxy.id).await.unwrap());
        assert!(!db.remove(proxy.id).await.unwrap());
        assert!(db.get_proxy(proxy.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fastest_first_and_filters() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        for (port, delay, code) in [(1, 300, "US"), (2, 100, "DE"), (3, 200, "US"), (4, 50, "CN")] {
            db.create(&record(&ss("9.9.9.9", port), delay, code)).await.unwrap();
        }

        let fastest = db.get_proxies(&ProxyQuery::new().fastest()).await.unwrap();
        let delays: Vec<_> = fastest.iter().map(|p| p.delay).collect();
        assert_eq!(delays, vec![50, 100, 200, 300]);

        let us = db
            .get_proxies(&ProxyQuery::new().with_country_codes("us").fastest())
            .await
            .unwrap();
        assert_eq!(us.iter().map(|p| p.port).collect::<Vec<_>>(), vec![3, 1]);

        let not_cn = db
            .get_proxies(&ProxyQuery::new().with_not_country_codes("CN,DE"))
            .await
            .unwrap();
        assert!(not_cn.iter().all(|p| p.country_code == "US"));
        assert_eq!(not_cn.len(), 2);

        let top = db
            .get_proxies(&ProxyQuery::new().fastest().with_limit(1))
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].delay, 50);

        let by_id = db
            .get_proxies(&ProxyQuery::new().with_id(top[0].id))
            .await
            .unwrap();
        assert_eq!(by_id, top);
    }

    #[tokio::test]
    async fn test_summary() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        db.create(&record(&ss("1.1.1.1", 1), 5, "US")).await.unwrap();
        db.create(&record(&ss("1.1.1.1", 2), 5, "US")).await.unwrap();
        db.create(&record("trojan://pw@2.2.2.2:443", 5, "JP")).await.unwrap();

        let summary = db.summary().await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type[0], TypeCount { kind: "ss".to_string(), count: 2 });
        assert_eq!(summary.by_country[0].country_code, "US");
        assert_eq!(summary.by_country[0].count, 2);
        assert_eq!(summary.by_country[1].country, "country JP");
    }
}
