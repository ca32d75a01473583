//! Lazy partition manager over sqlx SQLite pools.

use crate::error::StoreError;
use meridian_protocol::DataDir;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One physical datastore file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    Primary,
    Journal,
    Sentinel,
    /// Monthly audit partition, keyed `YYYY-MM`.
    Audit(String),
}

impl Partition {
    pub fn audit(month: impl Into<String>) -> Result<Self, StoreError> {
        let month = month.into();
        if !is_month_key(&month) {
            return Err(StoreError::InvalidMonthKey(month));
        }
        Ok(Partition::Audit(month))
    }

    pub fn name(&self) -> String {
        match self {
            Partition::Primary => "primary".to_string(),
            Partition::Journal => "journal".to_string(),
            Partition::Sentinel => "sentinel".to_string(),
            Partition::Audit(month) => format!("audit-{month}"),
        }
    }

    fn path(&self, data_dir: &DataDir) -> PathBuf {
        match self {
            Partition::Primary => data_dir.primary_db(),
            Partition::Journal => data_dir.journal_db(),
            Partition::Sentinel => data_dir.sentinel_db(),
            Partition::Audit(month) => data_dir.audit_db(month),
        }
    }

    /// Audit partitions must never lose a committed tail on crash.
    fn synchronous(&self) -> SqliteSynchronous {
        match self {
            Partition::Audit(_) => SqliteSynchronous::Full,
            _ => SqliteSynchronous::Normal,
        }
    }
}

fn is_month_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 7
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit)
}

/// Partition store. Cloning shares the underlying pool cache.
#[derive(Clone)]
pub struct Store {
    data_dir: DataDir,
    pools: Arc<Mutex<HashMap<String, SqlitePool>>>,
}

impl Store {
    pub fn new(data_dir: DataDir) -> Self {
        Self {
            data_dir,
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    /// Open (or return the cached pool for) a partition.
    pub async fn open(&self, partition: &Partition) -> Result<SqlitePool, StoreError> {
        let name = partition.name();
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&name) {
            return Ok(pool.clone());
        }

        let path = partition.path(&self.data_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(partition.synchronous())
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(partition = %name, path = %path.display(), "opened partition");
        pools.insert(name, pool.clone());
        Ok(pool)
    }

    /// Pool for an already-open partition.
    pub async fn pool(&self, partition: &Partition) -> Result<SqlitePool, StoreError> {
        let pools = self.pools.lock().await;
        pools
            .get(&partition.name())
            .cloned()
            .ok_or_else(|| StoreError::NotOpen(partition.name()))
    }

    /// Run a raw statement against a partition (schema create, pragma).
    pub async fn exec(&self, partition: &Partition, sql: &str) -> Result<(), StoreError> {
        let pool = self.open(partition).await?;
        sqlx::raw_sql(sql).execute(&pool).await?;
        Ok(())
    }

    /// Consistent single-file snapshot via `VACUUM INTO`.
    pub async fn backup(&self, partition: &Partition, dst: &PathBuf) -> Result<(), StoreError> {
        if dst.exists() {
            return Err(StoreError::BackupExists(dst.clone()));
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = self.open(partition).await?;
        let sql = format!("VACUUM INTO '{}'", dst.display().to_string().replace('\'', "''"));
        sqlx::raw_sql(&sql).execute(&pool).await?;
        debug!(partition = %partition.name(), dst = %dst.display(), "backup written");
        Ok(())
    }

    /// Close one partition, releasing its pool.
    pub async fn close(&self, partition: &Partition) {
        let pool = {
            let mut pools = self.pools.lock().await;
            pools.remove(&partition.name())
        };
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    /// Close every open partition.
    pub async fn close_all(&self) {
        let drained: Vec<SqlitePool> = {
            let mut pools = self.pools.lock().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in drained {
            pool.close().await;
        }
    }

    /// Names of the partitions currently open.
    pub async fn open_partitions(&self) -> Vec<String> {
        let pools = self.pools.lock().await;
        let mut names: Vec<String> = pools.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(DataDir::new(dir.path()));
        (dir, store)
    }

    #[tokio::test]
    async fn open_is_lazy_and_cached() {
        let (_dir, store) = test_store();
        assert!(store.open_partitions().await.is_empty());

        let a = store.open(&Partition::Primary).await.unwrap();
        let b = store.open(&Partition::Primary).await.unwrap();
        // Same cached pool, not a second connection set.
        assert_eq!(a.size(), b.size());
        assert_eq!(store.open_partitions().await, vec!["primary"]);
    }

    #[tokio::test]
    async fn pool_requires_open() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.pool(&Partition::Sentinel).await,
            Err(StoreError::NotOpen(_))
        ));
        store.open(&Partition::Sentinel).await.unwrap();
        assert!(store.pool(&Partition::Sentinel).await.is_ok());
    }

    #[tokio::test]
    async fn audit_month_key_is_validated() {
        assert!(Partition::audit("2026-08").is_ok());
        assert!(Partition::audit("2026-8").is_err());
        assert!(Partition::audit("aug-2026").is_err());
        assert!(Partition::audit("2026-08-01").is_err());
    }

    #[tokio::test]
    async fn exec_and_query_roundtrip() {
        let (_dir, store) = test_store();
        store
            .exec(
                &Partition::Primary,
                "CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, v TEXT)",
            )
            .await
            .unwrap();
        let pool = store.pool(&Partition::Primary).await.unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (?)")
            .bind("hello")
            .execute(&pool)
            .await
            .unwrap();
        let (v,): (String,) = sqlx::query_as("SELECT v FROM t WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(v, "hello");
    }

    #[tokio::test]
    async fn backup_snapshots_content() {
        let (dir, store) = test_store();
        store
            .exec(&Partition::Primary, "CREATE TABLE t (v TEXT)")
            .await
            .unwrap();
        let pool = store.pool(&Partition::Primary).await.unwrap();
        sqlx::query("INSERT INTO t (v) VALUES ('x')")
            .execute(&pool)
            .await
            .unwrap();

        let dst = dir.path().join("backups").join("primary.db");
        store.backup(&Partition::Primary, &dst).await.unwrap();
        assert!(dst.is_file());

        // Refusing to overwrite an existing snapshot.
        assert!(matches!(
            store.backup(&Partition::Primary, &dst).await,
            Err(StoreError::BackupExists(_))
        ));
    }
}
