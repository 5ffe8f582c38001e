use crate::types::VerifyResult;
use crate::{Error, Result};
use chrono::Utc;
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Postgres, Row, Sqlite};
use std::str::FromStr;

/// Credential and share ledger consumed by the relay.
///
/// Implementations are shared by every connection and must tolerate concurrent calls.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn verify(&self, login: &str, pass: &str) -> Result<VerifyResult>;
    async fn register(&self, login: &str, pass: &str, contact: &str) -> Result<()>;
    async fn record_share(&self, login: &str, agent: &str, difficulty: u64) -> Result<()>;
    async fn record_block_hash(&self, hash: &str) -> Result<()>;
    async fn record_agent_status(
        &self,
        login: &str,
        agent: &str,
        difficulty: u64,
        status: &Map<String, Value>,
    ) -> Result<()>;
}

/// Row counts of the ledger tables
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LedgerStats {
    pub miners: u64,
    pub shares: u64,
    pub blocks: u64,
}

/// Database connection pool enum supporting both SQLite and PostgreSQL
#[derive(Debug, Clone)]
pub enum DatabasePool {
    Sqlite(Pool<Sqlite>),
    Postgres(Pool<Postgres>),
}

fn new_salt() -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

fn hash_password(salt: &str, pass: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(pass.as_bytes());
    hex::encode(hasher.finalize())
}

/// Difficulties are stored as signed 64-bit integers
fn stored_difficulty(difficulty: u64) -> Result<i64> {
    i64::try_from(difficulty).map_err(|_| Error::Ledger(format!("difficulty {} does not fit the ledger", difficulty)))
}

impl DatabasePool {
    /// Create a new database pool from URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        if database_url.starts_with("sqlite:") {
            let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

            // Every connection to an in-memory database sees a different database
            let in_memory = database_url.contains(":memory:");
            let pool_options = if in_memory {
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
            } else {
                SqlitePoolOptions::new().max_connections(max_connections)
            };

            let pool = pool_options.connect_with(options).await?;
            Ok(DatabasePool::Sqlite(pool))
        } else if database_url.starts_with("postgres:") {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url)
                .await?;
            Ok(DatabasePool::Postgres(pool))
        } else {
            Err(Error::Config("Unsupported database URL scheme".to_string()))
        }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::migrate!("./migrations/sqlite").run(pool).await?;
            }
            DatabasePool::Postgres(pool) => {
                sqlx::migrate!("./migrations/postgres").run(pool).await?;
            }
        }
        Ok(())
    }

    /// Check if database is healthy
    pub async fn health_check(&self) -> Result<()> {
        match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DatabasePool::Postgres(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::Sqlite(pool) => pool.close().await,
            DatabasePool::Postgres(pool) => pool.close().await,
        }
    }

    /// Get ledger statistics
    pub async fn get_stats(&self) -> Result<LedgerStats> {
        const QUERY: &str = "SELECT \
            (SELECT COUNT(*) FROM miners) AS miners, \
            (SELECT COUNT(*) FROM shares) AS shares, \
            (SELECT COUNT(*) FROM blocks) AS blocks";

        let row = match self {
            DatabasePool::Sqlite(pool) => {
                let row = sqlx::query(QUERY).fetch_one(pool).await?;
                (row.get::<i64, _>("miners"), row.get::<i64, _>("shares"), row.get::<i64, _>("blocks"))
            }
            DatabasePool::Postgres(pool) => {
                let row = sqlx::query(QUERY).fetch_one(pool).await?;
                (row.get::<i64, _>("miners"), row.get::<i64, _>("shares"), row.get::<i64, _>("blocks"))
            }
        };

        Ok(LedgerStats {
            miners: row.0 as u64,
            shares: row.1 as u64,
            blocks: row.2 as u64,
        })
    }
}

#[async_trait::async_trait]
impl LedgerStore for DatabasePool {
    async fn verify(&self, login: &str, pass: &str) -> Result<VerifyResult> {
        let stored: Option<(String, String)> = match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::query("SELECT pass_salt, pass_hash FROM miners WHERE login = ?")
                    .bind(login)
                    .fetch_optional(pool)
                    .await?
                    .map(|row| (row.get("pass_salt"), row.get("pass_hash")))
            }
            DatabasePool::Postgres(pool) => {
                sqlx::query("SELECT pass_salt, pass_hash FROM miners WHERE login = $1")
                    .bind(login)
                    .fetch_optional(pool)
                    .await?
                    .map(|row| (row.get("pass_salt"), row.get("pass_hash")))
            }
        };

        Ok(match stored {
            None => VerifyResult::Absent,
            Some((salt, hash)) if hash_password(&salt, pass) == hash => VerifyResult::Correct,
            Some(_) => VerifyResult::Wrong,
        })
    }

    async fn register(&self, login: &str, pass: &str, contact: &str) -> Result<()> {
        let salt = new_salt();
        let hash = hash_password(&salt, pass);
        let now = Utc::now();

        match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO miners (login, pass_salt, pass_hash, contact, registered_at) \
                     VALUES (?, ?, ?, ?, ?) ON CONFLICT (login) DO NOTHING",
                )
                .bind(login)
                .bind(&salt)
                .bind(&hash)
                .bind(contact)
                .bind(now)
                .execute(pool)
                .await?;
            }
            DatabasePool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO miners (login, pass_salt, pass_hash, contact, registered_at) \
                     VALUES ($1, $2, $3, $4, $5) ON CONFLICT (login) DO NOTHING",
                )
                .bind(login)
                .bind(&salt)
                .bind(&hash)
                .bind(contact)
                .bind(now)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn record_share(&self, login: &str, agent: &str, difficulty: u64) -> Result<()> {
        let difficulty = stored_difficulty(difficulty)?;
        let now = Utc::now();
        match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::query("INSERT INTO shares (login, agent, difficulty, submitted_at) VALUES (?, ?, ?, ?)")
                    .bind(login)
                    .bind(agent)
                    .bind(difficulty)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
            DatabasePool::Postgres(pool) => {
                sqlx::query("INSERT INTO shares (login, agent, difficulty, submitted_at) VALUES ($1, $2, $3, $4)")
                    .bind(login)
                    .bind(agent)
                    .bind(difficulty)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn record_block_hash(&self, hash: &str) -> Result<()> {
        let now = Utc::now();
        match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::query("INSERT INTO blocks (hash, found_at) VALUES (?, ?) ON CONFLICT (hash) DO NOTHING")
                    .bind(hash)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
            DatabasePool::Postgres(pool) => {
                sqlx::query("INSERT INTO blocks (hash, found_at) VALUES ($1, $2) ON CONFLICT (hash) DO NOTHING")
                    .bind(hash)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn record_agent_status(
        &self,
        login: &str,
        agent: &str,
        difficulty: u64,
        status: &Map<String, Value>,
    ) -> Result<()> {
        let difficulty = stored_difficulty(difficulty)?;
        let status_json = serde_json::to_string(status)?;
        let now = Utc::now();

        match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO agent_status (login, agent, difficulty, status, updated_at) VALUES (?, ?, ?, ?, ?) \
                     ON CONFLICT (login, agent) DO UPDATE SET \
                     difficulty = excluded.difficulty, status = excluded.status, updated_at = excluded.updated_at",
                )
                .bind(login)
                .bind(agent)
                .bind(difficulty)
                .bind(&status_json)
                .bind(now)
                .execute(pool)
                .await?;
            }
            DatabasePool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO agent_status (login, agent, difficulty, status, updated_at) VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (login, agent) DO UPDATE SET \
                     difficulty = excluded.difficulty, status = excluded.status, updated_at = excluded.updated_at",
                )
                .bind(login)
                .bind(agent)
                .bind(difficulty)
                .bind(&status_json)
                .bind(now)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn memory_ledger() -> DatabasePool {
        let pool = DatabasePool::new("sqlite::memory:", 5).await.unwrap();
        pool.migrate().await.unwrap();
        pool
    }

    fn sqlite(ledger: &DatabasePool) -> &Pool<Sqlite> {
        match ledger {
            DatabasePool::Sqlite(pool) => pool,
            DatabasePool::Postgres(_) => panic!("expected a sqlite ledger"),
        }
    }

    #[tokio::test]
    async fn test_sqlite_file_database() {
        let dir = tempdir().unwrap();
        let db_url = format!("sqlite://{}", dir.path().join("ledger.db").display());

        let pool = DatabasePool::new(&db_url, 5).await.unwrap();
        assert!(matches!(pool, DatabasePool::Sqlite(_)));
        pool.health_check().await.unwrap();
        pool.migrate().await.unwrap();

        assert_eq!(pool.get_stats().await.unwrap(), LedgerStats::default());
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        assert!(matches!(DatabasePool::new("mysql://localhost/pool", 1).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_verify_register_cycle() {
        let ledger = memory_ledger().await;

        assert_eq!(ledger.verify("alice", "p").await.unwrap(), VerifyResult::Absent);
        ledger.register("alice", "p", "").await.unwrap();
        assert_eq!(ledger.verify("alice", "p").await.unwrap(), VerifyResult::Correct);
        assert_eq!(ledger.verify("alice", "q").await.unwrap(), VerifyResult::Wrong);

        // A second registration never replaces the first password
        ledger.register("alice", "other", "").await.unwrap();
        assert_eq!(ledger.verify("alice", "p").await.unwrap(), VerifyResult::Correct);
    }

    #[tokio::test]
    async fn test_passwords_are_salted() {
        let ledger = memory_ledger().await;
        ledger.register("alice", "same", "").await.unwrap();
        ledger.register("bob", "same", "").await.unwrap();

        let hashes: Vec<String> = sqlx::query("SELECT pass_hash FROM miners")
            .fetch_all(sqlite(&ledger))
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.get("pass_hash"))
            .collect();
        assert_eq!(hashes.len(), 2);
        assert_ne!(hashes[0], hashes[1]);
        assert!(!hashes.iter().any(|h| h.contains("same")));
    }

    #[tokio::test]
    async fn test_shares_and_blocks() {
        let ledger = memory_ledger().await;
        ledger.record_share("alice", "rig-1", 4).await.unwrap();
        ledger.record_share("alice", "rig-2", 4).await.unwrap();
        ledger.record_share("bob", "rig-1", 1).await.unwrap();
        ledger.record_block_hash("0a1b2c").await.unwrap();
        ledger.record_block_hash("0a1b2c").await.unwrap();

        let alice: Vec<(String, i64)> =
            sqlx::query_as("SELECT agent, difficulty FROM shares WHERE login = 'alice' ORDER BY id")
                .fetch_all(sqlite(&ledger))
                .await
                .unwrap();
        assert_eq!(alice, vec![("rig-1".to_string(), 4), ("rig-2".to_string(), 4)]);

        let blocks: Vec<(String,)> = sqlx::query_as("SELECT hash FROM blocks")
            .fetch_all(sqlite(&ledger))
            .await
            .unwrap();
        assert_eq!(blocks, vec![("0a1b2c".to_string(),)]);

        let stats = ledger.get_stats().await.unwrap();
        assert_eq!(stats.shares, 3);
        assert_eq!(stats.blocks, 1);
    }

    #[tokio::test]
    async fn test_oversized_difficulty_is_rejected() {
        let ledger = memory_ledger().await;
        let err = ledger.record_share("alice", "rig-1", u64::MAX).await.unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
        assert!(err.is_recoverable());
        assert_eq!(ledger.get_stats().await.unwrap().shares, 0);
    }

    #[tokio::test]
    async fn test_agent_status_upsert() {
        let ledger = memory_ledger().await;
        let first = json!({"height": 100, "difficulty": 4}).as_object().cloned().unwrap();
        let second = json!({"height": 101, "difficulty": 4}).as_object().cloned().unwrap();

        ledger.record_agent_status("alice", "rig-1", 4, &first).await.unwrap();
        ledger.record_agent_status("alice", "rig-1", 4, &second).await.unwrap();
        ledger.record_agent_status("alice", "rig-2", 4, &Map::new()).await.unwrap();

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT agent, status FROM agent_status WHERE login = 'alice' ORDER BY agent")
                .fetch_all(sqlite(&ledger))
                .await
                .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "rig-1");
        let latest: Value = serde_json::from_str(&rows[0].1).unwrap();
        assert_eq!(latest["height"], json!(101));
        assert_eq!(rows[1].1, "{}");
    }

    #[test]
    fn test_password_hash_depends_on_salt() {
        assert_eq!(hash_password("aa", "p"), hash_password("aa", "p"));
        assert_ne!(hash_password("aa", "p"), hash_password("bb", "p"));
        assert_eq!(new_salt().len(), 32);
    }
}
