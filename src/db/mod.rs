//! Persistence for the address pools, the reservation ledger and operator tokens.

pub mod ledger;
mod models;
pub mod pool;
pub mod tokens;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

pub use ledger::{Ledger, LedgerError, NewReservation, ReservationFilter};
pub use models::{PoolStats, PoolUnit, Reservation, ReservationState, UnitKind, UnitState};
pub use pool::{PoolError, PoolStore, UnitSeed};
pub use tokens::{generate_token, hash_token, token_matches};

/// Handle to the broker's SQLite database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (and create if needed) the database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, sqlx::Error> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    sqlx::Error::Configuration(
                        format!(
                            "Failed to create database directory {}: {}",
                            parent.display(),
                            e
                        )
                        .into(),
                    )
                })?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;

        Ok(db)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pool_units (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                unit TEXT UNIQUE NOT NULL,
                prefix_len INTEGER NOT NULL,
                sort_key TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'free',
                holder TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pool_units_free ON pool_units(kind, state, prefix_len, sort_key);
            CREATE INDEX IF NOT EXISTS idx_pool_units_holder ON pool_units(holder);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                session TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                constituency INTEGER NOT NULL,
                token_hash TEXT,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                confirmed_at TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_active_host
                ON reservations(host) WHERE state IN ('pending', 'confirmed');
            CREATE INDEX IF NOT EXISTS idx_reservations_state ON reservations(state, expires_at);

            CREATE TABLE IF NOT EXISTS reservation_contacts (
                session TEXT NOT NULL,
                email TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (session, email)
            );

            CREATE INDEX IF NOT EXISTS idx_reservation_contacts_email ON reservation_contacts(email);

            CREATE TABLE IF NOT EXISTS reservation_units (
                session TEXT NOT NULL,
                unit_id INTEGER NOT NULL,
                PRIMARY KEY (session, unit_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operator_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_hash TEXT UNIQUE NOT NULL,
                name TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                revoked BOOLEAN DEFAULT FALSE
            );

            CREATE INDEX IF NOT EXISTS idx_operator_tokens_hash ON operator_tokens(token_hash);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                session TEXT,
                host TEXT,
                details TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The underlying connection pool, for reads outside a transaction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a write transaction. Rolled back on drop unless committed.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }
}

/// Append an entry to the audit log.
pub async fn record_audit(
    conn: &mut SqliteConnection,
    action: &str,
    session: Option<Uuid>,
    host: Option<&str>,
    details: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_log (timestamp, action, session, host, details) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(to_db_time(Utc::now()))
    .bind(action)
    .bind(session.map(|s| s.to_string()))
    .bind(host)
    .bind(details.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Timestamps are stored as fixed-width UTC RFC 3339 so they sort lexically.
pub(crate) fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/broker.db");
        let _db = Database::open(&path).await.unwrap();
        assert!(path.exists());

        // Reopening runs the schema again without error.
        let _db = Database::open(&path).await.unwrap();
    }

    #[test]
    fn test_db_time_sorts_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(to_db_time(a) < to_db_time(b));
        assert_eq!(from_db_time(&to_db_time(a)).unwrap().timestamp_micros(), a.timestamp_micros());
    }
}
