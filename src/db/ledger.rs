//! Reservation ledger.
//!
//! One row per session in `reservations`, with contacts and held units in
//! side tables. Only pending and confirmed rows hold a hostname; the
//! partial unique index on `reservations(host)` enforces that in storage.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::validation::Constituency;

use super::models::{Reservation, ReservationState};
use super::pool::{row_to_unit, PoolError};
use super::{from_db_time, to_db_time};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Hostname {0} is already in use")]
    HostnameInUse(String),

    #[error("Reservation not found")]
    NotFound,

    #[error("Ledger invariant violated: {0}")]
    Invariant(String),

    #[error("Invalid reservation row: {0}")]
    InvalidRow(String),
}

impl From<PoolError> for LedgerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Database(e) => LedgerError::Database(e),
            PoolError::Invariant(msg) => LedgerError::Invariant(msg),
            other => LedgerError::InvalidRow(other.to_string()),
        }
    }
}

/// Data for a freshly created pending reservation.
#[derive(Debug, Clone)]
pub struct NewReservation<'a> {
    pub session: Uuid,
    pub host: &'a str,
    pub emails: &'a [String],
    pub constituency: Constituency,
    pub token_hash: &'a str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Optional filters for listing reservations.
#[derive(Debug, Clone, Default)]
pub struct ReservationFilter {
    pub state: Option<ReservationState>,
    pub email: Option<String>,
}

const RESERVATION_COLUMNS: &str =
    "session, host, constituency, state, created_at, expires_at, confirmed_at";

/// Ledger operations bound to one connection or transaction.
pub struct Ledger<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Whether a pending or confirmed reservation holds `host`.
    pub async fn host_in_use(&mut self, host: &str) -> Result<bool, LedgerError> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT session FROM reservations WHERE host = ? AND state IN ('pending', 'confirmed') LIMIT 1",
        )
        .bind(host)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(found.is_some())
    }

    /// Insert a pending reservation with its contacts.
    ///
    /// Fails with `HostnameInUse` when an active reservation holds the host;
    /// the check and the insert share the caller's transaction.
    pub async fn create(&mut self, new: NewReservation<'_>) -> Result<(), LedgerError> {
        if self.host_in_use(new.host).await? {
            return Err(LedgerError::HostnameInUse(new.host.to_string()));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO reservations (session, host, constituency, token_hash, state, created_at, expires_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(new.session.to_string())
        .bind(new.host)
        .bind(i64::from(new.constituency.code()))
        .bind(new.token_hash)
        .bind(to_db_time(new.created_at))
        .bind(to_db_time(new.expires_at))
        .execute(&mut *self.conn)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(LedgerError::HostnameInUse(new.host.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        for (position, email) in new.emails.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO reservation_contacts (session, email, position) VALUES (?, ?, ?)",
            )
            .bind(new.session.to_string())
            .bind(email)
            .bind(position as i64)
            .execute(&mut *self.conn)
            .await?;
        }

        Ok(())
    }

    /// Record which pool units the reservation holds.
    pub async fn attach_units(&mut self, session: Uuid, unit_ids: &[i64]) -> Result<(), LedgerError> {
        for id in unit_ids {
            sqlx::query("INSERT INTO reservation_units (session, unit_id) VALUES (?, ?)")
                .bind(session.to_string())
                .bind(*id)
                .execute(&mut *self.conn)
                .await?;
        }
        Ok(())
    }

    /// Load a reservation with its contacts and units.
    pub async fn lookup(&mut self, session: Uuid) -> Result<Reservation, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE session = ?"
        ))
        .bind(session.to_string())
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(LedgerError::NotFound)?;

        self.hydrate(&row).await
    }

    /// Stored hash of the confirmation token, if it still exists.
    pub async fn token_hash(&mut self, session: Uuid) -> Result<Option<String>, LedgerError> {
        let hash: Option<Option<String>> =
            sqlx::query_scalar("SELECT token_hash FROM reservations WHERE session = ?")
                .bind(session.to_string())
                .fetch_optional(&mut *self.conn)
                .await?;

        hash.ok_or(LedgerError::NotFound)
    }

    /// Pending -> Confirmed. Destroys the token.
    pub async fn mark_confirmed(&mut self, session: Uuid, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE reservations SET state = 'confirmed', token_hash = NULL, confirmed_at = ? WHERE session = ? AND state = 'pending'",
        )
        .bind(to_db_time(at))
        .bind(session.to_string())
        .execute(&mut *self.conn)
        .await?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::Invariant(format!(
                "reservation {} was not pending when confirming",
                session
            )));
        }
        Ok(())
    }

    /// Pending -> Expired. Destroys the token and detaches the units.
    ///
    /// The caller releases the units in the same transaction.
    pub async fn mark_expired(&mut self, session: Uuid) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE reservations SET state = 'expired', token_hash = NULL WHERE session = ? AND state = 'pending'",
        )
        .bind(session.to_string())
        .execute(&mut *self.conn)
        .await?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::Invariant(format!(
                "reservation {} was not pending when expiring",
                session
            )));
        }

        sqlx::query("DELETE FROM reservation_units WHERE session = ?")
            .bind(session.to_string())
            .execute(&mut *self.conn)
            .await?;

        Ok(())
    }

    /// Remove a reservation and everything attached to it.
    pub async fn delete(&mut self, session: Uuid) -> Result<bool, LedgerError> {
        let id = session.to_string();

        sqlx::query("DELETE FROM reservation_units WHERE session = ?")
            .bind(&id)
            .execute(&mut *self.conn)
            .await?;
        sqlx::query("DELETE FROM reservation_contacts WHERE session = ?")
            .bind(&id)
            .execute(&mut *self.conn)
            .await?;
        let result = sqlx::query("DELETE FROM reservations WHERE session = ?")
            .bind(&id)
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Sessions of pending reservations whose deadline is at or before `now`.
    pub async fn expired_candidates(&mut self, now: DateTime<Utc>) -> Result<Vec<Uuid>, LedgerError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT session FROM reservations WHERE state = 'pending' AND expires_at <= ? ORDER BY expires_at",
        )
        .bind(to_db_time(now))
        .fetch_all(&mut *self.conn)
        .await?;

        ids.iter()
            .map(|s| {
                s.parse::<Uuid>()
                    .map_err(|_| LedgerError::InvalidRow(format!("bad session id '{}'", s)))
            })
            .collect()
    }

    /// List reservations, newest first.
    pub async fn list(&mut self, filter: &ReservationFilter) -> Result<Vec<Reservation>, LedgerError> {
        let mut sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations r WHERE 1 = 1");
        if filter.state.is_some() {
            sql.push_str(" AND r.state = ?");
        }
        if filter.email.is_some() {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM reservation_contacts c WHERE c.session = r.session AND LOWER(c.email) = LOWER(?))",
            );
        }
        sql.push_str(" ORDER BY r.created_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(email) = &filter.email {
            query = query.bind(email.clone());
        }
        let rows = query.fetch_all(&mut *self.conn).await?;

        let mut reservations = Vec::with_capacity(rows.len());
        for row in &rows {
            reservations.push(self.hydrate(row).await?);
        }
        Ok(reservations)
    }

    /// Reservation counts per state.
    pub async fn count_by_state(&mut self) -> Result<Vec<(ReservationState, i64)>, LedgerError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM reservations GROUP BY state")
            .fetch_all(&mut *self.conn)
            .await?;

        rows.iter()
            .map(|r| -> Result<(ReservationState, i64), LedgerError> {
                let state: String = r.get("state");
                let state = state.parse().map_err(LedgerError::InvalidRow)?;
                Ok((state, r.get("n")))
            })
            .collect()
    }

    async fn hydrate(&mut self, row: &SqliteRow) -> Result<Reservation, LedgerError> {
        let session_str: String = row.get("session");
        let session: Uuid = session_str
            .parse()
            .map_err(|_| LedgerError::InvalidRow(format!("bad session id '{}'", session_str)))?;
        let state_str: String = row.get("state");
        let constituency: i64 = row.get("constituency");
        let created_at: String = row.get("created_at");
        let expires_at: String = row.get("expires_at");
        let confirmed_at: Option<String> = row.get("confirmed_at");

        let emails: Vec<String> = sqlx::query_scalar(
            "SELECT email FROM reservation_contacts WHERE session = ? ORDER BY position",
        )
        .bind(&session_str)
        .fetch_all(&mut *self.conn)
        .await?;

        let unit_rows = sqlx::query(
            r#"
            SELECT r.unit_id AS ref_id, p.id, p.kind, p.unit, p.state, p.holder, p.updated_at
            FROM reservation_units r
            LEFT JOIN pool_units p ON p.id = r.unit_id
            WHERE r.session = ?
            ORDER BY p.kind, p.sort_key
            "#,
        )
        .bind(&session_str)
        .fetch_all(&mut *self.conn)
        .await?;

        let mut units = Vec::with_capacity(unit_rows.len());
        for r in &unit_rows {
            let found: Option<i64> = r.get("id");
            if found.is_none() {
                let ref_id: i64 = r.get("ref_id");
                error!(session = %session, unit_id = ref_id, "Reservation references a unit missing from the pool");
                return Err(LedgerError::Invariant(format!(
                    "unit {} held by {} is missing from the pool",
                    ref_id, session
                )));
            }
            units.push(row_to_unit(r)?);
        }

        let state: ReservationState = state_str.parse().map_err(LedgerError::InvalidRow)?;
        if state.is_active() {
            check_units_held(session, &units)?;
        }

        Ok(Reservation {
            session,
            host: row.get("host"),
            emails,
            constituency: u8::try_from(constituency)
                .ok()
                .and_then(|c| Constituency::try_from(c).ok())
                .ok_or_else(|| {
                    LedgerError::InvalidRow(format!("bad constituency {}", constituency))
                })?,
            state,
            created_at: from_db_time(&created_at)
                .ok_or_else(|| LedgerError::InvalidRow("bad created_at".to_string()))?,
            expires_at: from_db_time(&expires_at)
                .ok_or_else(|| LedgerError::InvalidRow("bad expires_at".to_string()))?,
            confirmed_at: confirmed_at.as_deref().and_then(from_db_time),
            units,
        })
    }
}

/// Units of an active reservation must be held by it and never free.
fn check_units_held(session: Uuid, units: &[super::PoolUnit]) -> Result<(), LedgerError> {
    let mut seen = HashSet::new();
    for unit in units {
        if unit.holder != Some(session) || unit.state == super::UnitState::Free || !seen.insert(unit.id) {
            error!(session = %session, unit = %unit.unit, state = %unit.state, "Active reservation holds a unit it does not own");
            return Err(LedgerError::Invariant(format!(
                "unit {} is {} but listed by active reservation {}",
                unit.unit, unit.state, session
            )));
        }
    }
    Ok(())
}
