//! Address pool store.
//!
//! Units live in one table indexed by `(kind, state, prefix_len, sort_key)`.
//! Free units are picked lowest-address-first. All operations run on a
//! caller-supplied connection so the allocator can compose them into a
//! single transaction.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::Utc;
use ipnet::IpNet;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolsConfig;

use super::models::{PoolStats, PoolUnit, UnitKind, UnitState};
use super::{from_db_time, to_db_time};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No free {kind} available (wanted {wanted}, {free} free)")]
    Exhausted {
        kind: UnitKind,
        wanted: usize,
        free: usize,
    },

    #[error("Pool invariant violated: {0}")]
    Invariant(String),

    #[error("Invalid pool unit: {0}")]
    InvalidUnit(String),
}

/// A unit to be seeded into the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSeed {
    pub kind: UnitKind,
    pub unit: IpNet,
}

impl UnitSeed {
    /// All units described by the pools configuration.
    pub fn from_config(config: &PoolsConfig) -> Vec<UnitSeed> {
        let v4 = config.ipv4_prefixes.iter().map(|p| UnitSeed {
            kind: UnitKind::Ipv4Prefix,
            unit: IpNet::V4(p.trunc()),
        });
        let v6 = config.ipv6_prefixes.iter().map(|p| UnitSeed {
            kind: UnitKind::Ipv6Prefix,
            unit: IpNet::V6(p.trunc()),
        });
        let mesh = config.mesh4.iter().map(|a| UnitSeed {
            kind: UnitKind::Mesh4,
            unit: IpNet::from(IpAddr::V4(*a)),
        });
        v4.chain(v6).chain(mesh).collect()
    }
}

/// Zero-padded hex of the network address; sorts like the numeric value.
fn sort_key(unit: &IpNet) -> String {
    let value: u128 = match unit.network() {
        IpAddr::V4(a) => u32::from(a).into(),
        IpAddr::V6(a) => a.into(),
    };
    format!("{:032x}", value)
}

const UNIT_COLUMNS: &str = "id, kind, unit, state, holder, updated_at";

/// Pool operations bound to one connection or transaction.
pub struct PoolStore<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> PoolStore<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Bring the pool in line with the configured units.
    ///
    /// New units are inserted as free; existing units keep their state.
    /// Free units that are no longer configured are removed. Held ones stay
    /// until their reservation lets go of them. Returns the number of new
    /// units.
    pub async fn sync(&mut self, seeds: &[UnitSeed]) -> Result<u64, PoolError> {
        let now = to_db_time(Utc::now());
        let mut inserted = 0;

        for seed in seeds {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO pool_units (kind, unit, prefix_len, sort_key, state, updated_at)
                VALUES (?, ?, ?, ?, 'free', ?)
                "#,
            )
            .bind(seed.kind.as_str())
            .bind(seed.unit.to_string())
            .bind(i64::from(seed.unit.prefix_len()))
            .bind(sort_key(&seed.unit))
            .bind(&now)
            .execute(&mut *self.conn)
            .await?;
            inserted += result.rows_affected();
        }

        if inserted > 0 {
            info!(inserted = inserted, "Added units to pool");
        }

        self.retire_unconfigured(seeds).await?;
        Ok(inserted)
    }

    async fn retire_unconfigured(&mut self, seeds: &[UnitSeed]) -> Result<(), PoolError> {
        let configured: HashSet<String> = seeds.iter().map(|s| s.unit.to_string()).collect();

        for unit in self.list(None).await? {
            let key = unit.unit.to_string();
            if configured.contains(&key) {
                continue;
            }

            if unit.state == UnitState::Free {
                sqlx::query("DELETE FROM pool_units WHERE id = ? AND state = 'free'")
                    .bind(unit.id)
                    .execute(&mut *self.conn)
                    .await?;
                info!(unit = %unit.unit, kind = %unit.kind, "Removed unit no longer in configuration");
            } else {
                warn!(
                    unit = %unit.unit,
                    kind = %unit.kind,
                    state = %unit.state,
                    holder = ?unit.holder,
                    "Unit is no longer configured but still held"
                );
            }
        }

        Ok(())
    }

    /// Reserve `count` free units of `kind` for `holder`.
    ///
    /// `prefix_len` narrows the pick to one size class. Fails without side
    /// effects when fewer than `count` units are free.
    pub async fn reserve(
        &mut self,
        kind: UnitKind,
        prefix_len: Option<u8>,
        count: usize,
        holder: Uuid,
    ) -> Result<Vec<PoolUnit>, PoolError> {
        let rows = match prefix_len {
            Some(len) => {
                sqlx::query(&format!(
                    "SELECT {UNIT_COLUMNS} FROM pool_units WHERE kind = ? AND state = 'free' AND prefix_len = ? ORDER BY sort_key LIMIT ?"
                ))
                .bind(kind.as_str())
                .bind(i64::from(len))
                .bind(count as i64)
                .fetch_all(&mut *self.conn)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {UNIT_COLUMNS} FROM pool_units WHERE kind = ? AND state = 'free' ORDER BY sort_key LIMIT ?"
                ))
                .bind(kind.as_str())
                .bind(count as i64)
                .fetch_all(&mut *self.conn)
                .await?
            }
        };

        if rows.len() < count {
            debug!(kind = %kind, wanted = count, free = rows.len(), "Pool exhausted");
            return Err(PoolError::Exhausted {
                kind,
                wanted: count,
                free: rows.len(),
            });
        }

        let now = Utc::now();
        let mut units = Vec::with_capacity(count);
        for row in &rows {
            let mut unit = row_to_unit(row)?;

            let result = sqlx::query(
                "UPDATE pool_units SET state = 'reserved', holder = ?, updated_at = ? WHERE id = ? AND state = 'free'",
            )
            .bind(holder.to_string())
            .bind(to_db_time(now))
            .bind(unit.id)
            .execute(&mut *self.conn)
            .await?;

            if result.rows_affected() != 1 {
                error!(unit = %unit.unit, holder = %holder, "Free unit changed state during reservation");
                return Err(PoolError::Invariant(format!(
                    "unit {} was not free when reserving for {}",
                    unit.unit, holder
                )));
            }

            unit.state = UnitState::Reserved;
            unit.holder = Some(holder);
            unit.updated_at = now;
            units.push(unit);
        }

        Ok(units)
    }

    /// Flip units reserved by `holder` to committed.
    pub async fn commit(&mut self, holder: Uuid, unit_ids: &[i64]) -> Result<(), PoolError> {
        let now = to_db_time(Utc::now());

        for id in unit_ids {
            let result = sqlx::query(
                "UPDATE pool_units SET state = 'committed', updated_at = ? WHERE id = ? AND holder = ? AND state = 'reserved'",
            )
            .bind(&now)
            .bind(*id)
            .bind(holder.to_string())
            .execute(&mut *self.conn)
            .await?;

            if result.rows_affected() != 1 {
                error!(unit_id = id, holder = %holder, "Unit is not reserved by its reservation");
                return Err(PoolError::Invariant(format!(
                    "unit {} is not reserved by {}",
                    id, holder
                )));
            }
        }

        Ok(())
    }

    /// Return units held by `holder` to the free set.
    ///
    /// Idempotent: units that are already free, or that belong to another
    /// holder, are left alone. A unit id missing from the pool is an
    /// invariant violation. Returns the number of units actually freed.
    pub async fn release(&mut self, holder: Uuid, unit_ids: &[i64]) -> Result<u64, PoolError> {
        let now = to_db_time(Utc::now());
        let mut released = 0;

        for id in unit_ids {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM pool_units WHERE id = ?")
                .bind(*id)
                .fetch_optional(&mut *self.conn)
                .await?;

            if exists.is_none() {
                error!(unit_id = id, holder = %holder, "Reservation references a unit missing from the pool");
                return Err(PoolError::Invariant(format!(
                    "unit {} held by {} is missing from the pool",
                    id, holder
                )));
            }

            let result = sqlx::query(
                "UPDATE pool_units SET state = 'free', holder = NULL, updated_at = ? WHERE id = ? AND holder = ? AND state != 'free'",
            )
            .bind(&now)
            .bind(*id)
            .bind(holder.to_string())
            .execute(&mut *self.conn)
            .await?;
            released += result.rows_affected();
        }

        Ok(released)
    }

    /// List units, optionally of one kind, ordered by address.
    pub async fn list(&mut self, kind: Option<UnitKind>) -> Result<Vec<PoolUnit>, PoolError> {
        let rows = match kind {
            Some(k) => {
                sqlx::query(&format!(
                    "SELECT {UNIT_COLUMNS} FROM pool_units WHERE kind = ? ORDER BY sort_key"
                ))
                .bind(k.as_str())
                .fetch_all(&mut *self.conn)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {UNIT_COLUMNS} FROM pool_units ORDER BY kind, sort_key"
                ))
                .fetch_all(&mut *self.conn)
                .await?
            }
        };

        rows.iter().map(row_to_unit).collect()
    }

    /// Unit counts per kind and state.
    pub async fn stats(&mut self) -> Result<Vec<PoolStats>, PoolError> {
        let rows = sqlx::query("SELECT kind, state, COUNT(*) AS n FROM pool_units GROUP BY kind, state")
            .fetch_all(&mut *self.conn)
            .await?;

        let mut stats: Vec<PoolStats> = UnitKind::ALL
            .iter()
            .map(|&kind| PoolStats {
                kind,
                free: 0,
                reserved: 0,
                committed: 0,
            })
            .collect();

        for row in &rows {
            let kind: UnitKind = row
                .get::<String, _>("kind")
                .parse()
                .map_err(PoolError::InvalidUnit)?;
            let state: UnitState = row
                .get::<String, _>("state")
                .parse()
                .map_err(PoolError::InvalidUnit)?;
            let n: i64 = row.get("n");

            if let Some(entry) = stats.iter_mut().find(|s| s.kind == kind) {
                match state {
                    UnitState::Free => entry.free = n,
                    UnitState::Reserved => entry.reserved = n,
                    UnitState::Committed => entry.committed = n,
                }
            }
        }

        Ok(stats)
    }
}

pub(crate) fn row_to_unit(row: &SqliteRow) -> Result<PoolUnit, PoolError> {
    let kind: String = row.get("kind");
    let unit: String = row.get("unit");
    let state: String = row.get("state");
    let holder: Option<String> = row.get("holder");
    let updated_at: String = row.get("updated_at");

    Ok(PoolUnit {
        id: row.get("id"),
        kind: kind.parse().map_err(PoolError::InvalidUnit)?,
        unit: unit
            .parse()
            .map_err(|_| PoolError::InvalidUnit(format!("bad network '{}'", unit)))?,
        state: state.parse().map_err(PoolError::InvalidUnit)?,
        holder: holder
            .map(|h| h.parse())
            .transpose()
            .map_err(|_| PoolError::InvalidUnit("bad holder id".to_string()))?,
        updated_at: from_db_time(&updated_at).unwrap_or_else(Utc::now),
    })
}
