//! Prefix reservation allocator.
//!
//! Orchestrates the pool store and the reservation ledger. A request
//! reserves units and creates a pending reservation; presenting the
//! emailed token commits them. Every transition into `expired`, and every
//! operator delete, releases exactly the units the reservation holds inside
//! the same transaction that changes its state.
//!
//! Mutations are serialized by an internal write gate and each runs in a
//! single SQLite transaction, so a failure at any step rolls back
//! everything reserved so far.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use sqlx::sqlite::SqliteConnection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AllocationConfig, ConfigError};
use crate::db::{
    generate_token, hash_token, record_audit, token_matches, Database, Ledger, LedgerError,
    NewReservation, PoolError, PoolStats, PoolStore, PoolUnit, Reservation, ReservationFilter,
    ReservationState, UnitKind, UnitSeed,
};
use crate::validation::Constituency;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("Hostname {0} is already in use")]
    HostnameInUse(String),

    #[error("No free {0} left")]
    PoolExhausted(UnitKind),

    #[error("Reservation not found")]
    NotFound,

    #[error("Confirmation token does not match")]
    TokenMismatch,

    #[error("Reservation has expired")]
    Expired,

    #[error("Reservation is already confirmed")]
    AlreadyConfirmed,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<PoolError> for AllocatorError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Database(e) => AllocatorError::Database(e),
            PoolError::Exhausted { kind, .. } => AllocatorError::PoolExhausted(kind),
            PoolError::Invariant(msg) | PoolError::InvalidUnit(msg) => {
                AllocatorError::InvariantViolation(msg)
            }
        }
    }
}

impl From<LedgerError> for AllocatorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Database(e) => AllocatorError::Database(e),
            LedgerError::HostnameInUse(host) => AllocatorError::HostnameInUse(host),
            LedgerError::NotFound => AllocatorError::NotFound,
            LedgerError::Invariant(msg) | LedgerError::InvalidRow(msg) => {
                AllocatorError::InvariantViolation(msg)
            }
        }
    }
}

/// Sizing and timing of reservations.
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    pub mesh_count: usize,
    pub reservation_ttl: chrono::Duration,
}

impl TryFrom<&AllocationConfig> for AllocationPolicy {
    type Error = ConfigError;

    fn try_from(config: &AllocationConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        let reservation_ttl = i64::try_from(config.reservation_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "reservation_ttl_secs {} is out of range",
                    config.reservation_ttl_secs
                ))
            })?;

        Ok(Self {
            mesh_count: config.mesh_count,
            reservation_ttl,
        })
    }
}

/// An already validated allocation request.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub host: String,
    pub emails: Vec<String>,
    pub constituency: Constituency,
    /// `None` reserves no IPv4 prefix.
    pub ipv4_size: Option<u8>,
}

/// The one-time secret proving control of a contact email.
pub struct ConfirmationToken(SecretString);

impl ConfirmationToken {
    fn new(token: String) -> Self {
        Self(SecretString::from(token))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ConfirmationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfirmationToken([REDACTED])")
    }
}

/// Units handed to a router after a successful confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedAllocation {
    pub session: Uuid,
    pub host: String,
    pub prefix4: Option<Ipv4Net>,
    pub prefix6: Option<Ipv6Net>,
    pub mesh4: Vec<Ipv4Addr>,
}

impl From<&Reservation> for ConfirmedAllocation {
    fn from(r: &Reservation) -> Self {
        Self {
            session: r.session,
            host: r.host.clone(),
            prefix4: r.prefix4(),
            prefix6: r.prefix6(),
            mesh4: r.mesh4(),
        }
    }
}

/// Pool and ledger overview for operators.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub pools: Vec<PoolStats>,
    pub pending: i64,
    pub confirmed: i64,
    pub expired: i64,
}

pub struct Allocator {
    db: Database,
    policy: AllocationPolicy,
    gate: Mutex<()>,
}

impl Allocator {
    pub fn new(db: Database, policy: AllocationPolicy) -> Self {
        Self {
            db,
            policy,
            gate: Mutex::new(()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Seed the pools with configured units. Returns how many were new.
    pub async fn sync_pools(&self, seeds: &[UnitSeed]) -> Result<u64, AllocatorError> {
        let _guard = self.gate.lock().await;
        let mut tx = self.db.begin().await?;
        let inserted = PoolStore::new(&mut tx).sync(seeds).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Reserve units for a new pending reservation.
    ///
    /// All units are reserved or none are. The returned token is the only
    /// copy of the secret; just its hash is stored.
    pub async fn request_allocation(
        &self,
        request: AllocationRequest,
    ) -> Result<(Reservation, ConfirmationToken), AllocatorError> {
        let host = request.host.to_ascii_lowercase();
        let session = Uuid::new_v4();

        let _guard = self.gate.lock().await;
        let mut tx = self.db.begin().await?;

        if Ledger::new(&mut tx).host_in_use(&host).await? {
            return Err(AllocatorError::HostnameInUse(host));
        }

        let mut unit_ids = Vec::new();
        {
            let mut pool = PoolStore::new(&mut tx);
            if let Some(len) = request.ipv4_size {
                let units = pool
                    .reserve(UnitKind::Ipv4Prefix, Some(len), 1, session)
                    .await?;
                unit_ids.extend(units.iter().map(|u| u.id));
            }
            if request.constituency.wants_ipv6() {
                let units = pool.reserve(UnitKind::Ipv6Prefix, None, 1, session).await?;
                unit_ids.extend(units.iter().map(|u| u.id));
            }
            let units = pool
                .reserve(UnitKind::Mesh4, None, self.policy.mesh_count, session)
                .await?;
            unit_ids.extend(units.iter().map(|u| u.id));
        }

        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = Utc::now();

        let mut ledger = Ledger::new(&mut tx);
        ledger
            .create(NewReservation {
                session,
                host: &host,
                emails: &request.emails,
                constituency: request.constituency,
                token_hash: &token_hash,
                created_at: now,
                expires_at: now + self.policy.reservation_ttl,
            })
            .await?;
        ledger.attach_units(session, &unit_ids).await?;
        let reservation = ledger.lookup(session).await?;

        record_audit(
            &mut tx,
            "reserve",
            Some(session),
            Some(&host),
            &json!({
                "units": unit_strings(&reservation.units),
                "constituency": request.constituency.code(),
                "expires_at": reservation.expires_at,
            }),
        )
        .await?;

        tx.commit().await?;

        info!(
            session = %session,
            host = %host,
            units = reservation.units.len(),
            expires_at = %reservation.expires_at,
            "Reserved units"
        );

        Ok((reservation, ConfirmationToken::new(token)))
    }

    /// Present the confirmation token for a pending reservation.
    ///
    /// Single-shot: a wrong token expires the reservation and frees its
    /// units, as does a confirmation arriving after the deadline.
    pub async fn confirm_allocation(
        &self,
        session: Uuid,
        token: &str,
    ) -> Result<ConfirmedAllocation, AllocatorError> {
        let _guard = self.gate.lock().await;
        let mut tx = self.db.begin().await?;

        let reservation = Ledger::new(&mut tx).lookup(session).await?;
        match reservation.state {
            ReservationState::Expired => return Err(AllocatorError::Expired),
            ReservationState::Confirmed => return Err(AllocatorError::AlreadyConfirmed),
            ReservationState::Pending => {}
        }

        let now = Utc::now();
        if reservation.is_overdue(now) {
            expire_reservation(&mut tx, &reservation, "late_confirm").await?;
            tx.commit().await?;
            info!(session = %session, host = %reservation.host, "Confirmation arrived after deadline");
            return Err(AllocatorError::Expired);
        }

        let stored = Ledger::new(&mut tx).token_hash(session).await?;
        let matches = stored
            .as_deref()
            .is_some_and(|hash| token_matches(token, hash));
        if !matches {
            expire_reservation(&mut tx, &reservation, "token_mismatch").await?;
            tx.commit().await?;
            warn!(session = %session, host = %reservation.host, "Wrong confirmation token, reservation expired");
            return Err(AllocatorError::TokenMismatch);
        }

        PoolStore::new(&mut tx)
            .commit(session, &reservation.unit_ids())
            .await?;
        Ledger::new(&mut tx).mark_confirmed(session, now).await?;
        record_audit(
            &mut tx,
            "confirm",
            Some(session),
            Some(&reservation.host),
            &json!({ "units": unit_strings(&reservation.units) }),
        )
        .await?;

        tx.commit().await?;

        info!(session = %session, host = %reservation.host, "Reservation confirmed");

        Ok(ConfirmedAllocation::from(&reservation))
    }

    /// Operator removal of a reservation in any state.
    ///
    /// Releases held units and deletes the ledger row. Returns the
    /// reservation as it was before removal.
    pub async fn delete_reservation(&self, session: Uuid) -> Result<Reservation, AllocatorError> {
        let _guard = self.gate.lock().await;
        let mut tx = self.db.begin().await?;

        let reservation = Ledger::new(&mut tx).lookup(session).await?;
        let unit_ids = reservation.unit_ids();
        let released = PoolStore::new(&mut tx).release(session, &unit_ids).await?;
        check_released(&reservation, released)?;

        if !Ledger::new(&mut tx).delete(session).await? {
            return Err(AllocatorError::NotFound);
        }
        record_audit(
            &mut tx,
            "delete",
            Some(session),
            Some(&reservation.host),
            &json!({
                "state": reservation.state,
                "units": unit_strings(&reservation.units),
            }),
        )
        .await?;

        tx.commit().await?;

        info!(
            session = %session,
            host = %reservation.host,
            state = %reservation.state,
            released = released,
            "Reservation deleted"
        );

        Ok(reservation)
    }

    /// Expire pending reservations whose deadline is at or before `now`.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, AllocatorError> {
        let _guard = self.gate.lock().await;
        let mut tx = self.db.begin().await?;

        let candidates = Ledger::new(&mut tx).expired_candidates(now).await?;
        for session in &candidates {
            let reservation = Ledger::new(&mut tx).lookup(*session).await?;
            expire_reservation(&mut tx, &reservation, "timeout").await?;
            info!(session = %session, host = %reservation.host, "Reservation expired");
        }

        tx.commit().await?;
        Ok(candidates.len())
    }

    pub async fn lookup(&self, session: Uuid) -> Result<Reservation, AllocatorError> {
        let mut conn = self.db.pool().acquire().await?;
        Ok(Ledger::new(&mut conn).lookup(session).await?)
    }

    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, AllocatorError> {
        let mut conn = self.db.pool().acquire().await?;
        Ok(Ledger::new(&mut conn).list(filter).await?)
    }

    pub async fn pool_units(&self, kind: Option<UnitKind>) -> Result<Vec<PoolUnit>, AllocatorError> {
        let mut conn = self.db.pool().acquire().await?;
        Ok(PoolStore::new(&mut conn).list(kind).await?)
    }

    pub async fn status(&self) -> Result<BrokerStatus, AllocatorError> {
        let mut conn = self.db.pool().acquire().await?;
        let pools = PoolStore::new(&mut conn).stats().await?;
        let counts = Ledger::new(&mut conn).count_by_state().await?;

        let count = |state: ReservationState| {
            counts
                .iter()
                .find(|(s, _)| *s == state)
                .map_or(0, |(_, n)| *n)
        };

        Ok(BrokerStatus {
            pools,
            pending: count(ReservationState::Pending),
            confirmed: count(ReservationState::Confirmed),
            expired: count(ReservationState::Expired),
        })
    }
}

/// Pending -> Expired with release of the held units.
async fn expire_reservation(
    conn: &mut SqliteConnection,
    reservation: &Reservation,
    reason: &str,
) -> Result<(), AllocatorError> {
    let released = PoolStore::new(conn)
        .release(reservation.session, &reservation.unit_ids())
        .await?;
    check_released(reservation, released)?;

    Ledger::new(conn).mark_expired(reservation.session).await?;
    record_audit(
        conn,
        "expire",
        Some(reservation.session),
        Some(&reservation.host),
        &json!({
            "reason": reason,
            "units": unit_strings(&reservation.units),
        }),
    )
    .await?;

    Ok(())
}

/// An active reservation must get back every unit it listed.
fn check_released(reservation: &Reservation, released: u64) -> Result<(), AllocatorError> {
    let expected = reservation.units.len() as u64;
    if reservation.state.is_active() && released != expected {
        error!(
            session = %reservation.session,
            expected = expected,
            released = released,
            "Released a different number of units than the reservation holds"
        );
        return Err(AllocatorError::InvariantViolation(format!(
            "reservation {} held {} units but {} were released",
            reservation.session, expected, released
        )));
    }
    Ok(())
}

fn unit_strings(units: &[PoolUnit]) -> Vec<String> {
    units.iter().map(|u| u.unit.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::config::PoolsConfig;
    use crate::db::UnitState;
    use crate::validation::validate_constituency;

    async fn allocator(
        pools: PoolsConfig,
        mesh_count: usize,
        ttl: chrono::Duration,
    ) -> (Arc<Allocator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("broker.db")).await.unwrap();
        let allocator = Allocator::new(
            db,
            AllocationPolicy {
                mesh_count,
                reservation_ttl: ttl,
            },
        );
        allocator
            .sync_pools(&UnitSeed::from_config(&pools))
            .await
            .unwrap();
        (Arc::new(allocator), dir)
    }

    fn small_pools() -> PoolsConfig {
        PoolsConfig {
            ipv4_prefixes: vec!["10.0.0.0/27".parse().unwrap()],
            ipv6_prefixes: vec![],
            mesh4: vec!["10.0.1.1".parse().unwrap(), "10.0.1.2".parse().unwrap()],
        }
    }

    fn wide_pools() -> PoolsConfig {
        PoolsConfig {
            ipv4_prefixes: (0..8)
                .map(|i| format!("10.0.0.{}/28", i * 16).parse().unwrap())
                .collect(),
            ipv6_prefixes: (0..4)
                .map(|i| format!("2001:db8:{}::/56", i + 1).parse().unwrap())
                .collect(),
            mesh4: (1..=20)
                .map(|i| format!("10.0.1.{}", i).parse().unwrap())
                .collect(),
        }
    }

    fn request(host: &str, constituency: u8, ipv4_size: Option<u8>) -> AllocationRequest {
        AllocationRequest {
            host: host.to_string(),
            emails: vec!["owner@example.org".to_string()],
            constituency: validate_constituency(constituency).unwrap(),
            ipv4_size,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_wrong_token_then_expired() {
        let (alloc, _dir) = allocator(small_pools(), 2, chrono::Duration::hours(1)).await;

        let (reservation, token) = alloc
            .request_allocation(request("mynode", 0, Some(27)))
            .await
            .unwrap();
        assert_eq!(reservation.state, ReservationState::Pending);
        assert_eq!(reservation.prefix4(), Some("10.0.0.0/27".parse().unwrap()));
        assert_eq!(reservation.prefix6(), None);
        assert_eq!(
            reservation.mesh4(),
            vec![Ipv4Addr::new(10, 0, 1, 1), Ipv4Addr::new(10, 0, 1, 2)]
        );
        assert!(reservation
            .units
            .iter()
            .all(|u| u.state == UnitState::Reserved && u.holder == Some(reservation.session)));

        let err = alloc
            .confirm_allocation(reservation.session, "not-the-token")
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::TokenMismatch));

        let units = alloc.pool_units(None).await.unwrap();
        assert!(units.iter().all(|u| u.state == UnitState::Free && u.holder.is_none()));

        let expired = alloc.lookup(reservation.session).await.unwrap();
        assert_eq!(expired.state, ReservationState::Expired);
        assert!(expired.units.is_empty());

        let err = alloc
            .confirm_allocation(reservation.session, token.expose())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::Expired));
    }

    #[tokio::test]
    async fn test_confirm_commits_exact_units() {
        let (alloc, _dir) = allocator(wide_pools(), 3, chrono::Duration::hours(1)).await;

        let (reservation, token) = alloc
            .request_allocation(request("mynode", 80, Some(28)))
            .await
            .unwrap();

        let confirmed = alloc
            .confirm_allocation(reservation.session, token.expose())
            .await
            .unwrap();
        assert_eq!(confirmed, ConfirmedAllocation::from(&reservation));
        assert_eq!(confirmed.prefix4, Some("10.0.0.0/28".parse().unwrap()));
        assert_eq!(confirmed.prefix6, Some("2001:db8:1::/56".parse().unwrap()));
        assert_eq!(confirmed.mesh4.len(), 3);

        let stored = alloc.lookup(reservation.session).await.unwrap();
        assert_eq!(stored.state, ReservationState::Confirmed);
        assert!(stored.units.iter().all(|u| u.state == UnitState::Committed));

        let err = alloc
            .confirm_allocation(reservation.session, token.expose())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::AlreadyConfirmed));

        let err = alloc
            .confirm_allocation(Uuid::new_v4(), token.expose())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::NotFound));
    }

    #[tokio::test]
    async fn test_duplicate_hostname_rejected() {
        let (alloc, _dir) = allocator(wide_pools(), 1, chrono::Duration::hours(1)).await;

        alloc
            .request_allocation(request("mynode", 0, Some(28)))
            .await
            .unwrap();
        let err = alloc
            .request_allocation(request("MyNode", 0, Some(28)))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::HostnameInUse(h) if h == "mynode"));

        // The rejected request reserved nothing.
        let status = alloc.status().await.unwrap();
        let mesh = status.pools.iter().find(|s| s.kind == UnitKind::Mesh4).unwrap();
        assert_eq!(mesh.reserved, 1);
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn test_all_or_nothing_when_ipv6_exhausted() {
        let (alloc, _dir) = allocator(small_pools(), 2, chrono::Duration::hours(1)).await;

        let err = alloc
            .request_allocation(request("mynode", 77, Some(27)))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::PoolExhausted(UnitKind::Ipv6Prefix)));

        let units = alloc.pool_units(None).await.unwrap();
        assert!(units.iter().all(|u| u.state == UnitState::Free));
        assert!(alloc
            .list_reservations(&ReservationFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_expert_request_without_ipv4() {
        let (alloc, _dir) = allocator(small_pools(), 1, chrono::Duration::hours(1)).await;

        let (reservation, _token) = alloc
            .request_allocation(request("meshonly", 0, None))
            .await
            .unwrap();
        assert_eq!(reservation.prefix4(), None);
        assert_eq!(reservation.mesh4(), vec![Ipv4Addr::new(10, 0, 1, 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_for_last_prefix() {
        let (alloc, _dir) = allocator(small_pools(), 1, chrono::Duration::hours(1)).await;

        let a = {
            let alloc = alloc.clone();
            tokio::spawn(async move { alloc.request_allocation(request("node-a", 0, Some(27))).await })
        };
        let b = {
            let alloc = alloc.clone();
            tokio::spawn(async move { alloc.request_allocation(request("node-b", 0, Some(27))).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(AllocatorError::PoolExhausted(UnitKind::Ipv4Prefix))))
            .count();
        assert_eq!((ok, exhausted), (1, 1));

        let status = alloc.status().await.unwrap();
        let mesh = status.pools.iter().find(|s| s.kind == UnitKind::Mesh4).unwrap();
        assert_eq!(mesh.reserved, 1);
        assert_eq!(mesh.free, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_for_same_hostname() {
        let (alloc, _dir) = allocator(wide_pools(), 1, chrono::Duration::hours(1)).await;

        let handles: Vec<_> = ["mynode", "MyNode"]
            .into_iter()
            .map(|host| {
                let alloc = alloc.clone();
                tokio::spawn(async move { alloc.request_allocation(request(host, 0, Some(28))).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let in_use = results
            .iter()
            .filter(|r| matches!(r, Err(AllocatorError::HostnameInUse(h)) if h == "mynode"))
            .count();
        assert_eq!((ok, in_use), (1, 1));

        // The loser reserved nothing.
        let status = alloc.status().await.unwrap();
        let v4 = status.pools.iter().find(|s| s.kind == UnitKind::Ipv4Prefix).unwrap();
        let mesh = status.pools.iter().find(|s| s.kind == UnitKind::Mesh4).unwrap();
        assert_eq!((v4.reserved, mesh.reserved), (1, 1));
        assert_eq!(status.pending, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_share_units() {
        let (alloc, _dir) = allocator(wide_pools(), 2, chrono::Duration::hours(1)).await;

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let alloc = alloc.clone();
                tokio::spawn(async move {
                    alloc
                        .request_allocation(request(&format!("node-{}", i), 0, Some(28)))
                        .await
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok((reservation, _)) => {
                    granted += 1;
                    for unit in &reservation.units {
                        assert!(seen.insert(unit.id), "unit {} handed out twice", unit.unit);
                    }
                }
                Err(AllocatorError::PoolExhausted(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        // Eight /28 prefixes limit the number of grants.
        assert_eq!(granted, 8);
        assert_eq!(seen.len(), 8 * 3);
    }

    #[tokio::test]
    async fn test_sweep_releases_units() {
        let (alloc, _dir) = allocator(small_pools(), 2, chrono::Duration::zero()).await;

        let (reservation, token) = alloc
            .request_allocation(request("mynode", 0, Some(27)))
            .await
            .unwrap();

        let expired = alloc
            .expire_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(alloc.expire_stale(Utc::now()).await.unwrap(), 0);

        let units = alloc.pool_units(None).await.unwrap();
        assert!(units.iter().all(|u| u.state == UnitState::Free));

        let err = alloc
            .confirm_allocation(reservation.session, token.expose())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::Expired));

        // The hostname is free again.
        alloc
            .request_allocation(request("mynode", 0, Some(27)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_confirm_expires() {
        let (alloc, _dir) = allocator(small_pools(), 2, chrono::Duration::zero()).await;

        let (reservation, token) = alloc
            .request_allocation(request("mynode", 0, Some(27)))
            .await
            .unwrap();
        let err = alloc
            .confirm_allocation(reservation.session, token.expose())
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::Expired));

        let stored = alloc.lookup(reservation.session).await.unwrap();
        assert_eq!(stored.state, ReservationState::Expired);
        let units = alloc.pool_units(None).await.unwrap();
        assert!(units.iter().all(|u| u.state == UnitState::Free));
    }

    #[tokio::test]
    async fn test_delete_releases_committed_units() {
        let (alloc, _dir) = allocator(small_pools(), 2, chrono::Duration::hours(1)).await;

        let (reservation, token) = alloc
            .request_allocation(request("mynode", 0, Some(27)))
            .await
            .unwrap();
        alloc
            .confirm_allocation(reservation.session, token.expose())
            .await
            .unwrap();

        let deleted = alloc.delete_reservation(reservation.session).await.unwrap();
        assert_eq!(deleted.state, ReservationState::Confirmed);

        let units = alloc.pool_units(None).await.unwrap();
        assert!(units.iter().all(|u| u.state == UnitState::Free && u.holder.is_none()));

        assert!(matches!(
            alloc.lookup(reservation.session).await,
            Err(AllocatorError::NotFound)
        ));
        assert!(matches!(
            alloc.delete_reservation(reservation.session).await,
            Err(AllocatorError::NotFound)
        ));
    }

    #[test]
    fn test_policy_from_config() {
        let config = AllocationConfig {
            mesh_count: 2,
            reservation_ttl_secs: 3600,
            ..AllocationConfig::default()
        };
        let policy = AllocationPolicy::try_from(&config).unwrap();
        assert_eq!(policy.mesh_count, 2);
        assert_eq!(policy.reservation_ttl, chrono::Duration::hours(1));

        let huge = AllocationConfig {
            reservation_ttl_secs: 10_000_000_000_000_000,
            ..AllocationConfig::default()
        };
        assert!(matches!(
            AllocationPolicy::try_from(&huge),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = ConfirmationToken::new("super-secret".to_string());
        assert!(!format!("{:?}", token).contains("super-secret"));
        assert_eq!(token.expose(), "super-secret");
    }
}
