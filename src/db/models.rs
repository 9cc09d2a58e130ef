//! Database model definitions.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::Constituency;

/// Kind of allocatable unit. Each kind forms its own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Ipv4Prefix,
    Ipv6Prefix,
    Mesh4,
}

impl UnitKind {
    pub const ALL: [UnitKind; 3] = [UnitKind::Ipv4Prefix, UnitKind::Ipv6Prefix, UnitKind::Mesh4];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Ipv4Prefix => "ipv4_prefix",
            UnitKind::Ipv6Prefix => "ipv6_prefix",
            UnitKind::Mesh4 => "mesh4",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4_prefix" => Ok(UnitKind::Ipv4Prefix),
            "ipv6_prefix" => Ok(UnitKind::Ipv6Prefix),
            "mesh4" => Ok(UnitKind::Mesh4),
            other => Err(format!("unknown unit kind '{}'", other)),
        }
    }
}

/// Allocation state of a pool unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Free,
    Reserved,
    Committed,
}

impl UnitState {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Free => "free",
            UnitState::Reserved => "reserved",
            UnitState::Committed => "committed",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(UnitState::Free),
            "reserved" => Ok(UnitState::Reserved),
            "committed" => Ok(UnitState::Committed),
            other => Err(format!("unknown unit state '{}'", other)),
        }
    }
}

/// One allocatable prefix or mesh address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUnit {
    pub id: i64,
    pub kind: UnitKind,
    /// Mesh addresses are stored as host routes (/32).
    pub unit: IpNet,
    pub state: UnitState,
    pub holder: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Pending,
    Confirmed,
    Expired,
}

impl ReservationState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationState::Pending => "pending",
            ReservationState::Confirmed => "confirmed",
            ReservationState::Expired => "expired",
        }
    }

    /// Pending and confirmed reservations hold units and their hostname.
    pub fn is_active(self) -> bool {
        !matches!(self, ReservationState::Expired)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationState::Pending),
            "confirmed" => Ok(ReservationState::Confirmed),
            "expired" => Ok(ReservationState::Expired),
            other => Err(format!("unknown reservation state '{}'", other)),
        }
    }
}

/// A router's hold on pool units, keyed by its session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub session: Uuid,
    pub host: String,
    pub emails: Vec<String>,
    pub constituency: Constituency,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Empty once the reservation expired.
    pub units: Vec<PoolUnit>,
}

impl Reservation {
    pub fn unit_ids(&self) -> Vec<i64> {
        self.units.iter().map(|u| u.id).collect()
    }

    /// Whether a pending reservation ran past its confirmation deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Pending && self.expires_at <= now
    }

    pub fn prefix4(&self) -> Option<Ipv4Net> {
        self.units.iter().find_map(|u| match (u.kind, u.unit) {
            (UnitKind::Ipv4Prefix, IpNet::V4(net)) => Some(net),
            _ => None,
        })
    }

    pub fn prefix6(&self) -> Option<Ipv6Net> {
        self.units.iter().find_map(|u| match (u.kind, u.unit) {
            (UnitKind::Ipv6Prefix, IpNet::V6(net)) => Some(net),
            _ => None,
        })
    }

    pub fn mesh4(&self) -> Vec<Ipv4Addr> {
        self.units
            .iter()
            .filter_map(|u| match (u.kind, u.unit) {
                (UnitKind::Mesh4, IpNet::V4(net)) => Some(net.addr()),
                _ => None,
            })
            .collect()
    }
}

/// A bearer token for the administrative API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorToken {
    pub id: i64,
    pub token_hash: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl OperatorToken {
    /// Check if the token is valid (not revoked and not expired).
    pub fn is_valid(&self) -> bool {
        if self.revoked {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at < Utc::now() {
                return false;
            }
        }
        true
    }
}

/// Per-kind unit counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub kind: UnitKind,
    pub free: i64,
    pub reserved: i64,
    pub committed: i64,
}

impl PoolStats {
    pub fn total(&self) -> i64 {
        self.free + self.reserved + self.committed
    }
}
