//! Row types for the entities the core reads and writes (spec §3).
//!
//! These mirror the columns in `migrations/` exactly; no column exists
//! here that the core does not consume, per spec §6.3.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Owning principal. The core never creates, deletes, or mutates a team;
/// it only reads `deleted` to decide whether tokens under it are usable.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Team {
    /// A team is usable iff it has not been soft-deleted. This resolves
    /// the `is_active`/`deleted` open question in favor of `deleted`
    /// being the sole source of truth.
    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}

/// Credential held by an agent.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Token {
    pub id: Uuid,
    pub secret: String,
    pub team_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Whether this token, on its own (ignoring team liveness), is usable.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

/// Pre-allocated public TCP port owned by exactly one [`Token`].
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct PortAssignment {
    pub id: Uuid,
    pub port: i32,
    pub protocol: String,
    pub token_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl PortAssignment {
    /// The port as a `u16`, the type every networking API in this crate
    /// actually wants. Port rows are constrained to `[10000, 20000]` by
    /// the schema, so this never truncates.
    pub fn port_u16(&self) -> u16 {
        self.port as u16
    }
}

/// Status of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Inactive,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
        })
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "inactive" => Ok(SessionStatus::Inactive),
            other => Err(format!("unrecognized session status {other:?}")),
        }
    }
}

/// A run of a Tunnel on a specific (token, port). Survives broker
/// restarts so the public port number stays stable for the token.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub team_id: Uuid,
    pub token_id: Uuid,
    pub port_assignment_id: Uuid,
    pub client_ip: String,
    pub server_port: i32,
    pub protocol: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: String,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.status
            .parse()
            .expect("status column is constrained by a CHECK, parse cannot fail")
    }
}

/// Status a [`ConnectionRecord`] may be in. Restricted to exactly the
/// four values the CHECK constraint allows — there is no Rust value that
/// can construct the disallowed `info` status the original system wrote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Closed,
    Error,
    Timeout,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Timeout => "timeout",
        })
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConnectionStatus::Active),
            "closed" => Ok(ConnectionStatus::Closed),
            "error" => Ok(ConnectionStatus::Error),
            "timeout" => Ok(ConnectionStatus::Timeout),
            other => Err(format!("unrecognized connection status {other:?}")),
        }
    }
}

/// One external connection through a Tunnel.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub client_ip: String,
    pub client_port: i32,
    pub server_port: i32,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
}

impl ConnectionRecord {
    pub fn status(&self) -> ConnectionStatus {
        self.status
            .parse()
            .expect("status column is constrained by a CHECK, parse cannot fail")
    }
}
