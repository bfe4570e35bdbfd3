//! Relational persistence for the tunnel broker (spec §3, §4.1).
//!
//! The Store is the only component in this workspace that talks SQL. It
//! is deliberately thin: every method here is named after the operation
//! the broker's core actually performs, not after a generic CRUD surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod model;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

pub use error::StoreError;
pub use model::{ConnectionRecord, ConnectionStatus, PortAssignment, Session, SessionStatus, Team, Token};

/// The terminal statuses a [`ConnectionRecord`] may be closed with.
/// `active` is excluded at the type level: invariant #3 (spec §8) says a
/// record is never left active past Tunnel close, so there is no way to
/// call [`Store::end_connection_record`] with the one status that would
/// violate it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalStatus {
    /// The bridge completed cleanly on both halves.
    Closed,
    /// A bridge half (or the pairing) failed with a non-EOF error.
    Error,
    /// The pairing slot was never delivered within the timeout.
    Timeout,
}

impl From<TerminalStatus> for ConnectionStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Closed => ConnectionStatus::Closed,
            TerminalStatus::Error => ConnectionStatus::Error,
            TerminalStatus::Timeout => ConnectionStatus::Timeout,
        }
    }
}

/// Handle to the relational store backing the broker.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to `database_url` and run any pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Store { pool })
    }

    /// Build a Store from an already-connected pool, skipping migrations.
    /// Used by tests against a pool a fixture has already migrated.
    pub fn from_pool(pool: PgPool) -> Self {
        Store { pool }
    }

    /// Look up an active, non-expired token by its secret, along with its
    /// unique port assignment. Bumps `last_used_at` on success; a failure
    /// to do so is logged and does not fail the call (spec §4.1).
    pub async fn authenticate(&self, secret: &str) -> Result<(Token, PortAssignment), StoreError> {
        let token = sqlx::query_as::<_, Token>(
            r#"
            SELECT t.id, t.secret, t.team_id, t.expires_at, t.active, t.last_used_at, t.created_at
            FROM tokens t
            JOIN teams tm ON tm.id = t.team_id
            WHERE t.secret = $1 AND t.active AND NOT tm.deleted
            "#,
        )
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        if !token.is_usable(Utc::now()) {
            return Err(StoreError::Expired);
        }

        let assignment = sqlx::query_as::<_, PortAssignment>(
            "SELECT id, port, protocol, token_id, created_at FROM port_assignments WHERE token_id = $1",
        )
        .bind(token.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        if let Err(err) = sqlx::query("UPDATE tokens SET last_used_at = now() WHERE id = $1")
            .bind(token.id)
            .execute(&self.pool)
            .await
        {
            warn!(token_id = %token.id, %err, "failed to update token last-used timestamp");
        }

        Ok((token, assignment))
    }

    /// Start a new session for a freshly-opened (or restored-and-attached)
    /// tunnel.
    pub async fn start_session(
        &self,
        token: &Token,
        port_assignment: &PortAssignment,
        client_ip: IpAddr,
        server_port: u16,
        protocol: &str,
    ) -> Result<Session, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, team_id, token_id, port_assignment_id, client_ip, server_port, protocol, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
            "#,
        )
        .bind(id)
        .bind(token.team_id)
        .bind(token.id)
        .bind(port_assignment.id)
        .bind(client_ip.to_string())
        .bind(i32::from(server_port))
        .bind(protocol)
        .execute(&self.pool)
        .await?;

        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(session)
    }

    /// Create a connection record for a freshly accepted external socket.
    pub async fn start_connection_record(
        &self,
        session_id: Uuid,
        client_ip: IpAddr,
        client_port: u16,
        server_port: u16,
    ) -> Result<ConnectionRecord, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO connection_records
                (id, session_id, client_ip, client_port, server_port, status)
            VALUES ($1, $2, $3, $4, $5, 'active')
            "#,
        )
        .bind(id)
        .bind(session_id)
        .bind(client_ip.to_string())
        .bind(i32::from(client_port))
        .bind(i32::from(server_port))
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, ConnectionRecord>(
            "SELECT * FROM connection_records WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Bump `last_seen_at` for a session. Last-seen is monotonically
    /// non-decreasing; `now()` always satisfies that for a single row.
    pub async fn touch_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_seen_at = now() WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a session inactive. Idempotent: calling this twice, or on a
    /// session already inactive from a stale sweep, is harmless.
    pub async fn end_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET status = 'inactive' WHERE id = $1 AND status = 'active'")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// End a connection record with a terminal status. Idempotent: a
    /// record already in a terminal state is left untouched.
    pub async fn end_connection_record(
        &self,
        record_id: Uuid,
        status: TerminalStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let status: ConnectionStatus = status.into();
        sqlx::query(
            r#"
            UPDATE connection_records
            SET status = $2, error_message = $3, ended_at = now()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(record_id)
        .bind(status.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Accumulate byte counters for a connection record. Negative deltas
    /// are rejected outright rather than silently clamped.
    pub async fn update_bytes(
        &self,
        record_id: Uuid,
        bytes_in: i64,
        bytes_out: i64,
    ) -> Result<(), StoreError> {
        if bytes_in < 0 || bytes_out < 0 {
            return Err(StoreError::InvalidInput("byte deltas must be non-negative"));
        }
        sqlx::query(
            r#"
            UPDATE connection_records
            SET bytes_in = bytes_in + $2, bytes_out = bytes_out + $3
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(bytes_in)
        .bind(bytes_out)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark every active session whose `last_seen_at` is older than
    /// `threshold` as inactive. Returns how many were swept.
    pub async fn sweep_stale(&self, threshold: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'inactive'
            WHERE status = 'active'
              AND last_seen_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(threshold.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Active sessions grouped by their assigned public port. The first
    /// session in each group is authoritative for restoring that port's
    /// Tunnel, since a port is owned by exactly one token.
    pub async fn restore_active(&self) -> Result<HashMap<u16, Vec<Session>>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: Uuid,
            team_id: Uuid,
            token_id: Uuid,
            port_assignment_id: Uuid,
            client_ip: String,
            server_port: i32,
            protocol: String,
            started_at: chrono::DateTime<Utc>,
            last_seen_at: chrono::DateTime<Utc>,
            status: String,
            pub_port: i32,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT
                s.id, s.team_id, s.token_id, s.port_assignment_id, s.client_ip,
                s.server_port, s.protocol, s.started_at, s.last_seen_at, s.status,
                pa.port AS pub_port
            FROM sessions s
            JOIN port_assignments pa ON pa.id = s.port_assignment_id
            WHERE s.status = 'active'
            ORDER BY pa.port, s.started_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<u16, Vec<Session>> = HashMap::new();
        for row in rows {
            let session = Session {
                id: row.id,
                team_id: row.team_id,
                token_id: row.token_id,
                port_assignment_id: row.port_assignment_id,
                client_ip: row.client_ip,
                server_port: row.server_port,
                protocol: row.protocol,
                started_at: row.started_at,
                last_seen_at: row.last_seen_at,
                status: row.status,
            };
            grouped.entry(row.pub_port as u16).or_default().push(session);
        }
        Ok(grouped)
    }

    /// Mark a session `error`'d during restoration (e.g. bind failure).
    /// Restoration is best-effort: this never fails the whole sweep.
    pub async fn mark_session_restore_failed(&self, session_id: Uuid) -> Result<(), StoreError> {
        self.end_session(session_id).await
    }

    /// The pool backing this store, for components (tests, migrations
    /// tooling) that need direct access.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
