/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::IpAddr;

use tokio_postgres::Row;

use crate::{ActiveConnection, KickCriteria, Result, Store};

use super::{into_error, PgStore};

fn connection_from_row(row: &Row) -> ActiveConnection {
    ActiveConnection {
        id: row.get("id"),
        account_id: row.get("account_id"),
        email: row.get("email"),
        protocol: row.get("protocol"),
        client_addr: row.get("client_addr"),
        server_addr: row.get("server_addr"),
        connected_at: row.get("connected_at"),
        termination_requested_at: row.get("termination_requested_at"),
    }
}

const CONNECTION_COLUMNS: &str =
    "id, account_id, email, protocol, client_addr, server_addr, connected_at, \
     termination_requested_at";

impl PgStore {
    /// Registers an authenticated session; returns the row id the session
    /// polls for termination requests.
    pub async fn register_connection(
        &self,
        account_id: i64,
        email: &str,
        protocol: &str,
        client_addr: &str,
        server_addr: &str,
    ) -> Result<i64> {
        let conn = self.write_conn().await?;
        Ok(conn
            .query_one(
                "INSERT INTO active_connections
                    (account_id, email, protocol, client_addr, server_addr)
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[&account_id, &email, &protocol, &client_addr, &server_addr],
            )
            .await
            .map_err(into_error)?
            .get(0))
    }

    pub async fn unregister_connection(&self, connection_id: i64) -> Result<()> {
        let conn = self.write_conn().await?;
        conn.execute(
            "DELETE FROM active_connections WHERE id = $1",
            &[&connection_id],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }

    /// Whether an admin asked this session to drop; polled on the session's
    /// next tick.
    pub async fn termination_requested(&self, connection_id: i64) -> Result<bool> {
        let conn = self.read_conn(true).await?;
        Ok(conn
            .query_opt(
                "SELECT termination_requested_at IS NOT NULL
                 FROM active_connections WHERE id = $1",
                &[&connection_id],
            )
            .await
            .map_err(into_error)?
            .map(|row| row.get(0))
            // A vanished row means the connection was kicked and reaped.
            .unwrap_or(true))
    }

    pub async fn list_connections(&self) -> Result<Vec<ActiveConnection>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM active_connections ORDER BY connected_at"
                ),
                &[],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(connection_from_row)
            .collect())
    }

    /// Flags matching sessions for termination; returns how many matched.
    pub async fn kick_connections(&self, criteria: &KickCriteria) -> Result<u64> {
        let conn = self.write_conn().await?;
        conn.execute(
            "UPDATE active_connections SET termination_requested_at = now()
             WHERE termination_requested_at IS NULL
               AND ($1::text IS NULL OR email = $1)
               AND ($2::text IS NULL OR protocol = $2)
               AND ($3::text IS NULL OR client_addr = $3)
               AND ($4::text IS NULL OR server_addr = $4)",
            &[
                &criteria.email,
                &criteria.protocol,
                &criteria.client_addr,
                &criteria.server_addr,
            ],
        )
        .await
        .map_err(into_error)
    }

    /// Removes rows left behind by a crashed instance.
    pub async fn prune_stale_connections(&self, max_age: chrono::Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now() - max_age;
        let conn = self.write_conn().await?;
        conn.execute(
            "DELETE FROM active_connections WHERE connected_at < $1",
            &[&cutoff],
        )
        .await
        .map_err(into_error)
    }

    pub async fn record_auth_attempt(
        &self,
        ip: IpAddr,
        username: &str,
        success: bool,
    ) -> Result<()> {
        let conn = self.write_conn().await?;
        conn.execute(
            "INSERT INTO auth_attempts (ip, username, success) VALUES ($1, $2, $3)",
            &[&ip.to_string(), &username, &success],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }

    pub async fn write_health_status(
        &self,
        component: &str,
        hostname: &str,
        status: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let conn = self.write_conn().await?;
        conn.execute(
            "INSERT INTO health_status (component, hostname, status, details, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (component, hostname) DO UPDATE SET
                status = EXCLUDED.status,
                details = EXCLUDED.details,
                updated_at = now()",
            &[&component, &hostname, &status, &details],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }
}

impl Store {
    pub async fn register_connection(
        &self,
        account_id: i64,
        email: &str,
        protocol: &str,
        client_addr: &str,
        server_addr: &str,
    ) -> Result<i64> {
        self.run(|| {
            self.pg
                .register_connection(account_id, email, protocol, client_addr, server_addr)
        })
        .await
    }

    pub async fn unregister_connection(&self, connection_id: i64) -> Result<()> {
        self.run(|| self.pg.unregister_connection(connection_id))
            .await
    }

    pub async fn termination_requested(&self, connection_id: i64) -> Result<bool> {
        self.run(|| self.pg.termination_requested(connection_id))
            .await
    }

    pub async fn list_connections(&self) -> Result<Vec<ActiveConnection>> {
        self.run(|| self.pg.list_connections()).await
    }

    pub async fn kick_connections(&self, criteria: &KickCriteria) -> Result<u64> {
        self.run(|| self.pg.kick_connections(criteria)).await
    }

    pub async fn record_auth_attempt(
        &self,
        ip: IpAddr,
        username: &str,
        success: bool,
    ) -> Result<()> {
        self.run(|| self.pg.record_auth_attempt(ip, username, success))
            .await
    }

    pub async fn write_health_status(
        &self,
        component: &str,
        hostname: &str,
        status: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        self.run(|| {
            self.pg
                .write_health_status(component, hostname, status, details.clone())
        })
        .await
    }
}
