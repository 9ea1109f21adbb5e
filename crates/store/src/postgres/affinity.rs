/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::{DateTime, Utc};

use crate::{Result, Store};

use super::{into_error, PgStore};

/// Persisted affinity hints; the in-process cache in `common` fronts these
/// rows so a proxy restart does not lose routing history.
impl PgStore {
    pub async fn affinity_get(
        &self,
        account: &str,
        protocol: &str,
        max_age: chrono::Duration,
    ) -> Result<Option<String>> {
        let cutoff = Utc::now() - max_age;
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query_opt(
                "SELECT backend FROM server_affinity
                 WHERE account = $1 AND protocol = $2 AND updated_at >= $3",
                &[&account, &protocol, &cutoff],
            )
            .await
            .map_err(into_error)?
            .map(|row| row.get(0)))
    }

    pub async fn affinity_set(&self, account: &str, protocol: &str, backend: &str) -> Result<()> {
        let conn = self.write_conn().await?;
        conn.execute(
            "INSERT INTO server_affinity (account, protocol, backend)
             VALUES ($1, $2, $3)
             ON CONFLICT (account, protocol) DO UPDATE SET
                backend = EXCLUDED.backend,
                updated_at = now()",
            &[&account, &protocol, &backend],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }

    pub async fn affinity_delete(&self, account: &str, protocol: &str) -> Result<()> {
        let conn = self.write_conn().await?;
        conn.execute(
            "DELETE FROM server_affinity WHERE account = $1 AND protocol = $2",
            &[&account, &protocol],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }

    pub async fn affinity_list(&self) -> Result<Vec<(String, String, String, DateTime<Utc>)>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                "SELECT account, protocol, backend, updated_at
                 FROM server_affinity ORDER BY account, protocol",
                &[],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(|row| {
                (
                    row.get(0),
                    row.get(1),
                    row.get(2),
                    row.get(3),
                )
            })
            .collect())
    }
}

impl Store {
    pub async fn affinity_get(
        &self,
        account: &str,
        protocol: &str,
        max_age: chrono::Duration,
    ) -> Result<Option<String>> {
        self.run(|| self.pg.affinity_get(account, protocol, max_age))
            .await
    }

    pub async fn affinity_set(&self, account: &str, protocol: &str, backend: &str) -> Result<()> {
        self.run(|| self.pg.affinity_set(account, protocol, backend))
            .await
    }
}
