/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use tokio_postgres::Row;

use crate::{Error, Result, SieveScript, Store};

use super::{into_error, PgStore};

fn script_from_row(row: &Row) -> SieveScript {
    SieveScript {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        script: row.get("script"),
        active: row.get("active"),
    }
}

const SCRIPT_COLUMNS: &str = "id, account_id, name, script, active";

impl PgStore {
    pub async fn list_sieve_scripts(&self, account_id: i64) -> Result<Vec<SieveScript>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                &format!(
                    "SELECT {SCRIPT_COLUMNS} FROM sieve_scripts
                     WHERE account_id = $1 ORDER BY name"
                ),
                &[&account_id],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(script_from_row)
            .collect())
    }

    pub async fn sieve_script_by_name(
        &self,
        account_id: i64,
        name: &str,
    ) -> Result<Option<SieveScript>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query_opt(
                &format!(
                    "SELECT {SCRIPT_COLUMNS} FROM sieve_scripts
                     WHERE account_id = $1 AND name = $2"
                ),
                &[&account_id, &name],
            )
            .await
            .map_err(into_error)?
            .map(|row| script_from_row(&row)))
    }

    pub async fn active_sieve_script(&self, account_id: i64) -> Result<Option<SieveScript>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query_opt(
                &format!(
                    "SELECT {SCRIPT_COLUMNS} FROM sieve_scripts
                     WHERE account_id = $1 AND active"
                ),
                &[&account_id],
            )
            .await
            .map_err(into_error)?
            .map(|row| script_from_row(&row)))
    }

    /// Upserts a script body; the caller validates it by compiling first.
    pub async fn put_sieve_script(
        &self,
        account_id: i64,
        name: &str,
        script: &str,
        max_scripts: i64,
    ) -> Result<SieveScript> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let count: i64 = tx
            .query_one(
                "SELECT count(*) FROM sieve_scripts WHERE account_id = $1 AND name != $2",
                &[&account_id, &name],
            )
            .await
            .map_err(into_error)?
            .get(0);
        if count >= max_scripts {
            return Err(Error::quota_exceeded("Too many scripts"));
        }

        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO sieve_scripts (account_id, name, script)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (account_id, name) DO UPDATE SET
                        script = EXCLUDED.script,
                        updated_at = now()
                     RETURNING {SCRIPT_COLUMNS}"
                ),
                &[&account_id, &name, &script],
            )
            .await
            .map_err(into_error)?;

        tx.commit().await.map_err(into_error)?;
        Ok(script_from_row(&row))
    }

    /// Activation flips atomically: at most one script is active afterwards.
    /// An empty name deactivates all scripts (SETACTIVE "").
    pub async fn set_active_sieve_script(&self, account_id: i64, name: &str) -> Result<()> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        tx.execute(
            "UPDATE sieve_scripts SET active = false WHERE account_id = $1 AND active",
            &[&account_id],
        )
        .await
        .map_err(into_error)?;

        if !name.is_empty() {
            let updated = tx
                .execute(
                    "UPDATE sieve_scripts SET active = true
                     WHERE account_id = $1 AND name = $2",
                    &[&account_id, &name],
                )
                .await
                .map_err(into_error)?;
            if updated == 0 {
                return Err(Error::not_found("Script does not exist"));
            }
        }

        tx.commit().await.map_err(into_error)?;
        Ok(())
    }

    /// The active script cannot be deleted (RFC 5804 §2.10).
    pub async fn delete_sieve_script(&self, account_id: i64, name: &str) -> Result<()> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let row = tx
            .query_opt(
                "SELECT active FROM sieve_scripts
                 WHERE account_id = $1 AND name = $2 FOR UPDATE",
                &[&account_id, &name],
            )
            .await
            .map_err(into_error)?
            .ok_or_else(|| Error::not_found("Script does not exist"))?;
        if row.get::<_, bool>(0) {
            return Err(Error::forbidden("Cannot delete the active script"));
        }

        tx.execute(
            "DELETE FROM sieve_scripts WHERE account_id = $1 AND name = $2",
            &[&account_id, &name],
        )
        .await
        .map_err(into_error)?;
        tx.commit().await.map_err(into_error)?;
        Ok(())
    }

    pub async fn rename_sieve_script(
        &self,
        account_id: i64,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let conn = self.write_conn().await?;
        let updated = conn
            .execute(
                "UPDATE sieve_scripts SET name = $3, updated_at = now()
                 WHERE account_id = $1 AND name = $2",
                &[&account_id, &from, &to],
            )
            .await
            .map_err(|err| match into_error(err) {
                err if err.is_unique_violation() => {
                    Error::already_exists("A script with that name already exists")
                }
                err => err,
            })?;
        if updated == 0 {
            return Err(Error::not_found("Script does not exist"));
        }
        Ok(())
    }
}

impl Store {
    pub async fn list_sieve_scripts(&self, account_id: i64) -> Result<Vec<SieveScript>> {
        self.run(|| self.pg.list_sieve_scripts(account_id)).await
    }

    pub async fn sieve_script_by_name(
        &self,
        account_id: i64,
        name: &str,
    ) -> Result<Option<SieveScript>> {
        self.run(|| self.pg.sieve_script_by_name(account_id, name))
            .await
    }

    pub async fn active_sieve_script(&self, account_id: i64) -> Result<Option<SieveScript>> {
        self.run(|| self.pg.active_sieve_script(account_id)).await
    }

    pub async fn put_sieve_script(
        &self,
        account_id: i64,
        name: &str,
        script: &str,
        max_scripts: i64,
    ) -> Result<SieveScript> {
        self.run(|| self.pg.put_sieve_script(account_id, name, script, max_scripts))
            .await
    }

    pub async fn set_active_sieve_script(&self, account_id: i64, name: &str) -> Result<()> {
        self.run(|| self.pg.set_active_sieve_script(account_id, name))
            .await
    }

    pub async fn delete_sieve_script(&self, account_id: i64, name: &str) -> Result<()> {
        self.run(|| self.pg.delete_sieve_script(account_id, name))
            .await
    }

    pub async fn rename_sieve_script(&self, account_id: i64, from: &str, to: &str) -> Result<()> {
        self.run(|| self.pg.rename_sieve_script(account_id, from, to))
            .await
    }
}
