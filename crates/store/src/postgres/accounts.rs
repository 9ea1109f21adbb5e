/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::{Account, Credential, Error, Result, Store};

use super::{into_error, PgStore};

fn credential_from_row(row: &Row) -> Credential {
    Credential {
        id: row.get("id"),
        account_id: row.get("account_id"),
        address: row.get("address"),
        password_hash: row.get("password_hash"),
        is_primary: row.get("is_primary"),
    }
}

impl PgStore {
    pub async fn create_account(
        &self,
        address: &str,
        password_hash: &str,
    ) -> Result<Account> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let row = tx
            .query_one(
                "INSERT INTO accounts DEFAULT VALUES RETURNING id, created_at, deleted_at",
                &[],
            )
            .await
            .map_err(into_error)?;
        let account = Account {
            id: row.get("id"),
            created_at: row.get("created_at"),
            deleted_at: row.get("deleted_at"),
        };

        tx.execute(
            "INSERT INTO credentials (account_id, address, password_hash, is_primary)
             VALUES ($1, $2, $3, true)",
            &[&account.id, &address, &password_hash],
        )
        .await
        .map_err(|err| match into_error(err) {
            err if err.is_unique_violation() => {
                Error::already_exists("Address already registered")
            }
            err => err,
        })?;

        // An active account always has an INBOX.
        tx.execute(
            "INSERT INTO mailboxes (account_id, name) VALUES ($1, 'INBOX')",
            &[&account.id],
        )
        .await
        .map_err(into_error)?;

        tx.commit().await.map_err(into_error)?;
        Ok(account)
    }

    pub async fn account_by_id(&self, account_id: i64) -> Result<Option<Account>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query_opt(
                "SELECT id, created_at, deleted_at FROM accounts WHERE id = $1",
                &[&account_id],
            )
            .await
            .map_err(into_error)?
            .map(|row| Account {
                id: row.get("id"),
                created_at: row.get("created_at"),
                deleted_at: row.get("deleted_at"),
            }))
    }

    /// Soft-deletes an account; a later purge task removes the data.
    pub async fn delete_account(&self, account_id: i64) -> Result<()> {
        let conn = self.write_conn().await?;
        let updated = conn
            .execute(
                "UPDATE accounts SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
                &[&account_id],
            )
            .await
            .map_err(into_error)?;
        if updated == 0 {
            return Err(Error::not_found("Account does not exist"));
        }
        Ok(())
    }

    pub async fn restore_account(&self, account_id: i64) -> Result<()> {
        let conn = self.write_conn().await?;
        let updated = conn
            .execute(
                "UPDATE accounts SET deleted_at = NULL WHERE id = $1 AND deleted_at IS NOT NULL",
                &[&account_id],
            )
            .await
            .map_err(into_error)?;
        if updated == 0 {
            return Err(Error::not_found("No soft-deleted account with this id"));
        }
        Ok(())
    }

    /// Resolves a login name to its credential, ignoring soft-deleted
    /// accounts.
    pub async fn credential_by_address(&self, address: &str) -> Result<Option<Credential>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query_opt(
                "SELECT c.id, c.account_id, c.address, c.password_hash, c.is_primary
                 FROM credentials c
                 JOIN accounts a ON a.id = c.account_id
                 WHERE lower(c.address) = lower($1) AND a.deleted_at IS NULL",
                &[&address],
            )
            .await
            .map_err(into_error)?
            .map(|row| credential_from_row(&row)))
    }

    /// Variant that also matches soft-deleted accounts, for restore tooling.
    pub async fn credential_by_address_any(&self, address: &str) -> Result<Option<Credential>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query_opt(
                "SELECT id, account_id, address, password_hash, is_primary
                 FROM credentials WHERE lower(address) = lower($1)",
                &[&address],
            )
            .await
            .map_err(into_error)?
            .map(|row| credential_from_row(&row)))
    }

    pub async fn list_credentials(&self, account_id: i64) -> Result<Vec<Credential>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                "SELECT id, account_id, address, password_hash, is_primary
                 FROM credentials WHERE account_id = $1 ORDER BY address",
                &[&account_id],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(credential_from_row)
            .collect())
    }

    pub async fn add_credential(
        &self,
        account_id: i64,
        address: &str,
        password_hash: &str,
    ) -> Result<Credential> {
        let conn = self.write_conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO credentials (account_id, address, password_hash, is_primary)
                 VALUES ($1, $2, $3, false)
                 RETURNING id, account_id, address, password_hash, is_primary",
                &[&account_id, &address, &password_hash],
            )
            .await
            .map_err(|err| match into_error(err) {
                err if err.is_unique_violation() => {
                    Error::already_exists("Address already registered")
                }
                err => err,
            })?;
        Ok(credential_from_row(&row))
    }

    /// Refuses to delete the primary credential while others remain.
    pub async fn delete_credential(&self, address: &str) -> Result<()> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let row = tx
            .query_opt(
                "SELECT id, account_id, is_primary FROM credentials
                 WHERE lower(address) = lower($1) FOR UPDATE",
                &[&address],
            )
            .await
            .map_err(into_error)?
            .ok_or_else(|| Error::not_found("Credential does not exist"))?;
        let id: i64 = row.get("id");
        let account_id: i64 = row.get("account_id");
        let is_primary: bool = row.get("is_primary");

        if is_primary {
            let others: i64 = tx
                .query_one(
                    "SELECT count(*) FROM credentials WHERE account_id = $1 AND id != $2",
                    &[&account_id, &id],
                )
                .await
                .map_err(into_error)?
                .get(0);
            if others > 0 {
                return Err(Error::forbidden(
                    "Cannot delete the primary credential while others remain",
                ));
            }
        }

        tx.execute("DELETE FROM credentials WHERE id = $1", &[&id])
            .await
            .map_err(into_error)?;
        tx.commit().await.map_err(into_error)?;
        Ok(())
    }

    pub async fn set_primary_credential(&self, address: &str) -> Result<()> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let row = tx
            .query_opt(
                "SELECT id, account_id FROM credentials WHERE lower(address) = lower($1)",
                &[&address],
            )
            .await
            .map_err(into_error)?
            .ok_or_else(|| Error::not_found("Credential does not exist"))?;
        let id: i64 = row.get("id");
        let account_id: i64 = row.get("account_id");

        tx.execute(
            "UPDATE credentials SET is_primary = false WHERE account_id = $1 AND is_primary",
            &[&account_id],
        )
        .await
        .map_err(into_error)?;
        tx.execute(
            "UPDATE credentials SET is_primary = true WHERE id = $1",
            &[&id],
        )
        .await
        .map_err(into_error)?;

        tx.commit().await.map_err(into_error)?;
        Ok(())
    }

    /// Accounts soft-deleted before the cutoff, due for permanent purge.
    pub async fn purgeable_accounts(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                "SELECT id FROM accounts WHERE deleted_at IS NOT NULL AND deleted_at < $1",
                &[&cutoff],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(|row| row.get(0))
            .collect())
    }

    pub async fn purge_account(&self, account_id: i64) -> Result<()> {
        let conn = self.write_conn().await?;
        conn.execute(
            "DELETE FROM accounts WHERE id = $1 AND deleted_at IS NOT NULL",
            &[&account_id],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }
}

impl Store {
    pub async fn create_account(&self, address: &str, password_hash: &str) -> Result<Account> {
        self.run(|| self.pg.create_account(address, password_hash))
            .await
    }

    pub async fn credential_by_address(&self, address: &str) -> Result<Option<Credential>> {
        self.run(|| self.pg.credential_by_address(address)).await
    }

    pub async fn list_credentials(&self, account_id: i64) -> Result<Vec<Credential>> {
        self.run(|| self.pg.list_credentials(account_id)).await
    }

    pub async fn delete_account(&self, account_id: i64) -> Result<()> {
        self.run(|| self.pg.delete_account(account_id)).await
    }

    pub async fn restore_account(&self, account_id: i64) -> Result<()> {
        self.run(|| self.pg.restore_account(account_id)).await
    }
}
