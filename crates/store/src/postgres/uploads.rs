/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use tokio_postgres::Row;

use crate::{PendingUpload, Result, Store};

use super::{into_error, PgStore};

fn upload_from_row(row: &Row) -> PendingUpload {
    PendingUpload {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        content_hash: row.get("content_hash"),
        account_id: row.get("account_id"),
        size: row.get("size"),
        attempts: row.get("attempts"),
        created_at: row.get("created_at"),
    }
}

impl PgStore {
    /// Claims a batch of due uploads with SKIP LOCKED so concurrent instances
    /// never double-claim a row.
    pub async fn claim_pending_uploads(
        &self,
        max_attempts: i32,
        batch_size: i64,
    ) -> Result<Vec<PendingUpload>> {
        let conn = self.write_conn().await?;
        Ok(conn
            .query(
                "SELECT id, instance_id, content_hash, account_id, size, attempts, created_at
                 FROM pending_uploads
                 WHERE (attempts < $1)
                   AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                 ORDER BY created_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED",
                &[&max_attempts, &batch_size],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(upload_from_row)
            .collect())
    }

    /// Finalizes a successful upload: flips every message row referencing the
    /// hash and drops the queue row, in one transaction.
    pub async fn complete_upload(&self, content_hash: &str) -> Result<()> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;
        tx.execute(
            "UPDATE messages SET uploaded = true WHERE content_hash = $1 AND NOT uploaded",
            &[&content_hash],
        )
        .await
        .map_err(into_error)?;
        tx.execute(
            "DELETE FROM pending_uploads WHERE content_hash = $1",
            &[&content_hash],
        )
        .await
        .map_err(into_error)?;
        tx.commit().await.map_err(into_error)?;
        Ok(())
    }

    /// Records a failed attempt and schedules the next one. Rows past
    /// `max_attempts` stay put for operator attention.
    pub async fn fail_upload(&self, id: i64, backoff: Duration) -> Result<()> {
        let backoff_secs = backoff.as_secs() as f64;
        let conn = self.write_conn().await?;
        conn.execute(
            "UPDATE pending_uploads SET
                attempts = attempts + 1,
                last_attempt_at = now(),
                next_attempt_at = now() + ($2 * interval '1 second')
             WHERE id = $1",
            &[&id, &backoff_secs],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }

    /// Queue rows that exhausted their attempts.
    pub async fn failed_uploads(&self, max_attempts: i32) -> Result<Vec<PendingUpload>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                "SELECT id, instance_id, content_hash, account_id, size, attempts, created_at
                 FROM pending_uploads WHERE attempts >= $1 ORDER BY created_at",
                &[&max_attempts],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(upload_from_row)
            .collect())
    }

    pub async fn pending_upload_count(&self) -> Result<i64> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query_one("SELECT count(*) FROM pending_uploads", &[])
            .await
            .map_err(into_error)?
            .get(0))
    }

    /// Content hashes no longer referenced by any message row or pending
    /// upload; candidates for S3 deletion by the sweeper.
    pub async fn orphaned_content_hashes(&self, limit: i64) -> Result<Vec<String>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                "SELECT c.content_hash FROM message_contents c
                 WHERE NOT EXISTS
                        (SELECT 1 FROM messages m WHERE m.content_hash = c.content_hash)
                   AND NOT EXISTS
                        (SELECT 1 FROM pending_uploads p WHERE p.content_hash = c.content_hash)
                 LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(|row| row.get(0))
            .collect())
    }

    pub async fn delete_content(&self, content_hash: &str) -> Result<()> {
        let conn = self.write_conn().await?;
        conn.execute(
            "DELETE FROM message_contents WHERE content_hash = $1",
            &[&content_hash],
        )
        .await
        .map_err(into_error)?;
        Ok(())
    }
}

impl Store {
    pub async fn complete_upload(&self, content_hash: &str) -> Result<()> {
        self.run(|| self.pg.complete_upload(content_hash)).await
    }

    pub async fn failed_uploads(&self, max_attempts: i32) -> Result<Vec<PendingUpload>> {
        self.run(|| self.pg.failed_uploads(max_attempts)).await
    }
}
