/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use tokio_postgres::Row;

use crate::{model::flags, Error, Mailbox, MailboxStatus, Result, Store};

use super::{into_error, PgStore};

fn mailbox_from_row(row: &Row) -> Mailbox {
    Mailbox {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        uid_validity: row.get("uid_validity"),
        highest_uid: row.get("highest_uid"),
        subscribed: row.get("subscribed"),
    }
}

const MAILBOX_COLUMNS: &str = "id, account_id, name, uid_validity, highest_uid, subscribed";

impl PgStore {
    /// Creates a mailbox and any missing parents in its path. Returns the
    /// leaf mailbox.
    pub async fn create_mailbox(&self, account_id: i64, name: &str) -> Result<Mailbox> {
        let name = normalize_mailbox_name(name)?;
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let mut leaf = None;
        let mut path = String::new();
        for segment in name.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(segment);

            let row = tx
                .query_opt(
                    &format!(
                        "INSERT INTO mailboxes (account_id, name) VALUES ($1, $2)
                         ON CONFLICT (account_id, name) DO NOTHING
                         RETURNING {MAILBOX_COLUMNS}"
                    ),
                    &[&account_id, &path],
                )
                .await
                .map_err(into_error)?;
            match row {
                Some(row) => leaf = Some((mailbox_from_row(&row), true)),
                None => {
                    let row = tx
                        .query_one(
                            &format!(
                                "SELECT {MAILBOX_COLUMNS} FROM mailboxes
                                 WHERE account_id = $1 AND name = $2"
                            ),
                            &[&account_id, &path],
                        )
                        .await
                        .map_err(into_error)?;
                    leaf = Some((mailbox_from_row(&row), false));
                }
            }
        }

        tx.commit().await.map_err(into_error)?;
        match leaf {
            Some((_, false)) => Err(Error::already_exists("Mailbox already exists")),
            Some((mailbox, true)) => Ok(mailbox),
            None => Err(Error::malformed("Empty mailbox name")),
        }
    }

    pub async fn mailbox_by_name(
        &self,
        account_id: i64,
        name: &str,
        pinned: bool,
    ) -> Result<Option<Mailbox>> {
        let name = normalize_mailbox_name(name)?;
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query_opt(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes
                     WHERE account_id = $1 AND name = $2"
                ),
                &[&account_id, &name],
            )
            .await
            .map_err(into_error)?
            .map(|row| mailbox_from_row(&row)))
    }

    pub async fn mailbox_by_id(&self, mailbox_id: i64, pinned: bool) -> Result<Option<Mailbox>> {
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query_opt(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = $1"),
                &[&mailbox_id],
            )
            .await
            .map_err(into_error)?
            .map(|row| mailbox_from_row(&row)))
    }

    pub async fn list_mailboxes(&self, account_id: i64, pinned: bool) -> Result<Vec<Mailbox>> {
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes
                     WHERE account_id = $1 ORDER BY name"
                ),
                &[&account_id],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(mailbox_from_row)
            .collect())
    }

    /// Deletes a mailbox; its message rows go with it, content cleanup is the
    /// sweeper's job. INBOX and mailboxes with children are refused.
    pub async fn delete_mailbox(&self, account_id: i64, name: &str) -> Result<()> {
        let name = normalize_mailbox_name(name)?;
        if name.eq_ignore_ascii_case("INBOX") {
            return Err(Error::forbidden("INBOX cannot be deleted"));
        }
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let children: i64 = tx
            .query_one(
                "SELECT count(*) FROM mailboxes WHERE account_id = $1 AND name LIKE $2 || '/%'",
                &[&account_id, &name],
            )
            .await
            .map_err(into_error)?
            .get(0);
        if children > 0 {
            return Err(Error::forbidden("Mailbox has child mailboxes"));
        }

        let deleted = tx
            .execute(
                "DELETE FROM mailboxes WHERE account_id = $1 AND name = $2",
                &[&account_id, &name],
            )
            .await
            .map_err(into_error)?;
        if deleted == 0 {
            return Err(Error::not_found("Mailbox does not exist"));
        }

        tx.commit().await.map_err(into_error)?;
        Ok(())
    }

    /// Renames a mailbox and all of its children. Renaming INBOX instead
    /// moves its messages into a freshly created destination (RFC 3501).
    pub async fn rename_mailbox(&self, account_id: i64, from: &str, to: &str) -> Result<()> {
        let from = normalize_mailbox_name(from)?;
        let to = normalize_mailbox_name(to)?;
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        if tx
            .query_opt(
                "SELECT id FROM mailboxes WHERE account_id = $1 AND name = $2",
                &[&account_id, &to],
            )
            .await
            .map_err(into_error)?
            .is_some()
        {
            return Err(Error::already_exists("Destination mailbox already exists"));
        }

        if from.eq_ignore_ascii_case("INBOX") {
            let inbox = tx
                .query_one(
                    "SELECT id FROM mailboxes WHERE account_id = $1 AND name = 'INBOX'",
                    &[&account_id],
                )
                .await
                .map_err(into_error)?;
            let inbox_id: i64 = inbox.get(0);

            let dest = tx
                .query_one(
                    "INSERT INTO mailboxes (account_id, name) VALUES ($1, $2) RETURNING id",
                    &[&account_id, &to],
                )
                .await
                .map_err(into_error)?;
            let dest_id: i64 = dest.get(0);

            let moved = tx
                .query_one(
                    "UPDATE mailboxes SET highest_uid = highest_uid +
                        (SELECT count(*) FROM messages
                         WHERE mailbox_id = $2 AND expunged_at IS NULL)
                     WHERE id = $1 RETURNING highest_uid",
                    &[&dest_id, &inbox_id],
                )
                .await
                .map_err(into_error)?;
            let _: i64 = moved.get(0);

            tx.execute(
                "UPDATE messages SET
                    mailbox_id = $1,
                    mailbox_path = $2,
                    uid = renumbered.new_uid,
                    updated_modseq = nextval('messages_modseq')
                 FROM (
                    SELECT id, row_number() OVER (ORDER BY uid) AS new_uid
                    FROM messages WHERE mailbox_id = $3 AND expunged_at IS NULL
                 ) renumbered
                 WHERE messages.id = renumbered.id",
                &[&dest_id, &to, &inbox_id],
            )
            .await
            .map_err(into_error)?;
        } else {
            let renamed = tx
                .execute(
                    "UPDATE mailboxes SET name = $3 WHERE account_id = $1 AND name = $2",
                    &[&account_id, &from, &to],
                )
                .await
                .map_err(into_error)?;
            if renamed == 0 {
                return Err(Error::not_found("Mailbox does not exist"));
            }
            tx.execute(
                "UPDATE mailboxes SET name = $3 || substr(name, length($2) + 1)
                 WHERE account_id = $1 AND name LIKE $2 || '/%'",
                &[&account_id, &from, &to],
            )
            .await
            .map_err(into_error)?;
            tx.execute(
                "UPDATE messages SET mailbox_path = m.name
                 FROM mailboxes m
                 WHERE messages.mailbox_id = m.id AND m.account_id = $1",
                &[&account_id],
            )
            .await
            .map_err(into_error)?;
        }

        tx.commit().await.map_err(into_error)?;
        Ok(())
    }

    pub async fn set_subscribed(
        &self,
        account_id: i64,
        name: &str,
        subscribed: bool,
    ) -> Result<()> {
        let name = normalize_mailbox_name(name)?;
        let conn = self.write_conn().await?;
        let updated = conn
            .execute(
                "UPDATE mailboxes SET subscribed = $3 WHERE account_id = $1 AND name = $2",
                &[&account_id, &name, &subscribed],
            )
            .await
            .map_err(into_error)?;
        if updated == 0 {
            return Err(Error::not_found("Mailbox does not exist"));
        }
        Ok(())
    }

    pub async fn mailbox_status(&self, mailbox: &Mailbox, pinned: bool) -> Result<MailboxStatus> {
        let conn = self.read_conn(pinned).await?;
        let row = conn
            .query_one(
                "SELECT
                    count(*) AS messages,
                    count(*) FILTER (WHERE flags & $2 != 0) AS recent,
                    count(*) FILTER (WHERE flags & $3 = 0) AS unseen,
                    count(*) FILTER (WHERE flags & $4 != 0) AS deleted,
                    COALESCE(sum(size), 0)::bigint AS size,
                    COALESCE(max(GREATEST(created_modseq,
                        COALESCE(updated_modseq, 0))), 0) AS highest_modseq
                 FROM messages WHERE mailbox_id = $1 AND expunged_at IS NULL",
                &[
                    &mailbox.id,
                    &flags::RECENT,
                    &flags::SEEN,
                    &flags::DELETED,
                ],
            )
            .await
            .map_err(into_error)?;

        let first_unseen: i64 = conn
            .query_one(
                "SELECT COALESCE(min(s.seqnum), 0) FROM message_sequences s
                 JOIN messages m ON m.mailbox_id = s.mailbox_id AND m.uid = s.uid
                 WHERE s.mailbox_id = $1 AND m.flags & $2 = 0 AND m.expunged_at IS NULL",
                &[&mailbox.id, &flags::SEEN],
            )
            .await
            .map_err(into_error)?
            .get(0);

        Ok(MailboxStatus {
            messages: row.get::<_, i64>("messages") as u32,
            recent: row.get::<_, i64>("recent") as u32,
            unseen: row.get::<_, i64>("unseen") as u32,
            deleted: row.get::<_, i64>("deleted") as u32,
            size: row.get("size"),
            uid_next: mailbox.highest_uid as u32 + 1,
            uid_validity: mailbox.uid_validity as u32,
            highest_modseq: row.get("highest_modseq"),
            first_unseen: first_unseen as u32,
        })
    }
}

/// Collapses the INBOX alias and validates separators.
fn normalize_mailbox_name(name: &str) -> Result<String> {
    let name = name.trim_matches('/');
    if name.is_empty() || name.len() > 255 {
        return Err(Error::malformed("Invalid mailbox name"));
    }
    if name.eq_ignore_ascii_case("INBOX") {
        return Ok("INBOX".to_string());
    }
    if name.split('/').any(|segment| segment.is_empty()) {
        return Err(Error::malformed("Empty path segment in mailbox name"));
    }
    Ok(name.to_string())
}

impl Store {
    pub async fn create_mailbox(&self, account_id: i64, name: &str) -> Result<Mailbox> {
        self.run(|| self.pg.create_mailbox(account_id, name)).await
    }

    pub async fn mailbox_by_name(
        &self,
        account_id: i64,
        name: &str,
        pinned: bool,
    ) -> Result<Option<Mailbox>> {
        self.run(|| self.pg.mailbox_by_name(account_id, name, pinned))
            .await
    }

    pub async fn mailbox_by_id(&self, mailbox_id: i64, pinned: bool) -> Result<Option<Mailbox>> {
        self.run(|| self.pg.mailbox_by_id(mailbox_id, pinned)).await
    }

    pub async fn list_mailboxes(&self, account_id: i64, pinned: bool) -> Result<Vec<Mailbox>> {
        self.run(|| self.pg.list_mailboxes(account_id, pinned))
            .await
    }

    pub async fn delete_mailbox(&self, account_id: i64, name: &str) -> Result<()> {
        self.run(|| self.pg.delete_mailbox(account_id, name)).await
    }

    pub async fn rename_mailbox(&self, account_id: i64, from: &str, to: &str) -> Result<()> {
        self.run(|| self.pg.rename_mailbox(account_id, from, to))
            .await
    }

    pub async fn set_subscribed(
        &self,
        account_id: i64,
        name: &str,
        subscribed: bool,
    ) -> Result<()> {
        self.run(|| self.pg.set_subscribed(account_id, name, subscribed))
            .await
    }

    pub async fn mailbox_status(&self, mailbox: &Mailbox, pinned: bool) -> Result<MailboxStatus> {
        self.run(|| self.pg.mailbox_status(mailbox, pinned)).await
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_mailbox_name;

    #[test]
    fn inbox_is_case_insensitive() {
        assert_eq!(normalize_mailbox_name("inbox").unwrap(), "INBOX");
        assert_eq!(normalize_mailbox_name("InBoX").unwrap(), "INBOX");
        assert_eq!(
            normalize_mailbox_name("Archive/2024").unwrap(),
            "Archive/2024"
        );
    }

    #[test]
    fn rejects_degenerate_names() {
        assert!(normalize_mailbox_name("").is_err());
        assert!(normalize_mailbox_name("///").is_err());
        assert!(normalize_mailbox_name("a//b").is_err());
    }
}
