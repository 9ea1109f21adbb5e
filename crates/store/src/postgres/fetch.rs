/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use tokio_postgres::Row;

use crate::{model::flags, Message, Result, Store};

use super::{into_error, PgStore};

pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.account_id, m.mailbox_id, m.uid, s.seqnum, \
     m.message_id, m.content_hash, m.flags, m.custom_flags, m.internal_date, m.sent_date, \
     m.size, m.subject, m.in_reply_to, m.created_modseq, m.updated_modseq, m.uploaded";

pub(crate) fn message_from_row(row: &Row) -> Message {
    Message {
        id: row.get("id"),
        account_id: row.get("account_id"),
        mailbox_id: row.get("mailbox_id"),
        uid: row.get::<_, i64>("uid") as u32,
        seqnum: row.get::<_, i64>("seqnum") as u32,
        message_id: row.get("message_id"),
        content_hash: row.get("content_hash"),
        flags: row.get("flags"),
        custom_flags: serde_json::from_value(row.get("custom_flags")).unwrap_or_default(),
        internal_date: row.get("internal_date"),
        sent_date: row.get("sent_date"),
        size: row.get("size"),
        subject: row.get("subject"),
        in_reply_to: row.get("in_reply_to"),
        created_modseq: row.get("created_modseq"),
        updated_modseq: row.get("updated_modseq"),
        uploaded: row.get("uploaded"),
    }
}

impl PgStore {
    /// Live messages of a mailbox restricted to a UID set (None selects the
    /// whole mailbox) and optionally to rows touched after `changed_since`.
    pub async fn messages_by_uids(
        &self,
        mailbox_id: i64,
        uids: Option<&[u32]>,
        changed_since: Option<i64>,
        pinned: bool,
    ) -> Result<Vec<Message>> {
        let uid_args: Option<Vec<i64>> =
            uids.map(|uids| uids.iter().map(|&uid| uid as i64).collect());
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     JOIN message_sequences s
                        ON s.mailbox_id = m.mailbox_id AND s.uid = m.uid
                     WHERE m.mailbox_id = $1
                       AND m.expunged_at IS NULL
                       AND ($2::bigint[] IS NULL OR m.uid = ANY($2))
                       AND ($3::bigint IS NULL
                            OR GREATEST(m.created_modseq, COALESCE(m.updated_modseq, 0)) > $3)
                     ORDER BY m.uid"
                ),
                &[&mailbox_id, &uid_args, &changed_since],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(message_from_row)
            .collect())
    }

    /// The (uid, seqnum) snapshot of a mailbox, ascending by UID.
    pub async fn uid_sequence(&self, mailbox_id: i64, pinned: bool) -> Result<Vec<(u32, u32)>> {
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query(
                "SELECT uid, seqnum FROM message_sequences
                 WHERE mailbox_id = $1 ORDER BY uid",
                &[&mailbox_id],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(|row| {
                (
                    row.get::<_, i64>("uid") as u32,
                    row.get::<_, i64>("seqnum") as u32,
                )
            })
            .collect())
    }

    pub async fn message_by_uid(
        &self,
        mailbox_id: i64,
        uid: u32,
        pinned: bool,
    ) -> Result<Option<Message>> {
        Ok(self
            .messages_by_uids(mailbox_id, Some(&[uid]), None, pinned)
            .await?
            .pop())
    }

    /// Clears \Recent after the flags were reported to the selecting session.
    /// Intentionally does not bump modseq: RECENT is session state, not a
    /// tracked mutation.
    pub async fn clear_recent(&self, mailbox_id: i64) -> Result<u64> {
        let conn = self.write_conn().await?;
        conn.execute(
            "UPDATE messages SET flags = flags & ~$2::integer
             WHERE mailbox_id = $1 AND expunged_at IS NULL AND flags & $2 != 0",
            &[&mailbox_id, &flags::RECENT],
        )
        .await
        .map_err(into_error)
    }

    /// Highest modseq observed in a mailbox across creates, updates and
    /// expunges.
    pub async fn highest_modseq(&self, mailbox_id: i64, pinned: bool) -> Result<i64> {
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query_one(
                "SELECT COALESCE(max(GREATEST(created_modseq,
                            COALESCE(updated_modseq, 0),
                            COALESCE(expunged_modseq, 0))), 0)
                 FROM messages WHERE mailbox_id = $1",
                &[&mailbox_id],
            )
            .await
            .map_err(into_error)?
            .get(0))
    }

    /// Most recently delivered content hashes per account, used by the cache
    /// warmup pass.
    pub async fn recent_content_hashes(
        &self,
        account_id: i64,
        limit: i64,
    ) -> Result<Vec<String>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query(
                "SELECT DISTINCT ON (content_hash) content_hash
                 FROM messages
                 WHERE account_id = $1 AND expunged_at IS NULL AND uploaded
                 ORDER BY content_hash, internal_date DESC
                 LIMIT $2",
                &[&account_id, &limit],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(|row| row.get(0))
            .collect())
    }

    pub async fn active_account_ids(&self) -> Result<Vec<i64>> {
        let conn = self.read_conn(false).await?;
        Ok(conn
            .query("SELECT id FROM accounts WHERE deleted_at IS NULL", &[])
            .await
            .map_err(into_error)?
            .iter()
            .map(|row| row.get(0))
            .collect())
    }
}

impl Store {
    pub async fn messages_by_uids(
        &self,
        mailbox_id: i64,
        uids: Option<&[u32]>,
        changed_since: Option<i64>,
        pinned: bool,
    ) -> Result<Vec<Message>> {
        self.run(|| {
            self.pg
                .messages_by_uids(mailbox_id, uids, changed_since, pinned)
        })
        .await
    }

    pub async fn uid_sequence(&self, mailbox_id: i64, pinned: bool) -> Result<Vec<(u32, u32)>> {
        self.run(|| self.pg.uid_sequence(mailbox_id, pinned)).await
    }

    pub async fn message_by_uid(
        &self,
        mailbox_id: i64,
        uid: u32,
        pinned: bool,
    ) -> Result<Option<Message>> {
        self.run(|| self.pg.message_by_uid(mailbox_id, uid, pinned))
            .await
    }

    pub async fn clear_recent(&self, mailbox_id: i64) -> Result<u64> {
        self.run(|| self.pg.clear_recent(mailbox_id)).await
    }

    pub async fn highest_modseq(&self, mailbox_id: i64, pinned: bool) -> Result<i64> {
        self.run(|| self.pg.highest_modseq(mailbox_id, pinned))
            .await
    }
}
