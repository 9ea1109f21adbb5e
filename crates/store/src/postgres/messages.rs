/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::Utc;

use crate::{
    Error, InsertResult, Mailbox, NewMessage, Result, Store,
};

use super::{into_error, PgStore};

/// How a STORE command combines the requested flags with the current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsOp {
    Set,
    Add,
    Remove,
}

#[derive(Debug, Clone)]
pub struct FlagsUpdate {
    /// Rows actually updated: (uid, flags, custom flags, new modseq).
    pub updated: Vec<(u32, i32, Vec<String>, i64)>,
    /// UIDs rejected by UNCHANGEDSINCE, for the MODIFIED response code.
    pub modified: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ExpungeResult {
    /// (uid, seqnum) pairs captured before the rows were marked, in
    /// ascending UID order.
    pub expunged: Vec<(u32, u32)>,
    pub modseq: i64,
}

impl PgStore {
    /// Inserts one message: content row (deduplicated), message row (UID
    /// allocated from `highest_uid`), pending upload when this is the first
    /// unuploaded reference to the hash. An existing live row with the same
    /// Message-ID short-circuits into a duplicate result.
    pub async fn insert_message(&self, msg: &NewMessage) -> Result<InsertResult> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let message_id = if msg.message_id.is_empty() {
            format!(
                "<{}@{}>",
                Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                msg.mailbox_name
            )
        } else {
            crate::sanitize_utf8(&msg.message_id)
        };

        // Silent dedupe: an identical Message-ID in the same mailbox returns
        // the existing UID instead of a new row.
        if let Some(row) = tx
            .query_opt(
                "SELECT id, uid FROM messages
                 WHERE mailbox_id = $1 AND message_id = $2 AND expunged_at IS NULL",
                &[&msg.mailbox_id, &message_id],
            )
            .await
            .map_err(into_error)?
        {
            return Ok(InsertResult {
                message_id: row.get("id"),
                uid: row.get::<_, i64>("uid") as u32,
                duplicate: true,
                content_created: false,
            });
        }

        // Content row first; ON CONFLICT keeps the existing copy. The body
        // column goes NULL past the FTS retention window while the TSV is
        // still generated from the full text.
        let plaintext = crate::sanitize_utf8(&msg.plaintext_body);
        let store_body = msg
            .fts_retention
            .map_or(true, |retention| msg.sent_date > Utc::now() - retention);
        let text_body = store_body.then_some(plaintext.as_str());
        let content_created = tx
            .execute(
                "INSERT INTO message_contents
                    (content_hash, text_body, text_body_tsv, headers, headers_tsv)
                 VALUES ($1, $2, to_tsvector('simple', $3),
                         $4, to_tsvector('simple', $4))
                 ON CONFLICT (content_hash) DO NOTHING",
                &[&msg.content_hash, &text_body, &plaintext, &msg.raw_headers],
            )
            .await
            .map_err(into_error)?
            == 1;

        // Atomically advance highest_uid; the UPDATE row lock serializes
        // concurrent appenders.
        let uid: i64 = tx
            .query_one(
                "UPDATE mailboxes SET highest_uid = highest_uid + 1
                 WHERE id = $1 RETURNING highest_uid",
                &[&msg.mailbox_id],
            )
            .await
            .map_err(into_error)?
            .get(0);

        let (subject_sort, from_name_sort, from_email_sort, to_email_sort, cc_email_sort) =
            sort_keys(msg);
        let custom_flags = serde_json::to_value(&msg.custom_flags)
            .map_err(|err| Error::internal(format!("Failed to serialize keywords: {err}")))?;
        let recipients = serde_json::to_value(&msg.recipients)
            .map_err(|err| Error::internal(format!("Failed to serialize recipients: {err}")))?;

        let already_uploaded: bool = tx
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE content_hash = $1 AND uploaded)",
                &[&msg.content_hash],
            )
            .await
            .map_err(into_error)?
            .get(0);

        let inserted = tx
            .query_one(
                "INSERT INTO messages
                    (account_id, mailbox_id, mailbox_path, uid, message_id, content_hash,
                     flags, custom_flags, internal_date, sent_date, size, subject,
                     in_reply_to, recipients_json, uploaded,
                     subject_sort, from_name_sort, from_email_sort, to_email_sort,
                     cc_email_sort)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                         $15, $16, $17, $18, $19, $20)
                 RETURNING id",
                &[
                    &msg.account_id,
                    &msg.mailbox_id,
                    &msg.mailbox_name,
                    &uid,
                    &message_id,
                    &msg.content_hash,
                    &msg.flags,
                    &custom_flags,
                    &msg.internal_date,
                    &msg.sent_date,
                    &msg.size,
                    &crate::sanitize_utf8(&msg.subject),
                    &crate::sanitize_utf8(&msg.in_reply_to),
                    &recipients,
                    &already_uploaded,
                    &subject_sort,
                    &from_name_sort,
                    &from_email_sort,
                    &to_email_sort,
                    &cc_email_sort,
                ],
            )
            .await;

        let row_id: i64 = match inserted {
            Ok(row) => row.get(0),
            Err(err) => {
                let err = into_error(err);
                drop(tx);
                // A concurrent insert won the Message-ID race; hand back the
                // winner's UID.
                if err.is_unique_violation() {
                    if let Some(row) = conn
                        .query_opt(
                            "SELECT id, uid FROM messages
                             WHERE mailbox_id = $1 AND message_id = $2
                               AND expunged_at IS NULL",
                            &[&msg.mailbox_id, &message_id],
                        )
                        .await
                        .map_err(into_error)?
                    {
                        return Ok(InsertResult {
                            message_id: row.get("id"),
                            uid: row.get::<_, i64>("uid") as u32,
                            duplicate: true,
                            content_created: false,
                        });
                    }
                }
                return Err(err);
            }
        };

        if !already_uploaded {
            tx.execute(
                "INSERT INTO pending_uploads
                    (instance_id, content_hash, account_id, size)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (content_hash, account_id) DO NOTHING",
                &[
                    &self.instance_id,
                    &msg.content_hash,
                    &msg.account_id,
                    &msg.size,
                ],
            )
            .await
            .map_err(into_error)?;
        }

        tx.commit().await.map_err(into_error)?;
        Ok(InsertResult {
            message_id: row_id,
            uid: uid as u32,
            duplicate: false,
            content_created,
        })
    }

    /// Copies messages in one transaction, advancing the destination
    /// `highest_uid` by the batch size. Returns (src_uid, dst_uid) pairs in
    /// source UID order.
    pub async fn copy_messages(
        &self,
        src_mailbox_id: i64,
        dest: &Mailbox,
        uids: &[u32],
    ) -> Result<Vec<(u32, u32)>> {
        if src_mailbox_id == dest.id {
            return Err(Error::malformed(
                "Source and destination mailboxes are the same",
            ));
        }
        let uid_args: Vec<i64> = uids.iter().map(|&uid| uid as i64).collect();
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let rows = tx
            .query(
                "SELECT id, uid FROM messages
                 WHERE mailbox_id = $1 AND uid = ANY($2) AND expunged_at IS NULL
                 ORDER BY uid",
                &[&src_mailbox_id, &uid_args],
            )
            .await
            .map_err(into_error)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let message_ids: Vec<i64> = rows.iter().map(|row| row.get("id")).collect();
        let src_uids: Vec<i64> = rows.iter().map(|row| row.get("uid")).collect();

        let count = message_ids.len() as i64;
        let new_highest: i64 = tx
            .query_one(
                "UPDATE mailboxes SET highest_uid = highest_uid + $1
                 WHERE id = $2 RETURNING highest_uid",
                &[&count, &dest.id],
            )
            .await
            .map_err(into_error)?
            .get(0);
        let start_uid = new_highest - count + 1;
        let new_uids: Vec<i64> = (0..count).map(|offset| start_uid + offset).collect();

        tx.execute(
            "INSERT INTO messages
                (account_id, mailbox_id, mailbox_path, uid, message_id, content_hash,
                 flags, custom_flags, internal_date, sent_date, size, subject,
                 in_reply_to, recipients_json, uploaded,
                 subject_sort, from_name_sort, from_email_sort, to_email_sort,
                 cc_email_sort)
             SELECT
                m.account_id, $1, $2, d.new_uid, m.message_id, m.content_hash,
                m.flags | $5, m.custom_flags, m.internal_date, m.sent_date, m.size,
                m.subject, m.in_reply_to, m.recipients_json, m.uploaded,
                m.subject_sort, m.from_name_sort, m.from_email_sort, m.to_email_sort,
                m.cc_email_sort
             FROM messages m
             JOIN unnest($3::bigint[], $4::bigint[]) AS d(message_id, new_uid)
                ON m.id = d.message_id",
            &[
                &dest.id,
                &dest.name,
                &message_ids,
                &new_uids,
                &crate::model::flags::RECENT,
            ],
        )
        .await
        .map_err(|err| match into_error(err) {
            err if err.is_unique_violation() => {
                Error::unique_violation("Destination already contains one of these messages")
            }
            err => err,
        })?;

        tx.commit().await.map_err(into_error)?;
        Ok(src_uids
            .into_iter()
            .zip(new_uids)
            .map(|(src, dst)| (src as u32, dst as u32))
            .collect())
    }

    /// MOVE: copy plus expunge of the sources in the same transaction.
    pub async fn move_messages(
        &self,
        src_mailbox_id: i64,
        dest: &Mailbox,
        uids: &[u32],
    ) -> Result<(Vec<(u32, u32)>, ExpungeResult)> {
        let copied = self.copy_messages(src_mailbox_id, dest, uids).await?;
        let moved_uids: Vec<u32> = copied.iter().map(|&(src, _)| src).collect();
        let expunged = self
            .expunge_messages(src_mailbox_id, Some(&moved_uids), false)
            .await?;
        Ok((copied, expunged))
    }

    pub async fn update_flags(
        &self,
        mailbox_id: i64,
        uids: &[u32],
        op: FlagsOp,
        bits: i32,
        custom: &[String],
        unchanged_since: Option<i64>,
    ) -> Result<FlagsUpdate> {
        let uid_args: Vec<i64> = uids.iter().map(|&uid| uid as i64).collect();
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let rows = tx
            .query(
                "SELECT id, uid, flags, custom_flags,
                        GREATEST(created_modseq, COALESCE(updated_modseq, 0)) AS modseq
                 FROM messages
                 WHERE mailbox_id = $1 AND uid = ANY($2) AND expunged_at IS NULL
                 ORDER BY uid
                 FOR UPDATE",
                &[&mailbox_id, &uid_args],
            )
            .await
            .map_err(into_error)?;

        let mut updated = Vec::with_capacity(rows.len());
        let mut modified = Vec::new();
        for row in &rows {
            let id: i64 = row.get("id");
            let uid = row.get::<_, i64>("uid") as u32;
            let old_bits: i32 = row.get("flags");
            let old_custom: Vec<String> =
                serde_json::from_value(row.get("custom_flags")).unwrap_or_default();
            let modseq: i64 = row.get("modseq");

            if let Some(unchanged_since) = unchanged_since {
                if modseq > unchanged_since {
                    modified.push(uid);
                    continue;
                }
            }

            let (new_bits, new_custom) = match op {
                FlagsOp::Set => (bits, custom.to_vec()),
                FlagsOp::Add => {
                    let mut merged = old_custom.clone();
                    for keyword in custom {
                        if !merged.contains(keyword) {
                            merged.push(keyword.clone());
                        }
                    }
                    (old_bits | bits, merged)
                }
                FlagsOp::Remove => (
                    old_bits & !bits,
                    old_custom
                        .iter()
                        .filter(|keyword| !custom.contains(keyword))
                        .cloned()
                        .collect(),
                ),
            };

            let custom_json = serde_json::to_value(&new_custom)
                .map_err(|err| Error::internal(format!("Failed to serialize keywords: {err}")))?;
            let new_modseq: i64 = tx
                .query_one(
                    "UPDATE messages SET
                        flags = $2,
                        custom_flags = $3,
                        flags_changed_at = now(),
                        updated_modseq = nextval('messages_modseq')
                     WHERE id = $1
                     RETURNING updated_modseq",
                    &[&id, &new_bits, &custom_json],
                )
                .await
                .map_err(into_error)?
                .get(0);
            updated.push((uid, new_bits, new_custom, new_modseq));
        }

        tx.commit().await.map_err(into_error)?;
        Ok(FlagsUpdate { updated, modified })
    }

    /// Marks messages expunged. With `only_deleted`, restricts to rows
    /// carrying \Deleted (EXPUNGE); otherwise the UID set is taken as-is
    /// (MOVE). Sequence numbers are captured before the trigger rebuilds the
    /// sequence table.
    pub async fn expunge_messages(
        &self,
        mailbox_id: i64,
        uids: Option<&[u32]>,
        only_deleted: bool,
    ) -> Result<ExpungeResult> {
        let mut conn = self.write_conn().await?;
        let tx = conn.transaction().await.map_err(into_error)?;

        let uid_args: Option<Vec<i64>> =
            uids.map(|uids| uids.iter().map(|&uid| uid as i64).collect());
        let rows = tx
            .query(
                "SELECT m.id, m.uid, s.seqnum FROM messages m
                 JOIN message_sequences s
                    ON s.mailbox_id = m.mailbox_id AND s.uid = m.uid
                 WHERE m.mailbox_id = $1
                   AND m.expunged_at IS NULL
                   AND ($2::bigint[] IS NULL OR m.uid = ANY($2))
                   AND (NOT $3 OR m.flags & $4 != 0)
                 ORDER BY m.uid
                 FOR UPDATE OF m",
                &[
                    &mailbox_id,
                    &uid_args,
                    &only_deleted,
                    &crate::model::flags::DELETED,
                ],
            )
            .await
            .map_err(into_error)?;

        if rows.is_empty() {
            return Ok(ExpungeResult {
                expunged: Vec::new(),
                modseq: 0,
            });
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.get("id")).collect();
        let expunged = rows
            .iter()
            .map(|row| {
                (
                    row.get::<_, i64>("uid") as u32,
                    row.get::<_, i64>("seqnum") as u32,
                )
            })
            .collect();

        let modseq: i64 = tx
            .query_one("SELECT nextval('messages_modseq')", &[])
            .await
            .map_err(into_error)?
            .get(0);
        tx.execute(
            "UPDATE messages SET expunged_at = now(), expunged_modseq = $2
             WHERE id = ANY($1)",
            &[&ids, &modseq],
        )
        .await
        .map_err(into_error)?;

        tx.commit().await.map_err(into_error)?;
        Ok(ExpungeResult { expunged, modseq })
    }

    /// Permanently removes rows expunged before the grace period.
    pub async fn purge_expunged(&self, grace: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - grace;
        let conn = self.write_conn().await?;
        conn.execute(
            "DELETE FROM messages WHERE expunged_at IS NOT NULL AND expunged_at < $1",
            &[&cutoff],
        )
        .await
        .map_err(into_error)
    }

    /// UIDs vanished after the given modseq, for QRESYNC.
    pub async fn expunged_since(
        &self,
        mailbox_id: i64,
        modseq: i64,
        uids: Option<&[u32]>,
        pinned: bool,
    ) -> Result<Vec<u32>> {
        let uid_args: Option<Vec<i64>> =
            uids.map(|uids| uids.iter().map(|&uid| uid as i64).collect());
        let conn = self.read_conn(pinned).await?;
        Ok(conn
            .query(
                "SELECT uid FROM messages
                 WHERE mailbox_id = $1 AND expunged_modseq > $2
                   AND ($3::bigint[] IS NULL OR uid = ANY($3))
                 ORDER BY uid",
                &[&mailbox_id, &modseq, &uid_args],
            )
            .await
            .map_err(into_error)?
            .iter()
            .map(|row| row.get::<_, i64>(0) as u32)
            .collect())
    }
}

fn sort_keys(msg: &NewMessage) -> (String, String, String, String, String) {
    let subject_sort = crate::sanitize_utf8(&msg.subject).to_uppercase();
    let mut from_name = String::new();
    let mut from_email = String::new();
    let mut to_email = String::new();
    let mut cc_email = String::new();
    for recipient in &msg.recipients {
        match recipient.address_type.as_str() {
            "from" if from_email.is_empty() => {
                from_name = recipient.name.to_lowercase();
                from_email = recipient.email_address.to_lowercase();
            }
            "to" if to_email.is_empty() => to_email = recipient.email_address.to_lowercase(),
            "cc" if cc_email.is_empty() => cc_email = recipient.email_address.to_lowercase(),
            _ => (),
        }
    }
    (subject_sort, from_name, from_email, to_email, cc_email)
}

impl Store {
    pub async fn insert_message(&self, msg: &NewMessage) -> Result<InsertResult> {
        self.run(|| self.pg.insert_message(msg)).await
    }

    pub async fn copy_messages(
        &self,
        src_mailbox_id: i64,
        dest: &Mailbox,
        uids: &[u32],
    ) -> Result<Vec<(u32, u32)>> {
        self.run(|| self.pg.copy_messages(src_mailbox_id, dest, uids))
            .await
    }

    pub async fn move_messages(
        &self,
        src_mailbox_id: i64,
        dest: &Mailbox,
        uids: &[u32],
    ) -> Result<(Vec<(u32, u32)>, ExpungeResult)> {
        self.run(|| self.pg.move_messages(src_mailbox_id, dest, uids))
            .await
    }

    pub async fn update_flags(
        &self,
        mailbox_id: i64,
        uids: &[u32],
        op: FlagsOp,
        bits: i32,
        custom: &[String],
        unchanged_since: Option<i64>,
    ) -> Result<FlagsUpdate> {
        self.run(|| {
            self.pg
                .update_flags(mailbox_id, uids, op, bits, custom, unchanged_since)
        })
        .await
    }

    pub async fn expunge_messages(
        &self,
        mailbox_id: i64,
        uids: Option<&[u32]>,
        only_deleted: bool,
    ) -> Result<ExpungeResult> {
        self.run(|| self.pg.expunge_messages(mailbox_id, uids, only_deleted))
            .await
    }

    pub async fn expunged_since(
        &self,
        mailbox_id: i64,
        modseq: i64,
        uids: Option<&[u32]>,
        pinned: bool,
    ) -> Result<Vec<u32>> {
        self.run(|| self.pg.expunged_since(mailbox_id, modseq, uids, pinned))
            .await
    }
}
