/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::{DateTime, Utc};

/// System flag bits as persisted in `messages.flags`.
pub mod flags {
    pub const SEEN: i32 = 1 << 0;
    pub const ANSWERED: i32 = 1 << 1;
    pub const FLAGGED: i32 = 1 << 2;
    pub const DELETED: i32 = 1 << 3;
    pub const DRAFT: i32 = 1 << 4;
    pub const RECENT: i32 = 1 << 5;
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub id: i64,
    pub account_id: i64,
    pub address: String,
    pub password_hash: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    pub id: i64,
    pub account_id: i64,
    /// Hierarchical name with `/` separators; `INBOX` is case-insensitive.
    pub name: String,
    pub uid_validity: i64,
    pub highest_uid: i64,
    pub subscribed: bool,
}

/// Row shape shared by FETCH/SEARCH queries; raw content is resolved
/// separately through the content store.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub account_id: i64,
    pub mailbox_id: i64,
    pub uid: u32,
    pub seqnum: u32,
    pub message_id: String,
    pub content_hash: String,
    pub flags: i32,
    pub custom_flags: Vec<String>,
    pub internal_date: DateTime<Utc>,
    pub sent_date: DateTime<Utc>,
    pub size: i64,
    pub subject: String,
    pub in_reply_to: String,
    pub created_modseq: i64,
    pub updated_modseq: Option<i64>,
    pub uploaded: bool,
}

impl Message {
    pub fn modseq(&self) -> i64 {
        self.updated_modseq.unwrap_or(self.created_modseq)
    }

    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags & flag != 0
    }
}

/// UID of a message expunged after a given modseq, for QRESYNC VANISHED.
#[derive(Debug, Clone, Copy)]
pub struct ExpungedMessage {
    pub uid: u32,
    pub expunged_modseq: i64,
}

/// Everything the insert path persists for one new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub account_id: i64,
    pub mailbox_id: i64,
    pub mailbox_name: String,
    pub message_id: String,
    pub content_hash: String,
    pub flags: i32,
    pub custom_flags: Vec<String>,
    pub internal_date: DateTime<Utc>,
    pub sent_date: DateTime<Utc>,
    pub size: i64,
    pub subject: String,
    pub in_reply_to: String,
    pub plaintext_body: String,
    pub raw_headers: String,
    pub recipients: Vec<Recipient>,
    /// When the sent date falls outside this retention window the plain text
    /// body column is stored NULL while its TSV is still generated.
    pub fts_retention: Option<chrono::Duration>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Recipient {
    pub address_type: String,
    pub name: String,
    pub email_address: String,
}

#[derive(Debug, Clone)]
pub struct InsertResult {
    pub message_id: i64,
    pub uid: u32,
    /// Set when an identical Message-ID already existed in the mailbox and
    /// the existing row was returned instead of inserting a new one.
    pub duplicate: bool,
    /// True when this insert created the first reference to the content hash
    /// and a pending upload row was enqueued.
    pub content_created: bool,
}

#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub id: i64,
    pub instance_id: String,
    pub content_hash: String,
    pub account_id: i64,
    pub size: i64,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SieveScript {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub script: String,
    pub active: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveConnection {
    pub id: i64,
    pub account_id: i64,
    pub email: String,
    pub protocol: String,
    pub client_addr: String,
    pub server_addr: String,
    pub connected_at: DateTime<Utc>,
    pub termination_requested_at: Option<DateTime<Utc>>,
}

/// Criteria for the admin "kick" operation; all present fields must match.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct KickCriteria {
    pub email: Option<String>,
    pub protocol: Option<String>,
    pub client_addr: Option<String>,
    pub server_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailboxStatus {
    pub messages: u32,
    pub recent: u32,
    pub unseen: u32,
    pub deleted: u32,
    pub size: i64,
    pub uid_next: u32,
    pub uid_validity: u32,
    pub highest_modseq: i64,
    /// Sequence number of the first unseen message, when any.
    pub first_unseen: u32,
}

/// Splits an IMAP flag list into the system bitfield and custom keywords.
pub fn split_flags<'x>(input: impl IntoIterator<Item = &'x str>) -> (i32, Vec<String>) {
    let mut bits = 0;
    let mut custom = Vec::new();
    for flag in input {
        match flag {
            _ if flag.eq_ignore_ascii_case("\\seen") => bits |= flags::SEEN,
            _ if flag.eq_ignore_ascii_case("\\answered") => bits |= flags::ANSWERED,
            _ if flag.eq_ignore_ascii_case("\\flagged") => bits |= flags::FLAGGED,
            _ if flag.eq_ignore_ascii_case("\\deleted") => bits |= flags::DELETED,
            _ if flag.eq_ignore_ascii_case("\\draft") => bits |= flags::DRAFT,
            _ if flag.eq_ignore_ascii_case("\\recent") => bits |= flags::RECENT,
            _ => custom.push(flag.to_string()),
        }
    }
    custom.sort();
    custom.dedup();
    (bits, custom)
}

/// Renders a bitfield plus custom keywords back into IMAP flag atoms.
pub fn render_flags(bits: i32, custom: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(custom.len() + 3);
    if bits & flags::SEEN != 0 {
        out.push("\\Seen".to_string());
    }
    if bits & flags::ANSWERED != 0 {
        out.push("\\Answered".to_string());
    }
    if bits & flags::FLAGGED != 0 {
        out.push("\\Flagged".to_string());
    }
    if bits & flags::DELETED != 0 {
        out.push("\\Deleted".to_string());
    }
    if bits & flags::DRAFT != 0 {
        out.push("\\Draft".to_string());
    }
    if bits & flags::RECENT != 0 {
        out.push("\\Recent".to_string());
    }
    out.extend(custom.iter().cloned());
    out
}

/// Strips invalid UTF-8 sequences and NUL bytes before a value reaches a
/// text column.
pub fn sanitize_utf8(value: &str) -> String {
    value.chars().filter(|&ch| ch != '\0').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_round_trip() {
        let (bits, custom) = split_flags(["\\Seen", "\\Flagged", "$Forwarded", "$Forwarded"]);
        assert_eq!(bits, flags::SEEN | flags::FLAGGED);
        assert_eq!(custom, vec!["$Forwarded".to_string()]);

        let rendered = render_flags(bits, &custom);
        assert_eq!(rendered, vec!["\\Seen", "\\Flagged", "$Forwarded"]);
    }

    #[test]
    fn case_insensitive_system_flags() {
        let (bits, custom) = split_flags(["\\SEEN", "\\deleted"]);
        assert_eq!(bits, flags::SEEN | flags::DELETED);
        assert!(custom.is_empty());
    }
}
