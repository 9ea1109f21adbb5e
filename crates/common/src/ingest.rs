/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{Address, GetHeader, HeaderName, HeaderValue, MessageParser};
use store::{blob::content_hash, Mailbox, NewMessage, Recipient};

/// Everything the metadata insert needs, derived from one raw message.
/// Shared by IMAP APPEND and LMTP delivery so both ingest paths persist
/// identical metadata for identical bytes.
#[derive(Clone)]
pub struct ParsedMessage {
    pub raw: Vec<u8>,
    pub content_hash: String,
    pub message_id: String,
    pub subject: String,
    pub in_reply_to: String,
    pub sent_date: DateTime<Utc>,
    pub plaintext_body: String,
    pub raw_headers: String,
    pub recipients: Vec<Recipient>,
}

impl ParsedMessage {
    /// Parses the canonical raw bytes; CRLF normalization happens before the
    /// hash so identical logical messages dedupe.
    pub fn parse(raw: Vec<u8>) -> Option<ParsedMessage> {
        let raw = normalize_crlf(raw);
        let message = MessageParser::new().parse(&raw)?;

        let mut recipients = Vec::new();
        collect_recipients(&mut recipients, "from", message.from());
        collect_recipients(&mut recipients, "to", message.to());
        collect_recipients(&mut recipients, "cc", message.cc());
        collect_recipients(&mut recipients, "bcc", message.bcc());

        let raw_headers = message
            .raw_message
            .get(..message.root_part().offset_body as usize)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();

        let parsed = ParsedMessage {
            content_hash: content_hash(&raw),
            message_id: message
                .message_id()
                .map(|id| format!("<{id}>"))
                .unwrap_or_default(),
            subject: message.subject().unwrap_or_default().to_string(),
            in_reply_to: match message.root_part().headers.header_value(&HeaderName::InReplyTo)
            {
                Some(HeaderValue::Text(text)) => format!("<{text}>"),
                Some(HeaderValue::TextList(list)) => list
                    .iter()
                    .map(|id| format!("<{id}>"))
                    .collect::<Vec<_>>()
                    .join(" "),
                _ => String::new(),
            },
            sent_date: message
                .date()
                .map(|date| {
                    Utc.timestamp_opt(date.to_timestamp(), 0)
                        .single()
                        .unwrap_or_else(Utc::now)
                })
                .unwrap_or_else(Utc::now),
            plaintext_body: message.body_text(0).unwrap_or_default().into_owned(),
            raw_headers,
            recipients,
            raw,
        };
        Some(parsed)
    }

    pub fn into_new_message(
        self,
        account_id: i64,
        mailbox: &Mailbox,
        flags: i32,
        custom_flags: Vec<String>,
        internal_date: Option<DateTime<Utc>>,
        fts_retention: Option<chrono::Duration>,
    ) -> (NewMessage, Vec<u8>) {
        let size = self.raw.len() as i64;
        (
            NewMessage {
                account_id,
                mailbox_id: mailbox.id,
                mailbox_name: mailbox.name.clone(),
                message_id: self.message_id,
                content_hash: self.content_hash,
                flags,
                custom_flags,
                internal_date: internal_date.unwrap_or_else(Utc::now),
                sent_date: self.sent_date,
                size,
                subject: self.subject,
                in_reply_to: self.in_reply_to,
                plaintext_body: self.plaintext_body,
                raw_headers: self.raw_headers,
                recipients: self.recipients,
                fts_retention,
            },
            self.raw,
        )
    }
}

fn collect_recipients(out: &mut Vec<Recipient>, address_type: &str, address: Option<&Address>) {
    let Some(address) = address else { return };
    match address {
        Address::List(list) => {
            for addr in list {
                out.push(Recipient {
                    address_type: address_type.to_string(),
                    name: addr.name().unwrap_or_default().to_string(),
                    email_address: addr.address().unwrap_or_default().to_string(),
                });
            }
        }
        Address::Group(groups) => {
            for group in groups {
                for addr in &group.addresses {
                    out.push(Recipient {
                        address_type: address_type.to_string(),
                        name: addr.name().unwrap_or_default().to_string(),
                        email_address: addr.address().unwrap_or_default().to_string(),
                    });
                }
            }
        }
    }
}

/// Converts bare LF line endings to CRLF so stored bytes are canonical.
pub fn normalize_crlf(raw: Vec<u8>) -> Vec<u8> {
    let mut needs_fix = false;
    let mut previous = 0u8;
    for &byte in &raw {
        if byte == b'\n' && previous != b'\r' {
            needs_fix = true;
            break;
        }
        previous = byte;
    }
    if !needs_fix {
        return raw;
    }

    let mut fixed = Vec::with_capacity(raw.len() + raw.len() / 32);
    let mut previous = 0u8;
    for byte in raw {
        if byte == b'\n' && previous != b'\r' {
            fixed.push(b'\r');
        }
        fixed.push(byte);
        previous = byte;
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_normalization() {
        assert_eq!(normalize_crlf(b"a\nb".to_vec()), b"a\r\nb");
        assert_eq!(normalize_crlf(b"a\r\nb".to_vec()), b"a\r\nb");
        assert_eq!(normalize_crlf(b"a\r\n\nb".to_vec()), b"a\r\n\r\nb");
    }

    #[test]
    fn parse_extracts_metadata() {
        let raw = b"From: Alice <alice@x.test>\r\n\
To: bob@x.test\r\n\
Subject: Lunch\r\n\
Message-ID: <m1@x.test>\r\n\
Date: Thu, 1 Feb 2024 10:00:00 +0000\r\n\
\r\n\
Meet at noon?\r\n";
        let parsed = ParsedMessage::parse(raw.to_vec()).unwrap();
        assert_eq!(parsed.message_id, "<m1@x.test>");
        assert_eq!(parsed.subject, "Lunch");
        assert_eq!(parsed.recipients.len(), 2);
        assert_eq!(parsed.recipients[0].address_type, "from");
        assert_eq!(parsed.recipients[0].email_address, "alice@x.test");
        assert!(parsed.plaintext_body.contains("Meet at noon?"));
        assert_eq!(parsed.content_hash.len(), 64);
        assert!(parsed.raw_headers.ends_with("\r\n"));
    }

    #[test]
    fn identical_bytes_share_a_hash() {
        let a = ParsedMessage::parse(b"Subject: x\r\n\r\nbody\r\n".to_vec()).unwrap();
        let b = ParsedMessage::parse(b"Subject: x\n\nbody\n".to_vec()).unwrap();
        // LF input normalizes to the same canonical bytes.
        assert_eq!(a.content_hash, b.content_hash);
    }
}
