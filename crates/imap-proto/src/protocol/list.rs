/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::utf7;

use super::{quoted_or_literal_string, status::StatusResponseLine};

#[derive(Debug, Clone, Default)]
pub struct ListItem {
    pub mailbox_name: String,
    pub attributes: Vec<ListAttribute>,
    /// Appended as a `* STATUS` line when LIST RETURN (STATUS …) asked for it.
    pub status: Option<StatusResponseLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListAttribute {
    NoInferiors,
    NoSelect,
    HasChildren,
    HasNoChildren,
    Subscribed,
    All,
    Archive,
    Drafts,
    Junk,
    Sent,
    Trash,
}

impl ListAttribute {
    fn as_str(&self) -> &'static str {
        match self {
            ListAttribute::NoInferiors => "\\NoInferiors",
            ListAttribute::NoSelect => "\\NoSelect",
            ListAttribute::HasChildren => "\\HasChildren",
            ListAttribute::HasNoChildren => "\\HasNoChildren",
            ListAttribute::Subscribed => "\\Subscribed",
            ListAttribute::All => "\\All",
            ListAttribute::Archive => "\\Archive",
            ListAttribute::Drafts => "\\Drafts",
            ListAttribute::Junk => "\\Junk",
            ListAttribute::Sent => "\\Sent",
            ListAttribute::Trash => "\\Trash",
        }
    }

    /// Special-use attribute for a well-known mailbox name (RFC 6154).
    pub fn special_use(name: &str) -> Option<ListAttribute> {
        match name {
            "Archive" => Some(ListAttribute::Archive),
            "Drafts" => Some(ListAttribute::Drafts),
            "Junk" | "Spam" => Some(ListAttribute::Junk),
            "Sent" => Some(ListAttribute::Sent),
            "Trash" => Some(ListAttribute::Trash),
            _ => None,
        }
    }
}

impl ListItem {
    pub fn new(mailbox_name: impl Into<String>) -> Self {
        ListItem {
            mailbox_name: mailbox_name.into(),
            ..Default::default()
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>, is_lsub: bool, is_rev2: bool) {
        buf.extend_from_slice(if is_lsub { b"* LSUB (" } else { b"* LIST (" });
        for (pos, attribute) in self.attributes.iter().enumerate() {
            if pos > 0 {
                buf.push(b' ');
            }
            buf.extend_from_slice(attribute.as_str().as_bytes());
        }
        buf.extend_from_slice(b") \"/\" ");
        if is_rev2 {
            quoted_or_literal_string(buf, &self.mailbox_name);
        } else {
            quoted_or_literal_string(buf, &utf7::encode_utf7(&self.mailbox_name));
        }
        buf.extend_from_slice(b"\r\n");
        if let Some(status) = &self.status {
            status.serialize(buf, is_rev2);
        }
    }
}

/// Glob match over mailbox names: `*` spans the hierarchy, `%` stops at `/`.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                (0..=name.len()).any(|skip| matches(&pattern[1..], &name[skip..]))
            }
            (Some(b'%'), _) => (0..=name.len())
                .take_while(|&skip| !name[..skip].contains(&b'/'))
                .any(|skip| matches(&pattern[1..], &name[skip..])),
            (Some(&ch), Some(&other)) if ch == other => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching() {
        assert!(matches_pattern("*", "Archive/2024"));
        assert!(matches_pattern("Archive/*", "Archive/2024/Q1"));
        assert!(matches_pattern("%", "INBOX"));
        assert!(!matches_pattern("%", "Archive/2024"));
        assert!(matches_pattern("Archive/%", "Archive/2024"));
        assert!(!matches_pattern("Archive/%", "Archive/2024/Q1"));
        assert!(matches_pattern("INBOX", "INBOX"));
        assert!(!matches_pattern("INBOX", "INBOX2"));
    }

    #[test]
    fn serialization() {
        let mut item = ListItem::new("Sent");
        item.attributes.push(ListAttribute::HasNoChildren);
        item.attributes.push(ListAttribute::Sent);
        let mut buf = Vec::new();
        item.serialize(&mut buf, false, true);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "* LIST (\\HasNoChildren \\Sent) \"/\" \"Sent\"\r\n"
        );
    }
}
