/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::utf7;

use super::quoted_or_literal_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    UidNext,
    UidValidity,
    Unseen,
    Recent,
    HighestModseq,
    Deleted,
    Size,
}

/// One `* STATUS` line with the items the client asked for, in request
/// order.
#[derive(Debug, Clone)]
pub struct StatusResponseLine {
    pub mailbox_name: String,
    pub items: Vec<(StatusItem, u64)>,
}

impl StatusResponseLine {
    pub fn serialize(&self, buf: &mut Vec<u8>, is_rev2: bool) {
        buf.extend_from_slice(b"* STATUS ");
        if is_rev2 {
            quoted_or_literal_string(buf, &self.mailbox_name);
        } else {
            quoted_or_literal_string(buf, &utf7::encode_utf7(&self.mailbox_name));
        }
        buf.extend_from_slice(b" (");
        for (pos, (item, value)) in self.items.iter().enumerate() {
            if pos > 0 {
                buf.push(b' ');
            }
            buf.extend_from_slice(match item {
                StatusItem::Messages => b"MESSAGES ".as_slice(),
                StatusItem::UidNext => b"UIDNEXT ",
                StatusItem::UidValidity => b"UIDVALIDITY ",
                StatusItem::Unseen => b"UNSEEN ",
                StatusItem::Recent => b"RECENT ",
                StatusItem::HighestModseq => b"HIGHESTMODSEQ ",
                StatusItem::Deleted => b"DELETED ",
                StatusItem::Size => b"SIZE ",
            });
            buf.extend_from_slice(value.to_string().as_bytes());
        }
        buf.extend_from_slice(b")\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_preserves_order() {
        let line = StatusResponseLine {
            mailbox_name: "INBOX".to_string(),
            items: vec![
                (StatusItem::UidNext, 44292),
                (StatusItem::Messages, 231),
            ],
        };
        let mut buf = Vec::new();
        line.serialize(&mut buf, true);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "* STATUS \"INBOX\" (UIDNEXT 44292 MESSAGES 231)\r\n"
        );
    }
}
