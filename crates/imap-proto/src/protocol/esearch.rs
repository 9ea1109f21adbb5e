/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use super::{serialize_sequence, ImapResponse};

/// `* ESEARCH` extended response (RFC 4731). An empty result set omits the
/// `ALL` keyword entirely rather than sending an empty set.
#[derive(Debug, Clone)]
pub struct EsearchResponse {
    pub tag: String,
    pub is_uid: bool,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub count: Option<u32>,
    /// Sorted members; serialized compressed. `None` when ALL was not
    /// requested, `Some(empty)` when it was but nothing matched.
    pub all: Option<Vec<u32>>,
}

impl ImapResponse for EsearchResponse {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"* ESEARCH (TAG \"");
        buf.extend_from_slice(self.tag.as_bytes());
        buf.extend_from_slice(b"\")");
        if self.is_uid {
            buf.extend_from_slice(b" UID");
        }
        if let Some(min) = self.min {
            buf.extend_from_slice(b" MIN ");
            buf.extend_from_slice(min.to_string().as_bytes());
        }
        if let Some(max) = self.max {
            buf.extend_from_slice(b" MAX ");
            buf.extend_from_slice(max.to_string().as_bytes());
        }
        if let Some(count) = self.count {
            buf.extend_from_slice(b" COUNT ");
            buf.extend_from_slice(count.to_string().as_bytes());
        }
        if let Some(all) = &self.all {
            if !all.is_empty() {
                buf.extend_from_slice(b" ALL ");
                serialize_sequence(&mut buf, all);
            }
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// Legacy `* SEARCH` response (RFC 3501).
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub ids: Vec<u32>,
}

impl ImapResponse for SearchResponse {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"* SEARCH");
        for id in &self.ids {
            buf.push(b' ');
            buf.extend_from_slice(id.to_string().as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// `* SORT` response (RFC 5256).
#[derive(Debug, Clone)]
pub struct SortResponse {
    pub ids: Vec<u32>,
}

impl ImapResponse for SortResponse {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"* SORT");
        for id in &self.ids {
            buf.push(b' ');
            buf.extend_from_slice(id.to_string().as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// `* THREAD` response (RFC 5256); each thread is a flat ordered group.
#[derive(Debug, Clone)]
pub struct ThreadResponse {
    pub threads: Vec<Vec<u32>>,
}

impl ImapResponse for ThreadResponse {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"* THREAD");
        for thread in &self.threads {
            buf.push(b' ');
            buf.push(b'(');
            for (pos, id) in thread.iter().enumerate() {
                if pos > 0 {
                    buf.push(b' ');
                }
                buf.extend_from_slice(id.to_string().as_bytes());
            }
            buf.push(b')');
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// Untagged EXPUNGE responses, emitted in decreasing sequence-number order so
/// earlier lines do not renumber later ones.
#[derive(Debug, Clone)]
pub struct ExpungeResponse {
    pub seqnums: Vec<u32>,
}

impl ImapResponse for ExpungeResponse {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        let mut seqnums = self.seqnums;
        seqnums.sort_unstable_by(|a, b| b.cmp(a));
        for seqnum in seqnums {
            buf.extend_from_slice(b"* ");
            buf.extend_from_slice(seqnum.to_string().as_bytes());
            buf.extend_from_slice(b" EXPUNGE\r\n");
        }
        buf
    }
}

/// `* VANISHED [(EARLIER)] uid-set` (RFC 7162), UIDs ascending.
#[derive(Debug, Clone)]
pub struct VanishedResponse {
    pub earlier: bool,
    pub uids: Vec<u32>,
}

impl ImapResponse for VanishedResponse {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(b"* VANISHED ");
        if self.earlier {
            buf.extend_from_slice(b"(EARLIER) ");
        }
        let mut uids = self.uids;
        uids.sort_unstable();
        serialize_sequence(&mut buf, &uids);
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_esearch_omits_all() {
        let response = EsearchResponse {
            tag: "X".to_string(),
            is_uid: true,
            min: None,
            max: None,
            count: None,
            all: Some(Vec::new()),
        }
        .serialize();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "* ESEARCH (TAG \"X\") UID\r\n"
        );
    }

    #[test]
    fn esearch_with_results() {
        let response = EsearchResponse {
            tag: "A284".to_string(),
            is_uid: false,
            min: Some(2),
            max: Some(10),
            count: Some(5),
            all: Some(vec![2, 3, 4, 5, 10]),
        }
        .serialize();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "* ESEARCH (TAG \"A284\") MIN 2 MAX 10 COUNT 5 ALL 2:5,10\r\n"
        );
    }

    #[test]
    fn expunge_descending() {
        let response = ExpungeResponse {
            seqnums: vec![3, 5, 8],
        }
        .serialize();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "* 8 EXPUNGE\r\n* 5 EXPUNGE\r\n* 3 EXPUNGE\r\n"
        );
    }

    #[test]
    fn vanished_ascending() {
        let response = VanishedResponse {
            earlier: true,
            uids: vec![405, 407, 410, 425],
        }
        .serialize();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "* VANISHED (EARLIER) 405,407,410,425\r\n"
        );
    }

    #[test]
    fn thread_groups() {
        let response = ThreadResponse {
            threads: vec![vec![2], vec![3, 6, 9]],
        }
        .serialize();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "* THREAD (2) (3 6 9)\r\n"
        );
    }
}
