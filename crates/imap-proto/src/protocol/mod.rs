/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::{DateTime, Utc};

pub mod capability;
pub mod esearch;
pub mod fetch;
pub mod list;
pub mod status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Rev1,
    Rev2,
}

impl ProtocolVersion {
    pub fn is_rev2(&self) -> bool {
        matches!(self, ProtocolVersion::Rev2)
    }
}

/// An RFC 3501 sequence set. Ranges keep `None` for `*`, resolved against the
/// highest value at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequence {
    Number(u32),
    Range(Option<u32>, Option<u32>),
    /// The `$` saved-search marker (RFC 5182).
    SavedSearch,
    List(Vec<Sequence>),
}

impl Sequence {
    pub fn contains(&self, value: u32, max_value: u32) -> bool {
        match self {
            Sequence::Number(number) => *number == value,
            Sequence::Range(start, end) => {
                let start = start.unwrap_or(max_value);
                let end = end.unwrap_or(max_value);
                value >= start.min(end) && value <= start.max(end)
            }
            Sequence::List(items) => items.iter().any(|item| item.contains(value, max_value)),
            Sequence::SavedSearch => false,
        }
    }

    pub fn is_saved_search(&self) -> bool {
        match self {
            Sequence::SavedSearch => true,
            Sequence::List(items) => items.iter().any(Sequence::is_saved_search),
            _ => false,
        }
    }

    /// Normalized inclusive ranges with `*` resolved to `max_value`.
    pub fn to_ranges(&self, max_value: u32) -> Vec<(u32, u32)> {
        let mut ranges = Vec::new();
        self.collect_ranges(max_value, &mut ranges);
        ranges
    }

    fn collect_ranges(&self, max_value: u32, out: &mut Vec<(u32, u32)>) {
        match self {
            Sequence::Number(number) => out.push((*number, *number)),
            Sequence::Range(start, end) => {
                let start = start.unwrap_or(max_value);
                let end = end.unwrap_or(max_value);
                out.push((start.min(end), start.max(end)));
            }
            Sequence::List(items) => {
                for item in items {
                    item.collect_ranges(max_value, out);
                }
            }
            Sequence::SavedSearch => (),
        }
    }

    /// Expands to the concrete members within `1..=max_value`, ascending.
    pub fn expand(&self, max_value: u32) -> Vec<u32> {
        let mut values: Vec<u32> = self
            .to_ranges(max_value)
            .into_iter()
            .flat_map(|(start, end)| start..=end.min(max_value))
            .collect();
        values.sort_unstable();
        values.dedup();
        values
    }
}

/// Compresses a sorted UID list into `1:3,5` form.
pub fn serialize_sequence(buf: &mut Vec<u8>, list: &[u32]) {
    let mut iter = list.iter().peekable();
    while let Some(&value) = iter.next() {
        buf.extend_from_slice(value.to_string().as_bytes());
        let mut last = value;
        while matches!(iter.peek(), Some(&&next) if next == last + 1) {
            last += 1;
            iter.next();
        }
        if last != value {
            buf.push(b':');
            buf.extend_from_slice(last.to_string().as_bytes());
        }
        if iter.peek().is_some() {
            buf.push(b',');
        }
    }
}

pub trait ImapResponse {
    fn serialize(self) -> Vec<u8>;
}

pub fn quoted_string(buf: &mut Vec<u8>, text: &str) {
    buf.push(b'"');
    for &ch in text.as_bytes() {
        if ch == b'\\' || ch == b'"' {
            buf.push(b'\\');
        }
        buf.push(ch);
    }
    buf.push(b'"');
}

pub fn quoted_string_or_nil(buf: &mut Vec<u8>, text: Option<&str>) {
    match text {
        Some(text) => quoted_string(buf, text),
        None => buf.extend_from_slice(b"NIL"),
    }
}

pub fn literal_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push(b'{');
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.extend_from_slice(b"}\r\n");
    buf.extend_from_slice(bytes);
}

pub fn quoted_or_literal_string(buf: &mut Vec<u8>, text: &str) {
    if text
        .as_bytes()
        .iter()
        .any(|ch| [b'\\', b'"', b'\r', b'\n'].contains(ch))
    {
        literal_string(buf, text.as_bytes());
    } else {
        buf.push(b'"');
        buf.extend_from_slice(text.as_bytes());
        buf.push(b'"');
    }
}

/// `"01-Feb-1994 21:52:25 -0800"` (INTERNALDATE).
pub fn quoted_timestamp(buf: &mut Vec<u8>, timestamp: &DateTime<Utc>) {
    buf.push(b'"');
    buf.extend_from_slice(
        timestamp
            .format("%d-%b-%Y %H:%M:%S %z")
            .to_string()
            .as_bytes(),
    );
    buf.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_sequence_set;

    #[test]
    fn sequence_membership() {
        for (input, expected, max_value) in [
            ("1,5:10", vec![1, 5, 6, 7, 8, 9, 10], 10),
            ("2,4:7,9,12:*", vec![2, 4, 5, 6, 7, 9, 12, 13, 14, 15], 15),
            ("*:4,5:7", vec![4, 5, 6, 7], 7),
            ("2,4,5", vec![2, 4, 5], 5),
        ] {
            let sequence = parse_sequence_set(input.as_bytes()).unwrap();
            assert_eq!(
                (1..=15)
                    .filter(|value| sequence.contains(*value, max_value))
                    .collect::<Vec<u32>>(),
                expected,
                "{input}"
            );
        }
    }

    #[test]
    fn sequence_expansion() {
        let sequence = parse_sequence_set(b"3:1,8").unwrap();
        assert_eq!(sequence.expand(10), vec![1, 2, 3, 8]);
        assert_eq!(sequence.to_ranges(10), vec![(1, 3), (8, 8)]);
    }

    #[test]
    fn compressed_serialization() {
        let mut buf = Vec::new();
        serialize_sequence(&mut buf, &[1, 2, 3, 5, 9, 10]);
        assert_eq!(buf, b"1:3,5,9:10");

        let mut buf = Vec::new();
        serialize_sequence(&mut buf, &[7]);
        assert_eq!(buf, b"7");
    }

    #[test]
    fn quoting() {
        let mut buf = Vec::new();
        quoted_string(&mut buf, "say \"hi\"");
        assert_eq!(buf, b"\"say \\\"hi\\\"\"");

        let mut buf = Vec::new();
        quoted_or_literal_string(&mut buf, "line\r\nbreak");
        assert!(buf.starts_with(b"{11}\r\n"));
    }
}
