/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::{DateTime, Utc};
use mail_parser::{
    Address, GetHeader, HeaderName, HeaderValue, Message, MessagePart, PartType,
};

use super::{literal_string, quoted_string, quoted_string_or_nil, quoted_timestamp};

/// A requested FETCH data item, as parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Body,
    BodyStructure,
    Uid,
    ModSeq,
    BodySection {
        peek: bool,
        section: Section,
        partial: Option<(u32, u32)>,
    },
    Binary {
        peek: bool,
        parts: Vec<u32>,
        partial: Option<(u32, u32)>,
    },
    BinarySize {
        parts: Vec<u32>,
    },
}

impl FetchItem {
    /// Whether serving this item sets \Seen on a read-write mailbox.
    pub fn sets_seen(&self) -> bool {
        match self {
            FetchItem::Rfc822 | FetchItem::Rfc822Text => true,
            FetchItem::BodySection { peek, .. } | FetchItem::Binary { peek, .. } => !peek,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub parts: Vec<u32>,
    pub text: Option<SectionText>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionText {
    Header,
    HeaderFields { not: bool, fields: Vec<String> },
    Text,
    Mime,
}

impl Section {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        for (pos, part) in self.parts.iter().enumerate() {
            if pos > 0 {
                buf.push(b'.');
            }
            buf.extend_from_slice(part.to_string().as_bytes());
        }
        if let Some(text) = &self.text {
            if !self.parts.is_empty() {
                buf.push(b'.');
            }
            match text {
                SectionText::Header => buf.extend_from_slice(b"HEADER"),
                SectionText::HeaderFields { not, fields } => {
                    buf.extend_from_slice(if *not {
                        b"HEADER.FIELDS.NOT (".as_slice()
                    } else {
                        b"HEADER.FIELDS ("
                    });
                    for (pos, field) in fields.iter().enumerate() {
                        if pos > 0 {
                            buf.push(b' ');
                        }
                        buf.extend_from_slice(field.to_ascii_uppercase().as_bytes());
                    }
                    buf.push(b')');
                }
                SectionText::Text => buf.extend_from_slice(b"TEXT"),
                SectionText::Mime => buf.extend_from_slice(b"MIME"),
            }
        }
    }
}

/// One untagged `* n FETCH (…)` line.
#[derive(Debug, Clone)]
pub struct FetchResponseLine {
    pub seqnum: u32,
    pub items: Vec<DataItem>,
}

#[derive(Debug, Clone)]
pub enum DataItem {
    Flags { flags: Vec<String> },
    Uid { uid: u32 },
    InternalDate { date: DateTime<Utc> },
    Rfc822Size { size: u64 },
    ModSeq { modseq: u64 },
    Rfc822 { contents: Vec<u8> },
    Rfc822Header { contents: Vec<u8> },
    Rfc822Text { contents: Vec<u8> },
    Envelope { serialized: Vec<u8> },
    Body { serialized: Vec<u8> },
    BodyStructure { serialized: Vec<u8> },
    BodySection {
        section: Section,
        origin: Option<u32>,
        contents: Vec<u8>,
    },
    Binary {
        parts: Vec<u32>,
        origin: Option<u32>,
        contents: Vec<u8>,
    },
    BinarySize {
        parts: Vec<u32>,
        size: usize,
    },
}

impl FetchResponseLine {
    pub fn serialize(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"* ");
        buf.extend_from_slice(self.seqnum.to_string().as_bytes());
        buf.extend_from_slice(b" FETCH (");
        for (pos, item) in self.items.iter().enumerate() {
            if pos > 0 {
                buf.push(b' ');
            }
            item.serialize(buf);
        }
        buf.extend_from_slice(b")\r\n");
    }
}

impl DataItem {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            DataItem::Flags { flags } => {
                buf.extend_from_slice(b"FLAGS (");
                for (pos, flag) in flags.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b' ');
                    }
                    buf.extend_from_slice(flag.as_bytes());
                }
                buf.push(b')');
            }
            DataItem::Uid { uid } => {
                buf.extend_from_slice(b"UID ");
                buf.extend_from_slice(uid.to_string().as_bytes());
            }
            DataItem::InternalDate { date } => {
                buf.extend_from_slice(b"INTERNALDATE ");
                quoted_timestamp(buf, date);
            }
            DataItem::Rfc822Size { size } => {
                buf.extend_from_slice(b"RFC822.SIZE ");
                buf.extend_from_slice(size.to_string().as_bytes());
            }
            DataItem::ModSeq { modseq } => {
                buf.extend_from_slice(b"MODSEQ (");
                buf.extend_from_slice(modseq.to_string().as_bytes());
                buf.push(b')');
            }
            DataItem::Rfc822 { contents } => {
                buf.extend_from_slice(b"RFC822 ");
                literal_string(buf, contents);
            }
            DataItem::Rfc822Header { contents } => {
                buf.extend_from_slice(b"RFC822.HEADER ");
                literal_string(buf, contents);
            }
            DataItem::Rfc822Text { contents } => {
                buf.extend_from_slice(b"RFC822.TEXT ");
                literal_string(buf, contents);
            }
            DataItem::Envelope { serialized } => {
                buf.extend_from_slice(b"ENVELOPE ");
                buf.extend_from_slice(serialized);
            }
            DataItem::Body { serialized } => {
                buf.extend_from_slice(b"BODY ");
                buf.extend_from_slice(serialized);
            }
            DataItem::BodyStructure { serialized } => {
                buf.extend_from_slice(b"BODYSTRUCTURE ");
                buf.extend_from_slice(serialized);
            }
            DataItem::BodySection {
                section,
                origin,
                contents,
            } => {
                buf.extend_from_slice(b"BODY[");
                section.serialize(buf);
                buf.push(b']');
                if let Some(origin) = origin {
                    buf.push(b'<');
                    buf.extend_from_slice(origin.to_string().as_bytes());
                    buf.push(b'>');
                }
                buf.push(b' ');
                literal_string(buf, contents);
            }
            DataItem::Binary {
                parts,
                origin,
                contents,
            } => {
                buf.extend_from_slice(b"BINARY[");
                for (pos, part) in parts.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b'.');
                    }
                    buf.extend_from_slice(part.to_string().as_bytes());
                }
                buf.push(b']');
                if let Some(origin) = origin {
                    buf.push(b'<');
                    buf.extend_from_slice(origin.to_string().as_bytes());
                    buf.push(b'>');
                }
                buf.push(b' ');
                // Literal8 so NUL bytes survive.
                buf.push(b'~');
                literal_string(buf, contents);
            }
            DataItem::BinarySize { parts, size } => {
                buf.extend_from_slice(b"BINARY.SIZE[");
                for (pos, part) in parts.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b'.');
                    }
                    buf.extend_from_slice(part.to_string().as_bytes());
                }
                buf.extend_from_slice(b"] ");
                buf.extend_from_slice(size.to_string().as_bytes());
            }
        }
    }
}

/// ENVELOPE in canonical IMAP syntax. From/sender/reply-to fall back per
/// RFC 3501 since a valid message always carries From.
pub fn serialize_envelope(message: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.push(b'(');
    match message.date() {
        Some(date) => quoted_string(&mut buf, &date.to_rfc822()),
        None => buf.extend_from_slice(b"NIL"),
    }
    buf.push(b' ');
    quoted_string_or_nil(&mut buf, message.subject());

    let from = message.from();
    for address in [
        from,
        message.sender().or(from),
        message.reply_to().or(from),
        message.to(),
        message.cc(),
        message.bcc(),
    ] {
        buf.push(b' ');
        serialize_addresses(&mut buf, address);
    }

    buf.push(b' ');
    quoted_string_or_nil(&mut buf, header_text(message, HeaderName::InReplyTo).as_deref());
    buf.push(b' ');
    quoted_string_or_nil(&mut buf, message.message_id().map(|id| format!("<{id}>")).as_deref());
    buf.push(b')');
    buf
}

fn header_text(message: &Message, name: HeaderName) -> Option<String> {
    match message.root_part().headers.header_value(&name)? {
        HeaderValue::Text(text) => Some(text.to_string()),
        HeaderValue::TextList(list) => Some(list.join(" ")),
        _ => None,
    }
}

fn serialize_addresses(buf: &mut Vec<u8>, address: Option<&Address>) {
    let mut serialized_any = false;
    let mut out = Vec::new();
    if let Some(address) = address {
        match address {
            Address::List(list) => {
                for addr in list {
                    serialize_addr(&mut out, addr.name(), addr.address());
                    serialized_any = true;
                }
            }
            Address::Group(groups) => {
                for group in groups {
                    // Group syntax: (NIL NIL "name" NIL) … (NIL NIL NIL NIL)
                    out.extend_from_slice(b"(NIL NIL ");
                    quoted_string_or_nil(&mut out, group.name.as_deref());
                    out.extend_from_slice(b" NIL)");
                    for addr in &group.addresses {
                        serialize_addr(&mut out, addr.name(), addr.address());
                    }
                    out.extend_from_slice(b"(NIL NIL NIL NIL)");
                    serialized_any = true;
                }
            }
        }
    }
    if serialized_any {
        buf.push(b'(');
        buf.extend_from_slice(&out);
        buf.push(b')');
    } else {
        buf.extend_from_slice(b"NIL");
    }
}

fn serialize_addr(buf: &mut Vec<u8>, name: Option<&str>, address: Option<&str>) {
    buf.push(b'(');
    quoted_string_or_nil(buf, name);
    buf.extend_from_slice(b" NIL ");
    match address.and_then(|addr| addr.split_once('@')) {
        Some((mailbox, host)) => {
            quoted_string(buf, mailbox);
            buf.push(b' ');
            quoted_string(buf, host);
        }
        None => {
            quoted_string_or_nil(buf, address);
            buf.extend_from_slice(b" NIL");
        }
    }
    buf.push(b')');
}

/// BODY / BODYSTRUCTURE of the whole message.
pub fn serialize_body_structure(message: &Message, extended: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    write_part(message, message.root_part(), extended, &mut buf);
    buf
}

fn write_part(message: &Message, part: &MessagePart, extended: bool, buf: &mut Vec<u8>) {
    let content_type = part
        .headers
        .header_value(&HeaderName::ContentType)
        .and_then(|value| value.as_content_type());

    match &part.body {
        PartType::Multipart(children) => {
            buf.push(b'(');
            for &child in children {
                if let Some(child) = message.parts.get(child as usize) {
                    write_part(message, child, extended, buf);
                }
            }
            buf.push(b' ');
            quoted_string(
                buf,
                content_type
                    .as_ref()
                    .and_then(|ct| ct.subtype())
                    .unwrap_or("mixed"),
            );
            if extended {
                buf.push(b' ');
                write_parameters(buf, content_type);
                write_extension(message, part, buf);
            }
            buf.push(b')');
        }
        PartType::Message(nested) => {
            buf.push(b'(');
            buf.extend_from_slice(b"\"message\" \"rfc822\" ");
            write_fields(message, part, content_type, buf);
            buf.push(b' ');
            buf.extend_from_slice(&serialize_envelope(nested));
            buf.push(b' ');
            write_part(nested, nested.root_part(), extended, buf);
            buf.push(b' ');
            buf.extend_from_slice(line_count(raw_body(message, part)).to_string().as_bytes());
            if extended {
                write_md5_and_extension(message, part, buf);
            }
            buf.push(b')');
        }
        PartType::Text(_) | PartType::Html(_) => {
            buf.push(b'(');
            buf.extend_from_slice(b"\"text\" ");
            quoted_string(
                buf,
                content_type
                    .as_ref()
                    .and_then(|ct| ct.subtype())
                    .unwrap_or("plain"),
            );
            buf.push(b' ');
            write_fields(message, part, content_type, buf);
            buf.push(b' ');
            buf.extend_from_slice(line_count(raw_body(message, part)).to_string().as_bytes());
            if extended {
                write_md5_and_extension(message, part, buf);
            }
            buf.push(b')');
        }
        PartType::Binary(_) | PartType::InlineBinary(_) => {
            buf.push(b'(');
            match content_type.as_ref() {
                Some(ct) => {
                    quoted_string(buf, ct.ctype());
                    buf.push(b' ');
                    quoted_string(buf, ct.subtype().unwrap_or("octet-stream"));
                }
                None => buf.extend_from_slice(b"\"application\" \"octet-stream\""),
            }
            buf.push(b' ');
            write_fields(message, part, content_type, buf);
            if extended {
                write_md5_and_extension(message, part, buf);
            }
            buf.push(b')');
        }
    }
}

fn write_fields(
    message: &Message,
    part: &MessagePart,
    content_type: Option<&mail_parser::ContentType>,
    buf: &mut Vec<u8>,
) {
    let is_text = matches!(part.body, PartType::Text(_) | PartType::Html(_));

    // body-fld-param
    if content_type.map_or(false, |ct| ct.attributes.is_some()) {
        write_parameters(buf, content_type);
    } else if is_text {
        buf.extend_from_slice(b"(\"charset\" \"us-ascii\")");
    } else {
        buf.extend_from_slice(b"NIL");
    }
    buf.push(b' ');

    // body-fld-id
    match part
        .headers
        .header_value(&HeaderName::ContentId)
        .and_then(|value| value.as_text())
    {
        Some(id) => quoted_string(buf, &format!("<{id}>")),
        None => buf.extend_from_slice(b"NIL"),
    }
    buf.push(b' ');

    // body-fld-desc
    quoted_string_or_nil(
        buf,
        part.headers
            .header_value(&HeaderName::ContentDescription)
            .and_then(|value| value.as_text()),
    );
    buf.push(b' ');

    // body-fld-enc
    match part
        .headers
        .header_value(&HeaderName::ContentTransferEncoding)
        .and_then(|value| value.as_text())
    {
        Some(encoding) => quoted_string(buf, encoding),
        None => buf.extend_from_slice(b"\"7bit\""),
    }
    buf.push(b' ');

    // body-fld-octets
    buf.extend_from_slice(raw_body(message, part).len().to_string().as_bytes());
}

fn write_parameters(buf: &mut Vec<u8>, content_type: Option<&mail_parser::ContentType>) {
    match content_type.and_then(|ct| ct.attributes.as_ref()).filter(|at| !at.is_empty()) {
        Some(attributes) => {
            buf.push(b'(');
            for (pos, attribute) in attributes.iter().enumerate() {
                if pos > 0 {
                    buf.push(b' ');
                }
                quoted_string(buf, attribute.name.as_ref());
                buf.push(b' ');
                quoted_string(buf, attribute.value.as_ref());
            }
            buf.push(b')');
        }
        None => buf.extend_from_slice(b"NIL"),
    }
}

fn write_md5_and_extension(message: &Message, part: &MessagePart, buf: &mut Vec<u8>) {
    buf.push(b' ');
    quoted_string(
        buf,
        &format!("{:x}", md5::compute(raw_body(message, part))),
    );
    write_extension(message, part, buf);
}

fn write_extension(message: &Message, part: &MessagePart, buf: &mut Vec<u8>) {
    let _ = message;
    // body-fld-dsp
    buf.push(b' ');
    match part
        .headers
        .header_value(&HeaderName::ContentDisposition)
        .and_then(|value| value.as_content_type())
    {
        Some(disposition) => {
            buf.push(b'(');
            quoted_string(buf, disposition.ctype());
            buf.push(b' ');
            match disposition.attributes.as_ref().filter(|at| !at.is_empty()) {
                Some(attributes) => {
                    buf.push(b'(');
                    for (pos, attribute) in attributes.iter().enumerate() {
                        if pos > 0 {
                            buf.push(b' ');
                        }
                        quoted_string(buf, attribute.name.as_ref());
                        buf.push(b' ');
                        quoted_string(buf, attribute.value.as_ref());
                    }
                    buf.push(b')');
                }
                None => buf.extend_from_slice(b"NIL"),
            }
            buf.push(b')');
        }
        None => buf.extend_from_slice(b"NIL"),
    }

    // body-fld-lang and body-fld-loc
    buf.push(b' ');
    match part
        .headers
        .header_value(&HeaderName::ContentLanguage)
        .and_then(|value| value.as_text())
    {
        Some(language) => quoted_string(buf, language),
        None => buf.extend_from_slice(b"NIL"),
    }
    buf.push(b' ');
    quoted_string_or_nil(
        buf,
        part.headers
            .header_value(&HeaderName::ContentLocation)
            .and_then(|value| value.as_text()),
    );
}

fn raw_body<'x>(message: &'x Message, part: &MessagePart) -> &'x [u8] {
    message
        .raw_message
        .get(part.offset_body as usize..part.offset_end as usize)
        .unwrap_or(b"")
}

fn line_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&ch| ch == b'\n').count()
}

/// Resolves `BODY[section]`, honoring nested message/rfc822 parts and the
/// partial range. Returns the bytes and the origin octet when partial.
pub fn section_contents(
    message: &Message,
    section: &Section,
    partial: Option<(u32, u32)>,
) -> Option<(Vec<u8>, Option<u32>)> {
    let (message, part) = resolve_part(message, &section.parts, section.text.as_ref())?;

    let contents: Vec<u8> = match &section.text {
        None if section.parts.is_empty() => message
            .raw_message
            .get(part.offset_header as usize..part.offset_end as usize)?
            .to_vec(),
        None => message.raw_message.get(part.offset_body as usize..part.offset_end as usize)?.to_vec(),
        Some(SectionText::Header) => message
            .raw_message
            .get(part.offset_header as usize..part.offset_body as usize)?
            .to_vec(),
        Some(SectionText::Text) => message
            .raw_message
            .get(part.offset_body as usize..part.offset_end as usize)?
            .to_vec(),
        Some(SectionText::HeaderFields { not, fields }) => {
            let mut headers = Vec::new();
            for header in &part.headers {
                let name = header.name.as_str();
                if fields.iter().any(|field| name.eq_ignore_ascii_case(field)) != *not {
                    headers.extend_from_slice(name.as_bytes());
                    headers.push(b':');
                    headers.extend_from_slice(
                        message
                            .raw_message
                            .get(header.offset_start as usize..header.offset_end as usize)
                            .unwrap_or(b""),
                    );
                }
            }
            headers.extend_from_slice(b"\r\n");
            headers
        }
        Some(SectionText::Mime) => {
            let mut headers = Vec::new();
            for header in &part.headers {
                if header.name.as_str().starts_with("Content-") {
                    headers.extend_from_slice(header.name.as_str().as_bytes());
                    headers.push(b':');
                    headers.extend_from_slice(
                        message
                            .raw_message
                            .get(header.offset_start as usize..header.offset_end as usize)
                            .unwrap_or(b""),
                    );
                }
            }
            headers.extend_from_slice(b"\r\n");
            headers
        }
    };

    Some(apply_partial(contents, partial))
}

/// Decoded `BINARY[part]` contents.
pub fn binary_contents(
    message: &Message,
    parts: &[u32],
    partial: Option<(u32, u32)>,
) -> Option<(Vec<u8>, Option<u32>)> {
    let (message, part) = resolve_part(message, parts, None)?;
    if part.is_encoding_problem {
        return None;
    }
    let contents = match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.as_bytes().to_vec(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => bytes.to_vec(),
        PartType::Message(nested) => nested.raw_message.to_vec(),
        PartType::Multipart(_) => message
            .raw_message
            .get(part.offset_header as usize..part.offset_end as usize)?
            .to_vec(),
    };
    Some(apply_partial(contents, partial))
}

pub fn binary_size(message: &Message, parts: &[u32]) -> Option<usize> {
    let (message, part) = resolve_part(message, parts, None)?;
    Some(match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.len(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => bytes.len(),
        PartType::Message(nested) => nested.raw_message.len(),
        PartType::Multipart(_) => message
            .raw_message
            .get(part.offset_header as usize..part.offset_end as usize)
            .map_or(0, |bytes| bytes.len()),
    })
}

fn resolve_part<'x>(
    mut message: &'x Message<'x>,
    parts: &[u32],
    text: Option<&SectionText>,
) -> Option<(&'x Message<'x>, &'x MessagePart<'x>)> {
    let mut part = message.root_part();
    let mut numbers = parts.iter().enumerate().peekable();

    while let Some((position, &number)) = numbers.next() {
        part = if let Some(children) = part.sub_parts() {
            children
                .get((number as usize).checked_sub(1)?)
                .and_then(|&child| message.parts.get(child as usize))?
        } else if number == 1 && (position == parts.len() - 1 || part.is_message()) {
            // Part 1 of a non-multipart body is the body itself.
            part
        } else {
            return None;
        };

        // Descend into an embedded message when more of the path, or a
        // header/text specifier, applies to the nested message itself.
        let descend = numbers.peek().is_some()
            || matches!(
                text,
                Some(SectionText::Header)
                    | Some(SectionText::HeaderFields { .. })
                    | Some(SectionText::Text)
            );
        if descend {
            if let PartType::Message(nested) = &part.body {
                message = nested;
                part = message.root_part();
            }
        }
    }

    Some((message, part))
}

fn apply_partial(contents: Vec<u8>, partial: Option<(u32, u32)>) -> (Vec<u8>, Option<u32>) {
    match partial {
        Some((offset, length)) => {
            let start = (offset as usize).min(contents.len());
            let end = start.saturating_add(length as usize).min(contents.len());
            (contents[start..end].to_vec(), Some(offset))
        }
        None => (contents, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_parser::MessageParser;

    const SIMPLE: &[u8] = b"From: Terry Gray <gray@cac.washington.edu>\r\n\
To: imap@cac.washington.edu\r\n\
Subject: IMAP4rev2 WG mtg summary and minutes\r\n\
Date: Wed, 17 Jul 1996 02:23:25 -0700 (PDT)\r\n\
Message-ID: <B27397-0100000@cac.washington.edu>\r\n\
Content-Type: text/plain; charset=US-ASCII\r\n\
\r\n\
Hello world\r\n";

    #[test]
    fn envelope_shape() {
        let message = MessageParser::new().parse(SIMPLE).unwrap();
        let envelope = String::from_utf8(serialize_envelope(&message)).unwrap();
        assert!(envelope.starts_with('('));
        assert!(envelope.contains("\"IMAP4rev2 WG mtg summary and minutes\""));
        assert!(envelope.contains("(\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")"));
        assert!(envelope.contains("\"<B27397-0100000@cac.washington.edu>\""));
    }

    #[test]
    fn body_structure_text() {
        let message = MessageParser::new().parse(SIMPLE).unwrap();
        let structure =
            String::from_utf8(serialize_body_structure(&message, false)).unwrap();
        assert!(structure.starts_with("(\"text\" \"plain\""));
        assert!(structure.ends_with(')'));
    }

    #[test]
    fn full_body_section() {
        let message = MessageParser::new().parse(SIMPLE).unwrap();
        let (contents, origin) = section_contents(
            &message,
            &Section {
                parts: Vec::new(),
                text: None,
            },
            None,
        )
        .unwrap();
        assert_eq!(contents, SIMPLE);
        assert_eq!(origin, None);
    }

    #[test]
    fn header_fields_filter() {
        let message = MessageParser::new().parse(SIMPLE).unwrap();
        let (contents, _) = section_contents(
            &message,
            &Section {
                parts: Vec::new(),
                text: Some(SectionText::HeaderFields {
                    not: false,
                    fields: vec!["subject".to_string()],
                }),
            },
            None,
        )
        .unwrap();
        let text = String::from_utf8(contents).unwrap();
        assert!(text.contains("Subject:"));
        assert!(!text.contains("From:"));
    }

    #[test]
    fn partial_ranges() {
        let message = MessageParser::new().parse(SIMPLE).unwrap();
        let section = Section {
            parts: Vec::new(),
            text: Some(SectionText::Text),
        };
        let (full, _) = section_contents(&message, &section, None).unwrap();
        let (partial, origin) = section_contents(&message, &section, Some((2, 5))).unwrap();
        assert_eq!(origin, Some(2));
        assert_eq!(partial, full[2..7].to_vec());

        // Offsets past the end yield an empty literal, not an error.
        let (empty, _) = section_contents(&message, &section, Some((10_000, 5))).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn section_spec_round_trip() {
        let section = Section {
            parts: vec![1, 2],
            text: Some(SectionText::HeaderFields {
                not: true,
                fields: vec!["date".to_string()],
            }),
        };
        let mut buf = Vec::new();
        section.serialize(&mut buf);
        assert_eq!(buf, b"1.2.HEADER.FIELDS.NOT (DATE)");
    }
}
