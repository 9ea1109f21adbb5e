/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::{
    protocol::{fetch::{FetchItem, Section, SectionText}, Sequence},
    receiver::{Request, Token},
    Command, StatusResponse,
};

use super::{bad, parse_number, parse_sequence_set, Tokens};

#[derive(Debug, Clone)]
pub struct FetchArgs {
    pub tag: String,
    pub sequence: Sequence,
    pub items: Vec<FetchItem>,
    pub changed_since: Option<u64>,
    pub include_vanished: bool,
}

impl Request<Command> {
    pub fn parse_fetch(self) -> Result<FetchArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let sequence = parse_sequence_set(&tokens.expect_bytes()?)?;

            let mut items = Vec::new();
            match tokens.expect_next()? {
                Token::ParenthesisOpen => loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token => items.extend(parse_item(token, &mut tokens)?),
                    }
                },
                token => items.extend(parse_item(token, &mut tokens)?),
            }

            // FETCH modifiers: (CHANGEDSINCE modseq [VANISHED])
            let mut changed_since = None;
            let mut include_vanished = false;
            if matches!(tokens.peek(), Some(Token::ParenthesisOpen)) {
                tokens.next();
                loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token if token.eq_ignore_ascii_case(b"CHANGEDSINCE") => {
                            changed_since = Some(tokens.expect_number::<u64>()?);
                        }
                        token if token.eq_ignore_ascii_case(b"VANISHED") => {
                            include_vanished = true;
                        }
                        _ => return Err("Unsupported FETCH modifier.".into()),
                    }
                }
            }
            tokens.expect_end()?;

            Ok(FetchArgs {
                tag: String::new(),
                sequence,
                items,
                changed_since,
                include_vanished,
            })
        })();
        match result {
            Ok(mut args) => {
                args.tag = tokens.tag;
                Ok(args)
            }
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }
}

fn parse_item(token: Token, tokens: &mut Tokens) -> super::Result<Vec<FetchItem>> {
    let name = token.unwrap_bytes();
    if name.eq_ignore_ascii_case(b"ALL") {
        return Ok(vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
        ]);
    }
    if name.eq_ignore_ascii_case(b"FAST") {
        return Ok(vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
        ]);
    }
    if name.eq_ignore_ascii_case(b"FULL") {
        return Ok(vec![
            FetchItem::Flags,
            FetchItem::InternalDate,
            FetchItem::Rfc822Size,
            FetchItem::Envelope,
            FetchItem::Body,
        ]);
    }

    let item = if name.eq_ignore_ascii_case(b"ENVELOPE") {
        FetchItem::Envelope
    } else if name.eq_ignore_ascii_case(b"FLAGS") {
        FetchItem::Flags
    } else if name.eq_ignore_ascii_case(b"INTERNALDATE") {
        FetchItem::InternalDate
    } else if name.eq_ignore_ascii_case(b"UID") {
        FetchItem::Uid
    } else if name.eq_ignore_ascii_case(b"MODSEQ") {
        FetchItem::ModSeq
    } else if name.eq_ignore_ascii_case(b"BODYSTRUCTURE") {
        FetchItem::BodyStructure
    } else if name.eq_ignore_ascii_case(b"RFC822") {
        match dotted_suffix(tokens)? {
            Some(suffix) if suffix.eq_ignore_ascii_case(b"SIZE") => FetchItem::Rfc822Size,
            Some(suffix) if suffix.eq_ignore_ascii_case(b"HEADER") => FetchItem::Rfc822Header,
            Some(suffix) if suffix.eq_ignore_ascii_case(b"TEXT") => FetchItem::Rfc822Text,
            Some(_) => return Err("Unknown RFC822 variant.".into()),
            None => FetchItem::Rfc822,
        }
    } else if name.eq_ignore_ascii_case(b"BODY") {
        let peek = match dotted_suffix(tokens)? {
            Some(suffix) if suffix.eq_ignore_ascii_case(b"PEEK") => true,
            Some(_) => return Err("Unknown BODY variant.".into()),
            None => false,
        };
        if matches!(tokens.peek(), Some(Token::BracketOpen)) {
            tokens.next();
            let section = parse_section(tokens)?;
            let partial = parse_partial(tokens)?;
            FetchItem::BodySection {
                peek,
                section,
                partial,
            }
        } else if peek {
            return Err("BODY.PEEK requires a section.".into());
        } else {
            FetchItem::Body
        }
    } else if name.eq_ignore_ascii_case(b"BINARY") {
        let mut peek = false;
        let mut size = false;
        match dotted_suffix(tokens)? {
            Some(suffix) if suffix.eq_ignore_ascii_case(b"PEEK") => peek = true,
            Some(suffix) if suffix.eq_ignore_ascii_case(b"SIZE") => size = true,
            Some(_) => return Err("Unknown BINARY variant.".into()),
            None => (),
        }
        match tokens.next() {
            Some(Token::BracketOpen) => (),
            _ => return Err("BINARY requires a part section.".into()),
        }
        let parts = parse_part_numbers(tokens)?;
        if size {
            FetchItem::BinarySize { parts }
        } else {
            FetchItem::Binary {
                peek,
                parts,
                partial: parse_partial(tokens)?,
            }
        }
    } else {
        return Err(format!(
            "Unknown FETCH item {:?}.",
            String::from_utf8_lossy(&name)
        )
        .into());
    };
    Ok(vec![item])
}

/// Consumes `.SUFFIX` when the next tokens are a dot followed by an atom.
fn dotted_suffix(tokens: &mut Tokens) -> super::Result<Option<Vec<u8>>> {
    if matches!(tokens.peek(), Some(Token::Dot)) {
        tokens.next();
        match tokens.expect_next()? {
            Token::Argument(suffix) => Ok(Some(suffix)),
            _ => Err("Expected item suffix after '.'.".into()),
        }
    } else {
        Ok(None)
    }
}

fn parse_section(tokens: &mut Tokens) -> super::Result<Section> {
    let mut parts = Vec::new();
    let mut text = None;

    loop {
        match tokens.expect_next()? {
            Token::BracketClose => break,
            Token::Dot => (),
            Token::Argument(value) => {
                if value.iter().all(u8::is_ascii_digit) {
                    parts.push(parse_number::<u32>(&value)?);
                } else if value.eq_ignore_ascii_case(b"TEXT") {
                    text = Some(SectionText::Text);
                } else if value.eq_ignore_ascii_case(b"MIME") {
                    text = Some(SectionText::Mime);
                } else if value.eq_ignore_ascii_case(b"HEADER") {
                    // HEADER or HEADER.FIELDS [.NOT] (names)
                    let mut not = false;
                    let mut fields = None;
                    if matches!(tokens.peek(), Some(Token::Dot)) {
                        tokens.next();
                        match tokens.expect_next()? {
                            Token::Argument(sub) if sub.eq_ignore_ascii_case(b"FIELDS") => {
                                if matches!(tokens.peek(), Some(Token::Dot)) {
                                    tokens.next();
                                    match tokens.expect_next()? {
                                        Token::Argument(sub)
                                            if sub.eq_ignore_ascii_case(b"NOT") =>
                                        {
                                            not = true;
                                        }
                                        _ => return Err("Expected NOT.".into()),
                                    }
                                }
                                tokens.expect_open()?;
                                let mut names = Vec::new();
                                loop {
                                    match tokens.expect_next()? {
                                        Token::ParenthesisClose => break,
                                        token => names.push(token.unwrap_string()?),
                                    }
                                }
                                fields = Some(names);
                            }
                            _ => return Err("Expected FIELDS after HEADER.".into()),
                        }
                    }
                    text = Some(match fields {
                        Some(fields) => SectionText::HeaderFields { not, fields },
                        None => SectionText::Header,
                    });
                } else {
                    return Err("Invalid section specifier.".into());
                }
            }
            _ => return Err("Invalid section specifier.".into()),
        }
    }

    Ok(Section { parts, text })
}

fn parse_part_numbers(tokens: &mut Tokens) -> super::Result<Vec<u32>> {
    let mut parts = Vec::new();
    loop {
        match tokens.expect_next()? {
            Token::BracketClose => break,
            Token::Dot => (),
            Token::Argument(value) => parts.push(parse_number::<u32>(&value)?),
            _ => return Err("Invalid part number.".into()),
        }
    }
    Ok(parts)
}

/// `<offset.length>` partial specifier.
fn parse_partial(tokens: &mut Tokens) -> super::Result<Option<(u32, u32)>> {
    if !matches!(tokens.peek(), Some(Token::Lt)) {
        return Ok(None);
    }
    tokens.next();
    let offset = tokens.expect_number::<u32>()?;
    match tokens.next() {
        Some(Token::Dot) => (),
        _ => return Err("Expected '.' in partial range.".into()),
    }
    let length = tokens.expect_number::<u32>()?;
    match tokens.next() {
        Some(Token::Gt) => Ok(Some((offset, length))),
        _ => Err("Expected '>' after partial range.".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Receiver;

    fn parse(line: &str) -> FetchArgs {
        let mut receiver: Receiver<Command> = Receiver::default();
        receiver
            .parse(&mut line.as_bytes().iter())
            .unwrap()
            .parse_fetch()
            .unwrap()
    }

    #[test]
    fn macros_expand() {
        let args = parse("A1 FETCH 1:* FAST\r\n");
        assert_eq!(
            args.items,
            vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size
            ]
        );
    }

    #[test]
    fn body_sections() {
        let args = parse("A2 FETCH 1 (UID BODY.PEEK[1.2.HEADER.FIELDS (DATE FROM)]<0.100>)\r\n");
        assert_eq!(args.items.len(), 2);
        match &args.items[1] {
            FetchItem::BodySection {
                peek,
                section,
                partial,
            } => {
                assert!(peek);
                assert_eq!(section.parts, vec![1, 2]);
                assert_eq!(
                    section.text,
                    Some(SectionText::HeaderFields {
                        not: false,
                        fields: vec!["DATE".to_string(), "FROM".to_string()]
                    })
                );
                assert_eq!(*partial, Some((0, 100)));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn empty_section_is_full_body() {
        let args = parse("A3 FETCH 1 BODY[]\r\n");
        match &args.items[0] {
            FetchItem::BodySection { section, .. } => {
                assert!(section.parts.is_empty());
                assert!(section.text.is_none());
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn changedsince_modifier() {
        let args = parse("A4 UID FETCH 1:* (FLAGS) (CHANGEDSINCE 12345 VANISHED)\r\n");
        assert_eq!(args.changed_since, Some(12345));
        assert!(args.include_vanished);
    }

    #[test]
    fn binary_items() {
        let args = parse("A5 FETCH 1 (BINARY.SIZE[1] BINARY.PEEK[1.1]<8.16>)\r\n");
        assert_eq!(args.items[0], FetchItem::BinarySize { parts: vec![1] });
        assert_eq!(
            args.items[1],
            FetchItem::Binary {
                peek: true,
                parts: vec![1, 1],
                partial: Some((8, 16)),
            }
        );
    }
}
