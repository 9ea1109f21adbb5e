/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::{
    protocol::{status::StatusItem, Sequence},
    receiver::{Request, Token},
    utf7, Command, StatusResponse,
};

use super::{bad, parse_sequence_set, Tokens};

#[derive(Debug, Clone)]
pub struct LoginArgs {
    pub tag: String,
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct AuthenticateArgs {
    pub tag: String,
    pub mechanism: String,
    pub initial_response: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SelectArgs {
    pub tag: String,
    pub mailbox_name: String,
    pub condstore: bool,
    pub qresync: Option<QresyncArgs>,
}

#[derive(Debug, Clone)]
pub struct QresyncArgs {
    pub uid_validity: u32,
    pub modseq: u64,
    pub known_uids: Option<Sequence>,
    pub seq_match: Option<(Sequence, Sequence)>,
}

#[derive(Debug, Clone)]
pub struct MailboxArgs {
    pub tag: String,
    pub mailbox_name: String,
}

#[derive(Debug, Clone)]
pub struct RenameArgs {
    pub tag: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct ListArgs {
    pub tag: String,
    pub reference: String,
    pub patterns: Vec<String>,
    pub select_subscribed: bool,
    pub select_special_use: bool,
    pub return_subscribed: bool,
    pub return_children: bool,
    pub return_special_use: bool,
    pub return_status: Option<Vec<StatusItem>>,
}

#[derive(Debug, Clone)]
pub struct StatusArgs {
    pub tag: String,
    pub mailbox_name: String,
    pub items: Vec<StatusItem>,
}

#[derive(Debug, Clone)]
pub struct EnableArgs {
    pub tag: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IdArgs {
    pub tag: String,
    pub params: Vec<(String, String)>,
}

fn decode_mailbox_name(raw: &str) -> String {
    utf7::decode_utf7(raw)
}

impl Request<Command> {
    pub fn parse_login(self) -> Result<LoginArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let username = tokens.expect_string()?;
            let secret = tokens.expect_string()?;
            tokens.expect_end()?;
            Ok((username, secret))
        })();
        match result {
            Ok((username, secret)) => Ok(LoginArgs {
                tag: tokens.tag,
                username,
                secret,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    pub fn parse_authenticate(self) -> Result<AuthenticateArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mechanism = tokens.expect_string()?.to_ascii_uppercase();
            let initial_response = match tokens.next() {
                Some(token) => Some(token.unwrap_bytes()),
                None => None,
            };
            Ok((mechanism, initial_response))
        })();
        match result {
            Ok((mechanism, initial_response)) => Ok(AuthenticateArgs {
                tag: tokens.tag,
                mechanism,
                initial_response,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    pub fn parse_select(self) -> Result<SelectArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mailbox_name = decode_mailbox_name(&tokens.expect_string()?);
            let mut condstore = false;
            let mut qresync = None;

            if matches!(tokens.peek(), Some(Token::ParenthesisOpen)) {
                tokens.next();
                loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token if token.eq_ignore_ascii_case(b"CONDSTORE") => condstore = true,
                        token if token.eq_ignore_ascii_case(b"QRESYNC") => {
                            tokens.expect_open()?;
                            let uid_validity = tokens.expect_number::<u32>()?;
                            let modseq = tokens.expect_number::<u64>()?;
                            let mut known_uids = None;
                            let mut seq_match = None;
                            loop {
                                match tokens.expect_next()? {
                                    Token::ParenthesisClose => break,
                                    Token::ParenthesisOpen => {
                                        let seqs = parse_sequence_set(
                                            &tokens.expect_bytes()?,
                                        )?;
                                        let uids = parse_sequence_set(
                                            &tokens.expect_bytes()?,
                                        )?;
                                        tokens.expect_close()?;
                                        seq_match = Some((seqs, uids));
                                    }
                                    Token::Argument(bytes) => {
                                        known_uids = Some(parse_sequence_set(&bytes)?);
                                    }
                                    _ => return Err("Invalid QRESYNC parameter.".into()),
                                }
                            }
                            qresync = Some(QresyncArgs {
                                uid_validity,
                                modseq,
                                known_uids,
                                seq_match,
                            });
                        }
                        _ => return Err("Unsupported SELECT parameter.".into()),
                    }
                }
            }
            tokens.expect_end()?;
            Ok((mailbox_name, condstore, qresync))
        })();
        match result {
            Ok((mailbox_name, condstore, qresync)) => Ok(SelectArgs {
                tag: tokens.tag,
                mailbox_name,
                condstore,
                qresync,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    /// CREATE / DELETE / SUBSCRIBE / UNSUBSCRIBE and friends: one name.
    pub fn parse_mailbox_name(self) -> Result<MailboxArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mailbox_name = decode_mailbox_name(&tokens.expect_string()?);
            Ok(mailbox_name)
        })();
        match result {
            Ok(mailbox_name) => Ok(MailboxArgs {
                tag: tokens.tag,
                mailbox_name,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    pub fn parse_rename(self) -> Result<RenameArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let from = decode_mailbox_name(&tokens.expect_string()?);
            let to = decode_mailbox_name(&tokens.expect_string()?);
            tokens.expect_end()?;
            Ok((from, to))
        })();
        match result {
            Ok((from, to)) => Ok(RenameArgs {
                tag: tokens.tag,
                from,
                to,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    pub fn parse_list(self, is_lsub: bool) -> Result<ListArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mut args = ListArgs {
                tag: String::new(),
                reference: String::new(),
                patterns: Vec::new(),
                select_subscribed: is_lsub,
                select_special_use: false,
                return_subscribed: false,
                return_children: false,
                return_special_use: false,
                return_status: None,
            };

            // LIST-EXTENDED selection options
            if !is_lsub && matches!(tokens.peek(), Some(Token::ParenthesisOpen)) {
                tokens.next();
                loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token if token.eq_ignore_ascii_case(b"SUBSCRIBED") => {
                            args.select_subscribed = true;
                        }
                        token if token.eq_ignore_ascii_case(b"SPECIAL-USE") => {
                            args.select_special_use = true;
                        }
                        token if token.eq_ignore_ascii_case(b"RECURSIVEMATCH") => (),
                        token if token.eq_ignore_ascii_case(b"REMOTE") => (),
                        _ => return Err("Unsupported LIST selection option.".into()),
                    }
                }
            }

            args.reference = decode_mailbox_name(&tokens.expect_string()?);
            match tokens.expect_next()? {
                Token::ParenthesisOpen => loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token => args
                            .patterns
                            .push(decode_mailbox_name(&token.unwrap_string()?)),
                    }
                },
                token => args
                    .patterns
                    .push(decode_mailbox_name(&token.unwrap_string()?)),
            }

            // RETURN options
            if matches!(tokens.peek(), Some(Token::Argument(arg)) if arg.eq_ignore_ascii_case(b"RETURN"))
            {
                tokens.next();
                tokens.expect_open()?;
                loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token if token.eq_ignore_ascii_case(b"SUBSCRIBED") => {
                            args.return_subscribed = true;
                        }
                        token if token.eq_ignore_ascii_case(b"CHILDREN") => {
                            args.return_children = true;
                        }
                        token if token.eq_ignore_ascii_case(b"SPECIAL-USE") => {
                            args.return_special_use = true;
                        }
                        token if token.eq_ignore_ascii_case(b"STATUS") => {
                            tokens.expect_open()?;
                            let mut items = Vec::new();
                            loop {
                                match tokens.expect_next()? {
                                    Token::ParenthesisClose => break,
                                    token => {
                                        items.push(StatusItem::parse(&token.unwrap_bytes())?)
                                    }
                                }
                            }
                            args.return_status = Some(items);
                        }
                        _ => return Err("Unsupported LIST return option.".into()),
                    }
                }
            }
            tokens.expect_end()?;
            Ok(args)
        })();
        match result {
            Ok(mut args) => {
                args.tag = tokens.tag;
                Ok(args)
            }
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    pub fn parse_status(self) -> Result<StatusArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mailbox_name = decode_mailbox_name(&tokens.expect_string()?);
            tokens.expect_open()?;
            let mut items = Vec::new();
            loop {
                match tokens.expect_next()? {
                    Token::ParenthesisClose => break,
                    token => items.push(StatusItem::parse(&token.unwrap_bytes())?),
                }
            }
            if items.is_empty() {
                return Err("At least one status item is required.".into());
            }
            tokens.expect_end()?;
            Ok((mailbox_name, items))
        })();
        match result {
            Ok((mailbox_name, items)) => Ok(StatusArgs {
                tag: tokens.tag,
                mailbox_name,
                items,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    pub fn parse_enable(self) -> Result<EnableArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let mut capabilities = Vec::new();
        while let Some(token) = tokens.next() {
            match token.unwrap_string() {
                Ok(capability) => capabilities.push(capability.to_ascii_uppercase()),
                Err(message) => return Err(bad(tokens.tag, message)),
            }
        }
        Ok(EnableArgs {
            tag: tokens.tag,
            capabilities,
        })
    }

    pub fn parse_id(self) -> Result<IdArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mut params = Vec::new();
            match tokens.next() {
                Some(Token::ParenthesisOpen) => loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        key => {
                            let key = key.unwrap_string()?;
                            let value = tokens.expect_string()?;
                            params.push((key, value));
                        }
                    }
                },
                Some(token) if token.eq_ignore_ascii_case(b"NIL") => (),
                Some(Token::Nil) | None => (),
                Some(_) => return Err("Expected parameter list or NIL.".into()),
            }
            Ok(params)
        })();
        match result {
            Ok(params) => Ok(IdArgs {
                tag: tokens.tag,
                params,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    /// UID EXPUNGE sequence set.
    pub fn parse_expunge_uids(self) -> Result<(String, Option<Sequence>), StatusResponse> {
        let mut tokens = Tokens::new(self);
        match tokens.next() {
            Some(Token::Argument(bytes)) => match parse_sequence_set(&bytes) {
                Ok(sequence) => Ok((tokens.tag, Some(sequence))),
                Err(message) => Err(bad(tokens.tag, message)),
            },
            None => Ok((tokens.tag, None)),
            Some(_) => Err(bad(tokens.tag, "Invalid UID EXPUNGE arguments.")),
        }
    }
}

impl StatusItem {
    pub fn parse(value: &[u8]) -> super::Result<Self> {
        if value.eq_ignore_ascii_case(b"MESSAGES") {
            Ok(StatusItem::Messages)
        } else if value.eq_ignore_ascii_case(b"UIDNEXT") {
            Ok(StatusItem::UidNext)
        } else if value.eq_ignore_ascii_case(b"UIDVALIDITY") {
            Ok(StatusItem::UidValidity)
        } else if value.eq_ignore_ascii_case(b"UNSEEN") {
            Ok(StatusItem::Unseen)
        } else if value.eq_ignore_ascii_case(b"RECENT") {
            Ok(StatusItem::Recent)
        } else if value.eq_ignore_ascii_case(b"HIGHESTMODSEQ") {
            Ok(StatusItem::HighestModseq)
        } else if value.eq_ignore_ascii_case(b"DELETED") {
            Ok(StatusItem::Deleted)
        } else if value.eq_ignore_ascii_case(b"SIZE") {
            Ok(StatusItem::Size)
        } else {
            Err(format!(
                "Unknown status item {:?}.",
                String::from_utf8_lossy(value)
            )
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{receiver::Receiver, Command};

    fn request(line: &str) -> crate::receiver::Request<Command> {
        let mut receiver: Receiver<Command> = Receiver::default();
        receiver.parse(&mut line.as_bytes().iter()).unwrap()
    }

    #[test]
    fn select_with_qresync() {
        let args = request("A1 SELECT INBOX (QRESYNC (67890007 20050715194045000 41,43:211))\r\n")
            .parse_select()
            .unwrap();
        assert_eq!(args.mailbox_name, "INBOX");
        let qresync = args.qresync.unwrap();
        assert_eq!(qresync.uid_validity, 67890007);
        assert_eq!(qresync.modseq, 20050715194045000);
        assert!(qresync.known_uids.is_some());
    }

    #[test]
    fn select_condstore() {
        let args = request("A2 SELECT \"My Folder\" (CONDSTORE)\r\n")
            .parse_select()
            .unwrap();
        assert!(args.condstore);
        assert_eq!(args.mailbox_name, "My Folder");
    }

    #[test]
    fn list_extended() {
        let args = request(
            "A3 LIST (SUBSCRIBED) \"\" (\"INBOX\" \"Archive/*\") RETURN (CHILDREN STATUS (MESSAGES UIDNEXT))\r\n",
        )
        .parse_list(false)
        .unwrap();
        assert!(args.select_subscribed);
        assert!(args.return_children);
        assert_eq!(args.patterns, vec!["INBOX", "Archive/*"]);
        assert_eq!(args.return_status.unwrap().len(), 2);
    }

    #[test]
    fn status_items() {
        let args = request("A4 STATUS INBOX (MESSAGES UNSEEN HIGHESTMODSEQ)\r\n")
            .parse_status()
            .unwrap();
        assert_eq!(args.items.len(), 3);
        assert!(request("A5 STATUS INBOX ()\r\n").parse_status().is_err());
    }

    #[test]
    fn utf7_mailbox_names() {
        let args = request("A6 CREATE \"Entw&APw-rfe\"\r\n")
            .parse_mailbox_name()
            .unwrap();
        assert_eq!(args.mailbox_name, "Entw\u{fc}rfe");
    }
}
