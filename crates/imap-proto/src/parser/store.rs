/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::{
    protocol::Sequence,
    receiver::{Request, Token},
    utf7, Command, StatusResponse,
};

use super::{bad, parse_sequence_set, Tokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Set,
    Add,
    Remove,
}

#[derive(Debug, Clone)]
pub struct StoreArgs {
    pub tag: String,
    pub sequence: Sequence,
    pub op: StoreOp,
    pub silent: bool,
    pub flags: Vec<String>,
    pub unchanged_since: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CopyArgs {
    pub tag: String,
    pub sequence: Sequence,
    pub mailbox_name: String,
}

impl Request<Command> {
    pub fn parse_store(self) -> Result<StoreArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let sequence = parse_sequence_set(&tokens.expect_bytes()?)?;

            let mut unchanged_since = None;
            if matches!(tokens.peek(), Some(Token::ParenthesisOpen)) {
                tokens.next();
                loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token if token.eq_ignore_ascii_case(b"UNCHANGEDSINCE") => {
                            unchanged_since = Some(tokens.expect_number::<u64>()?);
                        }
                        _ => return Err("Unsupported STORE modifier.".into()),
                    }
                }
            }

            // +FLAGS / -FLAGS / FLAGS with optional .SILENT; the receiver
            // splits the dot for STORE.
            let operation = tokens.expect_bytes()?;
            let (op, name) = match operation.first() {
                Some(b'+') => (StoreOp::Add, &operation[1..]),
                Some(b'-') => (StoreOp::Remove, &operation[1..]),
                _ => (StoreOp::Set, &operation[..]),
            };
            if !name.eq_ignore_ascii_case(b"FLAGS") {
                return Err("Expected FLAGS operation.".into());
            }
            let mut silent = false;
            if matches!(tokens.peek(), Some(Token::Dot)) {
                tokens.next();
                if !tokens.expect_bytes()?.eq_ignore_ascii_case(b"SILENT") {
                    return Err("Expected SILENT suffix.".into());
                }
                silent = true;
            }

            let mut flags = Vec::new();
            match tokens.expect_next()? {
                Token::ParenthesisOpen => loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token => flags.push(token.unwrap_string()?),
                    }
                },
                token => {
                    flags.push(token.unwrap_string()?);
                    while let Some(token) = tokens.next() {
                        flags.push(token.unwrap_string()?);
                    }
                }
            }

            Ok(StoreArgs {
                tag: String::new(),
                sequence,
                op,
                silent,
                flags,
                unchanged_since,
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

    pub fn parse_copy_move(self) -> Result<CopyArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let sequence = parse_sequence_set(&tokens.expect_bytes()?)?;
            let mailbox_name = utf7::decode_utf7(&tokens.expect_string()?);
            tokens.expect_end()?;
            Ok((sequence, mailbox_name))
        })();
        match result {
            Ok((sequence, mailbox_name)) => Ok(CopyArgs {
                tag: tokens.tag,
                sequence,
                mailbox_name,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Receiver;

    fn parse(line: &str) -> StoreArgs {
        let mut receiver: Receiver<Command> = Receiver::default();
        receiver
            .parse(&mut line.as_bytes().iter())
            .unwrap()
            .parse_store()
            .unwrap()
    }

    #[test]
    fn add_silent() {
        let args = parse("A1 STORE 1:3 +FLAGS.SILENT (\\Deleted $Junk)\r\n");
        assert_eq!(args.op, StoreOp::Add);
        assert!(args.silent);
        assert_eq!(args.flags, vec!["\\Deleted", "$Junk"]);
    }

    #[test]
    fn set_with_unchangedsince() {
        let args = parse("A2 UID STORE 5 (UNCHANGEDSINCE 42) FLAGS (\\Seen)\r\n");
        assert_eq!(args.op, StoreOp::Set);
        assert!(!args.silent);
        assert_eq!(args.unchanged_since, Some(42));
    }

    #[test]
    fn remove_without_parens() {
        let args = parse("A3 STORE 2 -FLAGS \\Flagged\r\n");
        assert_eq!(args.op, StoreOp::Remove);
        assert_eq!(args.flags, vec!["\\Flagged"]);
    }
}
