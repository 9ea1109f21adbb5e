/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::{DateTime, Utc};

use crate::{
    receiver::{Request, Token},
    utf7, Command, StatusResponse,
};

use super::{bad, parse_datetime, Tokens};

#[derive(Debug, Clone)]
pub struct AppendArgs {
    pub tag: String,
    pub mailbox_name: String,
    pub messages: Vec<AppendMessage>,
}

#[derive(Debug, Clone)]
pub struct AppendMessage {
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

impl Request<Command> {
    /// MULTIAPPEND: any number of `[(flags)] [date-time] literal` groups
    /// after the mailbox name.
    pub fn parse_append(self) -> Result<AppendArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mailbox_name = utf7::decode_utf7(&tokens.expect_string()?);
            let mut messages = Vec::new();

            while !tokens.is_empty() {
                let mut flags = Vec::new();
                let mut internal_date = None;

                if matches!(tokens.peek(), Some(Token::ParenthesisOpen)) {
                    tokens.next();
                    loop {
                        match tokens.expect_next()? {
                            Token::ParenthesisClose => break,
                            token => flags.push(token.unwrap_string()?),
                        }
                    }
                }

                // A date-time argument contains '-'; the literal body never
                // starts the group, so two consecutive arguments mean
                // date-time then body.
                let first = tokens.expect_next()?;
                let raw = if !tokens.is_empty() || looks_like_datetime(&first) {
                    match first {
                        Token::Argument(bytes) if looks_like_datetime_bytes(&bytes) => {
                            internal_date = Some(parse_datetime(&bytes)?);
                            tokens.expect_bytes()?
                        }
                        token => token.unwrap_bytes(),
                    }
                } else {
                    first.unwrap_bytes()
                };

                if raw.is_empty() {
                    return Err("Message literal is empty.".into());
                }
                messages.push(AppendMessage {
                    flags,
                    internal_date,
                    raw,
                });
            }

            if messages.is_empty() {
                return Err("Missing message literal.".into());
            }
            Ok((mailbox_name, messages))
        })();
        match result {
            Ok((mailbox_name, messages)) => Ok(AppendArgs {
                tag: tokens.tag,
                mailbox_name,
                messages,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }
}

fn looks_like_datetime(token: &Token) -> bool {
    match token {
        Token::Argument(bytes) => looks_like_datetime_bytes(bytes),
        _ => false,
    }
}

fn looks_like_datetime_bytes(bytes: &[u8]) -> bool {
    bytes.len() < 64
        && bytes.iter().filter(|&&ch| ch == b'-').count() >= 2
        && bytes.iter().filter(|&&ch| ch == b':').count() == 2
}

#[cfg(test)]
mod tests {
    use crate::{
        receiver::{Error, Receiver},
        Command,
    };

    fn request(chunks: &[&str]) -> crate::receiver::Request<Command> {
        let mut receiver: Receiver<Command> = Receiver::default();
        let mut result = None;
        for chunk in chunks {
            let mut bytes = chunk.as_bytes().iter();
            match receiver.parse(&mut bytes) {
                Ok(request) => result = Some(request),
                Err(Error::NeedsLiteral { .. }) | Err(Error::NeedsMoreData) => (),
                Err(Error::Error { response }) => panic!("{:?}", response.message),
            }
        }
        result.expect("incomplete request")
    }

    #[test]
    fn plain_append() {
        let args = request(&["A1 APPEND INBOX {13+}\r\nSubject: hi\r\n\r\n"])
            .parse_append()
            .unwrap();
        assert_eq!(args.mailbox_name, "INBOX");
        assert_eq!(args.messages.len(), 1);
        assert!(args.messages[0].flags.is_empty());
        assert_eq!(args.messages[0].raw, b"Subject: hi\r\n");
    }

    #[test]
    fn append_with_flags_and_date() {
        let args = request(&[
            "A2 APPEND Sent (\\Seen \\Flagged) \" 1-Feb-1994 21:52:25 -0800\" {4+}\r\nBODY\r\n",
        ])
        .parse_append()
        .unwrap();
        let message = &args.messages[0];
        assert_eq!(message.flags, vec!["\\Seen", "\\Flagged"]);
        assert!(message.internal_date.is_some());
        assert_eq!(message.raw, b"BODY");
    }

    #[test]
    fn multiappend() {
        let args = request(&["A3 APPEND INBOX {3+}\r\none (\\Draft) {3+}\r\ntwo\r\n"])
            .parse_append()
            .unwrap();
        assert_eq!(args.messages.len(), 2);
        assert_eq!(args.messages[0].raw, b"one");
        assert_eq!(args.messages[1].flags, vec!["\\Draft"]);
    }
}
