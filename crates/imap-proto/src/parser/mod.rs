/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

use chrono::{DateTime, NaiveDate, Utc};

use crate::{
    protocol::Sequence,
    receiver::{Request, Token},
    Command, StatusResponse,
};

pub mod append;
pub mod fetch;
pub mod mailbox;
pub mod search;
pub mod store;

pub type Result<T> = std::result::Result<T, Cow<'static, str>>;

/// Attaches the request tag to a token-level parse error.
pub(crate) fn bad(tag: String, message: impl Into<Cow<'static, str>>) -> StatusResponse {
    StatusResponse::parse_error(message).with_tag(tag)
}

pub fn parse_number<T: std::str::FromStr>(value: &[u8]) -> Result<T> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .ok_or_else(|| format!("{:?} is not a valid number.", String::from_utf8_lossy(value)).into())
}

pub fn parse_sequence_set(value: &[u8]) -> Result<Sequence> {
    let text = std::str::from_utf8(value).map_err(|_| "Invalid sequence set.")?;
    let mut items = Vec::new();
    for part in text.split(',') {
        if part == "$" {
            items.push(Sequence::SavedSearch);
            continue;
        }
        let item = match part.split_once(':') {
            Some((start, end)) => {
                Sequence::Range(parse_seq_number(start)?, parse_seq_number(end)?)
            }
            None => match parse_seq_number(part)? {
                Some(number) => Sequence::Number(number),
                None => Sequence::Range(None, None),
            },
        };
        items.push(item);
    }
    match items.len() {
        0 => Err("Empty sequence set.".into()),
        1 => Ok(items.pop().unwrap()),
        _ => Ok(Sequence::List(items)),
    }
}

fn parse_seq_number(value: &str) -> Result<Option<u32>> {
    if value == "*" {
        Ok(None)
    } else {
        let number = value
            .parse::<u32>()
            .map_err(|_| format!("Invalid sequence number {value:?}."))?;
        if number == 0 {
            return Err("Sequence numbers start at 1.".into());
        }
        Ok(Some(number))
    }
}

/// `1-Feb-1994` / `01-Feb-1994` (SEARCH date).
pub fn parse_date(value: &[u8]) -> Result<NaiveDate> {
    let text = std::str::from_utf8(value)
        .map_err(|_| "Invalid date.")?
        .trim();
    NaiveDate::parse_from_str(text, "%d-%b-%Y")
        .map_err(|_| format!("Invalid date {text:?}.").into())
}

/// `" 1-Feb-1994 21:52:25 -0800"` (APPEND date-time).
pub fn parse_datetime(value: &[u8]) -> Result<DateTime<Utc>> {
    let text = std::str::from_utf8(value)
        .map_err(|_| "Invalid date-time.")?
        .trim();
    DateTime::parse_from_str(text, "%d-%b-%Y %H:%M:%S %z")
        .map(|datetime| datetime.with_timezone(&Utc))
        .map_err(|_| format!("Invalid date-time {text:?}.").into())
}

/// Cursor over a request's tokens with the accessors every command parser
/// needs.
pub struct Tokens {
    pub tag: String,
    iter: std::vec::IntoIter<Token>,
    peeked: Option<Token>,
}

impl Tokens {
    pub fn new(request: Request<Command>) -> Self {
        Tokens {
            tag: request.tag,
            iter: request.tokens.into_iter(),
            peeked: None,
        }
    }

    pub fn next(&mut self) -> Option<Token> {
        self.peeked.take().or_else(|| self.iter.next())
    }

    pub fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            self.peeked = self.iter.next();
        }
        self.peeked.as_ref()
    }

    pub fn expect_next(&mut self) -> Result<Token> {
        self.next().ok_or_else(|| "Missing arguments.".into())
    }

    pub fn expect_string(&mut self) -> Result<String> {
        self.expect_next()?.unwrap_string()
    }

    pub fn expect_bytes(&mut self) -> Result<Vec<u8>> {
        Ok(self.expect_next()?.unwrap_bytes())
    }

    pub fn expect_number<T: std::str::FromStr>(&mut self) -> Result<T> {
        parse_number(&self.expect_bytes()?)
    }

    pub fn expect_open(&mut self) -> Result<()> {
        match self.next() {
            Some(Token::ParenthesisOpen) => Ok(()),
            _ => Err("Expected '('.".into()),
        }
    }

    pub fn expect_close(&mut self) -> Result<()> {
        match self.next() {
            Some(Token::ParenthesisClose) => Ok(()),
            _ => Err("Expected ')'.".into()),
        }
    }

    /// Consumes either a bare atom or a parenthesized list of atoms.
    pub fn atoms(&mut self) -> Result<Vec<String>> {
        let mut atoms = Vec::new();
        match self.expect_next()? {
            Token::ParenthesisOpen => loop {
                match self.expect_next()? {
                    Token::ParenthesisClose => break,
                    token => atoms.push(token.unwrap_string()?),
                }
            },
            token => atoms.push(token.unwrap_string()?),
        }
        Ok(atoms)
    }

    pub fn is_empty(&mut self) -> bool {
        self.peek().is_none()
    }

    pub fn expect_end(&mut self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err("Too many arguments.".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates() {
        let date = parse_date(b"1-Feb-1994").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(1994, 2, 1).unwrap());
        assert!(parse_date(b"31-Foo-1994").is_err());

        let datetime = parse_datetime(b" 1-Feb-1994 21:52:25 -0800").unwrap();
        assert_eq!(datetime.timestamp(), 760341145);
    }

    #[test]
    fn sequence_sets() {
        assert_eq!(parse_sequence_set(b"7").unwrap(), Sequence::Number(7));
        assert_eq!(
            parse_sequence_set(b"1:*").unwrap(),
            Sequence::Range(Some(1), None)
        );
        assert!(parse_sequence_set(b"0").is_err());
        assert!(parse_sequence_set(b"a:b").is_err());
        assert!(parse_sequence_set(b"$").unwrap().is_saved_search());
    }
}
