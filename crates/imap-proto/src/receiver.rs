/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

use crate::StatusResponse;

/// Incremental request tokenizer shared by the IMAP and ManageSieve servers.
/// Feeds on raw socket bytes and yields one tokenized request per CRLF,
/// suspending on synchronizing literals so the caller can send the
/// continuation prompt.
pub struct Receiver<T: CommandParser> {
    buf: Vec<u8>,
    pub request: Request<T>,
    pub state: State,
    pub start_state: State,
    pub max_request_size: usize,
    pub current_request_size: usize,
}

pub trait CommandParser: Sized + Default {
    fn parse(name: &[u8], is_uid: bool) -> Option<Self>;
    fn tokenize_brackets(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<T: CommandParser> {
    pub tag: String,
    pub command: T,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Argument(Vec<u8>),
    ParenthesisOpen,
    ParenthesisClose,
    BracketOpen,
    BracketClose,
    Lt,
    Gt,
    Dot,
    Nil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Tag,
    Command { is_uid: bool },
    Argument { last_ch: u8 },
    Quoted { escaped: bool },
    LiteralSize { non_sync: bool },
    LiteralWait { size: u32, non_sync: bool },
    LiteralBody { remaining: u32 },
}

#[derive(Debug, Clone)]
pub enum Error {
    NeedsMoreData,
    NeedsLiteral { size: u32 },
    Error { response: StatusResponse },
}

impl Error {
    fn err(tag: Option<String>, message: impl Into<Cow<'static, str>>) -> Self {
        let mut response = StatusResponse::bad(message);
        response.tag = tag;
        Error::Error { response }
    }
}

impl<T: CommandParser> Default for Request<T> {
    fn default() -> Self {
        Request {
            tag: String::new(),
            command: T::default(),
            tokens: Vec::new(),
        }
    }
}

impl<T: CommandParser> Default for Receiver<T> {
    fn default() -> Self {
        Receiver::with_max_request_size(25 * 1024 * 1024)
    }
}

impl<T: CommandParser> Receiver<T> {
    pub fn with_max_request_size(max_request_size: usize) -> Self {
        Receiver {
            buf: Vec::with_capacity(10),
            request: Request::default(),
            state: State::Start,
            start_state: State::Start,
            max_request_size,
            current_request_size: 0,
        }
    }

    /// ManageSieve requests have no tag; parsing begins at the command name.
    pub fn with_start_state(mut self, state: State) -> Self {
        self.state = state;
        self.start_state = state;
        self
    }

    fn reset(&mut self, message: impl Into<Cow<'static, str>>) -> Error {
        let request = std::mem::take(&mut self.request);
        let err = Error::err(
            if !request.tag.is_empty() {
                Some(request.tag)
            } else {
                None
            },
            message,
        );
        self.buf.clear();
        self.state = self.start_state;
        self.current_request_size = 0;
        err
    }

    fn flush_argument(&mut self, quoted: bool) -> Result<(), Error> {
        if !self.buf.is_empty() {
            self.current_request_size += self.buf.len();
            if self.current_request_size > self.max_request_size {
                return Err(self.reset(format!(
                    "Request exceeds maximum size of {} bytes.",
                    self.max_request_size
                )));
            }
            self.request
                .tokens
                .push(Token::Argument(std::mem::take(&mut self.buf)));
            self.buf = Vec::with_capacity(10);
        } else if quoted {
            // Empty quoted string.
            self.request.tokens.push(Token::Nil);
        }
        Ok(())
    }

    fn push_token(&mut self, token: Token) -> Result<(), Error> {
        self.current_request_size += 1;
        if self.current_request_size > self.max_request_size {
            return Err(self.reset(format!(
                "Request exceeds maximum size of {} bytes.",
                self.max_request_size
            )));
        }
        self.request.tokens.push(token);
        Ok(())
    }

    fn finish(&mut self) -> Request<T> {
        self.state = self.start_state;
        self.current_request_size = 0;
        std::mem::take(&mut self.request)
    }

    pub fn parse(&mut self, bytes: &mut std::slice::Iter<'_, u8>) -> Result<Request<T>, Error> {
        for &ch in bytes.by_ref() {
            match self.state {
                State::Start => {
                    if !ch.is_ascii_whitespace() {
                        self.buf.push(ch);
                        self.state = State::Tag;
                    }
                }
                State::Tag => match ch {
                    b' ' if !self.buf.is_empty() => {
                        self.request.tag =
                            String::from_utf8(std::mem::take(&mut self.buf))
                                .map_err(|_| self.reset("Tag is not valid UTF-8."))?;
                        self.buf = Vec::with_capacity(10);
                        self.state = State::Command { is_uid: false };
                    }
                    b' ' | b'\t' | b'\r' => (),
                    b'\n' => {
                        return Err(self.reset("Missing command after tag."));
                    }
                    _ if self.buf.len() < 128 => self.buf.push(ch),
                    _ => return Err(self.reset("Tag too long.")),
                },
                State::Command { is_uid } => {
                    if ch.is_ascii_alphanumeric() || ch == b'-' {
                        if self.buf.len() < 16 {
                            self.buf.push(ch.to_ascii_uppercase());
                        } else {
                            return Err(self.reset("Command name too long."));
                        }
                    } else if ch.is_ascii_whitespace() {
                        if self.buf.is_empty() {
                            continue;
                        }
                        if self.buf == b"UID" && !is_uid {
                            self.buf.clear();
                            self.state = State::Command { is_uid: true };
                            continue;
                        }
                        self.request.command =
                            T::parse(&self.buf, is_uid).ok_or_else(|| {
                                let name = String::from_utf8_lossy(&self.buf).into_owned();
                                self.reset(format!("Unrecognized command {name:?}."))
                            })?;
                        self.buf.clear();
                        if ch == b'\n' {
                            return Ok(self.finish());
                        }
                        self.state = State::Argument { last_ch: b' ' };
                    } else {
                        return Err(self.reset("Invalid character in command name."));
                    }
                }
                State::Argument { last_ch } => match ch {
                    b'"' if last_ch.is_ascii_whitespace() => {
                        self.flush_argument(false)?;
                        self.state = State::Quoted { escaped: false };
                    }
                    b'{' if last_ch.is_ascii_whitespace() => {
                        self.flush_argument(false)?;
                        self.state = State::LiteralSize { non_sync: false };
                    }
                    b'(' => {
                        self.flush_argument(false)?;
                        self.push_token(Token::ParenthesisOpen)?;
                    }
                    b')' => {
                        self.flush_argument(false)?;
                        self.push_token(Token::ParenthesisClose)?;
                    }
                    b'[' if self.request.command.tokenize_brackets() => {
                        self.flush_argument(false)?;
                        self.push_token(Token::BracketOpen)?;
                    }
                    b']' if self.request.command.tokenize_brackets() => {
                        self.flush_argument(false)?;
                        self.push_token(Token::BracketClose)?;
                    }
                    b'<' if self.request.command.tokenize_brackets() => {
                        self.flush_argument(false)?;
                        self.push_token(Token::Lt)?;
                    }
                    b'>' if self.request.command.tokenize_brackets() => {
                        self.flush_argument(false)?;
                        self.push_token(Token::Gt)?;
                    }
                    b'.' if self.request.command.tokenize_brackets() => {
                        self.flush_argument(false)?;
                        self.push_token(Token::Dot)?;
                    }
                    b'\n' => {
                        self.flush_argument(false)?;
                        return Ok(self.finish());
                    }
                    _ if ch.is_ascii_whitespace() => {
                        self.flush_argument(false)?;
                        self.state = State::Argument { last_ch: ch };
                    }
                    _ => {
                        self.buf.push(ch);
                        self.state = State::Argument { last_ch: ch };
                    }
                },
                State::Quoted { escaped } => match ch {
                    b'"' if !escaped => {
                        self.flush_argument(true)?;
                        self.state = State::Argument { last_ch: b' ' };
                    }
                    b'\\' if !escaped => {
                        self.state = State::Quoted { escaped: true };
                    }
                    b'\n' => {
                        return Err(self.reset("Unterminated quoted string."));
                    }
                    _ => {
                        if self.buf.len() > 1024 {
                            return Err(self.reset("Quoted string too long."));
                        }
                        self.buf.push(ch);
                        self.state = State::Quoted { escaped: false };
                    }
                },
                State::LiteralSize { non_sync } => match ch {
                    b'}' if !self.buf.is_empty() => {
                        let size = std::str::from_utf8(&self.buf)
                            .ok()
                            .and_then(|digits| digits.parse::<u32>().ok())
                            .ok_or_else(|| self.reset("Invalid literal size."))?;
                        if self.current_request_size + size as usize > self.max_request_size {
                            return Err(self.reset(format!(
                                "Literal exceeds maximum request size of {} bytes.",
                                self.max_request_size
                            )));
                        }
                        self.buf = Vec::with_capacity(size as usize);
                        self.state = State::LiteralWait { size, non_sync };
                    }
                    b'+' if !self.buf.is_empty() && !non_sync => {
                        self.state = State::LiteralSize { non_sync: true };
                    }
                    _ if ch.is_ascii_digit() && !non_sync => {
                        self.buf.push(ch);
                    }
                    _ => {
                        return Err(self.reset("Invalid character in literal."));
                    }
                },
                State::LiteralWait { size, non_sync } => {
                    if ch == b'\n' {
                        if size > 0 {
                            self.state = State::LiteralBody { remaining: size };
                        } else {
                            self.push_token(Token::Nil)?;
                            self.state = State::Argument { last_ch: b' ' };
                        }
                        if !non_sync {
                            return Err(Error::NeedsLiteral { size });
                        }
                    } else if !ch.is_ascii_whitespace() {
                        return Err(self.reset("Expected CRLF after literal size."));
                    }
                }
                State::LiteralBody { remaining } => {
                    self.buf.push(ch);
                    if remaining > 1 {
                        self.state = State::LiteralBody {
                            remaining: remaining - 1,
                        };
                    } else {
                        self.flush_argument(true)?;
                        self.state = State::Argument { last_ch: b' ' };
                    }
                }
            }
        }

        Err(Error::NeedsMoreData)
    }
}

impl Token {
    pub fn unwrap_bytes(self) -> Vec<u8> {
        match self {
            Token::Argument(bytes) => bytes,
            Token::Nil => Vec::new(),
            other => other.symbol().as_bytes().to_vec(),
        }
    }

    pub fn unwrap_string(self) -> crate::parser::Result<String> {
        match self {
            Token::Argument(bytes) => {
                String::from_utf8(bytes).map_err(|_| "Invalid UTF-8 in argument.".into())
            }
            Token::Nil => Ok(String::new()),
            other => Ok(other.symbol().to_string()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Token::ParenthesisOpen => "(",
            Token::ParenthesisClose => ")",
            Token::BracketOpen => "[",
            Token::BracketClose => "]",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Dot => ".",
            Token::Argument(_) | Token::Nil => "",
        }
    }

    pub fn eq_ignore_ascii_case(&self, value: &[u8]) -> bool {
        match self {
            Token::Argument(bytes) => bytes.eq_ignore_ascii_case(value),
            Token::Nil => value.is_empty(),
            other => other.symbol().as_bytes() == value,
        }
    }

    pub fn is_parenthesis_open(&self) -> bool {
        matches!(self, Token::ParenthesisOpen)
    }

    pub fn is_parenthesis_close(&self) -> bool {
        matches!(self, Token::ParenthesisClose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;

    fn parse_all(input: &[&str]) -> Vec<Request<Command>> {
        let mut receiver = Receiver::default();
        let mut requests = Vec::new();
        for chunk in input {
            let mut bytes = chunk.as_bytes().iter();
            loop {
                match receiver.parse(&mut bytes) {
                    Ok(request) => requests.push(request),
                    Err(Error::NeedsMoreData) => break,
                    Err(Error::NeedsLiteral { .. }) => break,
                    Err(Error::Error { response }) => {
                        panic!("unexpected error: {:?}", response.message)
                    }
                }
            }
        }
        requests
    }

    #[test]
    fn simple_command() {
        let requests = parse_all(&["A001 NOOP\r\n"]);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tag, "A001");
        assert_eq!(requests[0].command, Command::Noop);
        assert!(requests[0].tokens.is_empty());
    }

    #[test]
    fn uid_prefix() {
        let requests = parse_all(&["A2 UID FETCH 1:* (FLAGS)\r\n"]);
        assert_eq!(requests[0].command, Command::Fetch(true));
        assert_eq!(
            requests[0].tokens[0],
            Token::Argument(b"1:*".to_vec())
        );
    }

    #[test]
    fn quoted_and_escaped() {
        let requests = parse_all(&["A3 LOGIN \"alice@x.test\" \"p\\\"w\\\\d\"\r\n"]);
        assert_eq!(
            requests[0].tokens,
            vec![
                Token::Argument(b"alice@x.test".to_vec()),
                Token::Argument(b"p\"w\\d".to_vec()),
            ]
        );
    }

    #[test]
    fn synchronizing_literal() {
        let mut receiver: Receiver<Command> = Receiver::default();
        let input = b"A4 LOGIN {5}\r\n";
        let mut bytes = input.iter();
        match receiver.parse(&mut bytes) {
            Err(Error::NeedsLiteral { size }) => assert_eq!(size, 5),
            other => panic!("expected literal request: {other:?}"),
        }
        let rest = b"alice pw\r\n";
        let mut bytes = rest.iter();
        let request = receiver.parse(&mut bytes).unwrap();
        assert_eq!(
            request.tokens,
            vec![
                Token::Argument(b"alice".to_vec()),
                Token::Argument(b"pw".to_vec()),
            ]
        );
    }

    #[test]
    fn non_sync_literal() {
        let requests = parse_all(&["A5 CREATE {7+}\r\nNew/Box\r\n"]);
        assert_eq!(
            requests[0].tokens,
            vec![Token::Argument(b"New/Box".to_vec())]
        );
    }

    #[test]
    fn bracket_tokens_only_for_fetch() {
        let requests = parse_all(&["A6 FETCH 1 BODY[1.2]<0.100>\r\n"]);
        let tokens = &requests[0].tokens;
        assert!(tokens.contains(&Token::BracketOpen));
        assert!(tokens.contains(&Token::Lt));

        let requests = parse_all(&["A7 STATUS Folder[x] (MESSAGES)\r\n"]);
        assert_eq!(
            requests[0].tokens[0],
            Token::Argument(b"Folder[x]".to_vec())
        );
    }

    #[test]
    fn pipelined_commands() {
        let requests = parse_all(&["A8 NOOP\r\nA9 CAPABILITY\r\n"]);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].command, Command::Capability);
    }

    #[test]
    fn errors_reset_state() {
        let mut receiver: Receiver<Command> = Receiver::default();
        let mut bytes = b"A10 BOGUS\r\nA11 NOOP\r\n".iter();
        match receiver.parse(&mut bytes) {
            Err(Error::Error { response }) => {
                assert_eq!(response.tag.as_deref(), Some("A10"));
            }
            other => panic!("expected parse error: {other:?}"),
        }
        let request = receiver.parse(&mut bytes).unwrap();
        assert_eq!(request.tag, "A11");
    }
}
