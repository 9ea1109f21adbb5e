/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! POP3 line protocol (RFC 1939 + RFC 2449 CAPA, RFC 2595 STLS, RFC 5034
//! SASL, Dovecot-style XCLIENT).

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User { name: String },
    Pass { secret: String },
    Apop { name: String, digest: String },
    Auth { mechanism: String, initial: Option<String> },
    Capa,
    Stls,
    Stat,
    List { number: Option<usize> },
    Uidl { number: Option<usize> },
    Retr { number: usize },
    Top { number: usize, lines: usize },
    Dele { number: usize },
    Noop,
    Rset,
    Quit,
    Xclient { params: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnknownCommand(String),
    MissingArgument,
    InvalidNumber,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let mut arg = || parts.next().ok_or(ParseError::MissingArgument);
        let number = |value: &str| value.parse::<usize>().map_err(|_| ParseError::InvalidNumber);

        match verb.as_str() {
            "USER" => Ok(Command::User {
                name: arg()?.to_string(),
            }),
            "PASS" => {
                // PASS may contain spaces; take the raw remainder.
                let secret = line
                    .splitn(2, ' ')
                    .nth(1)
                    .ok_or(ParseError::MissingArgument)?;
                Ok(Command::Pass {
                    secret: secret.to_string(),
                })
            }
            "APOP" => Ok(Command::Apop {
                name: arg()?.to_string(),
                digest: arg()?.to_string(),
            }),
            "AUTH" => {
                let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
                if mechanism.is_empty() {
                    return Err(ParseError::MissingArgument);
                }
                Ok(Command::Auth {
                    mechanism,
                    initial: parts.next().map(|initial| initial.to_string()),
                })
            }
            "CAPA" => Ok(Command::Capa),
            "STLS" => Ok(Command::Stls),
            "STAT" => Ok(Command::Stat),
            "LIST" => Ok(Command::List {
                number: parts.next().map(number).transpose()?,
            }),
            "UIDL" => Ok(Command::Uidl {
                number: parts.next().map(number).transpose()?,
            }),
            "RETR" => Ok(Command::Retr {
                number: number(arg()?)?,
            }),
            "TOP" => Ok(Command::Top {
                number: number(arg()?)?,
                lines: number(arg()?)?,
            }),
            "DELE" => Ok(Command::Dele {
                number: number(arg()?)?,
            }),
            "NOOP" => Ok(Command::Noop),
            "RSET" => Ok(Command::Rset),
            "QUIT" => Ok(Command::Quit),
            "XCLIENT" => Ok(Command::Xclient {
                params: line.splitn(2, ' ').nth(1).unwrap_or("").to_string(),
            }),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

pub fn ok(message: &str) -> Vec<u8> {
    format!("+OK {message}\r\n").into_bytes()
}

pub fn err(message: &str) -> Vec<u8> {
    format!("-ERR {message}\r\n").into_bytes()
}

/// Multiline payload with dot-stuffing and the terminating octet.
pub fn multiline(first: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + first.len() + 16);
    out.extend_from_slice(b"+OK ");
    out.extend_from_slice(first.as_bytes());
    out.extend_from_slice(b"\r\n");
    let mut at_line_start = true;
    for &byte in body {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !body.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// TOP: headers plus the first `lines` body lines.
pub fn top_slice(raw: &[u8], lines: usize) -> Vec<u8> {
    let header_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
        .unwrap_or(raw.len());
    let mut out = raw[..header_end].to_vec();
    let mut remaining = lines;
    for line in raw[header_end..].split_inclusive(|&byte| byte == b'\n') {
        if remaining == 0 {
            break;
        }
        out.extend_from_slice(line);
        remaining -= 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse("USER alice@x.test"),
            Ok(Command::User {
                name: "alice@x.test".to_string()
            })
        );
        assert_eq!(
            Command::parse("pass p w d"),
            Ok(Command::Pass {
                secret: "p w d".to_string()
            })
        );
        assert_eq!(
            Command::parse("TOP 3 10"),
            Ok(Command::Top {
                number: 3,
                lines: 10
            })
        );
        assert_eq!(Command::parse("LIST"), Ok(Command::List { number: None }));
        assert_eq!(Command::parse("RETR x"), Err(ParseError::InvalidNumber));
        assert!(matches!(
            Command::parse("FROB"),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn dot_stuffing() {
        let body = b"line1\r\n.hidden\r\n";
        let out = multiline("message follows", body);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\r\n..hidden\r\n"));
        assert!(text.ends_with("\r\n.\r\n"));
    }

    #[test]
    fn top_limits_body_lines() {
        let raw = b"Subject: x\r\n\r\none\r\ntwo\r\nthree\r\n";
        let out = top_slice(raw, 2);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("one"));
        assert!(text.contains("two"));
        assert!(!text.contains("three"));
    }
}
