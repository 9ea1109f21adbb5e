/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use chrono::NaiveDate;

use crate::{
    protocol::Sequence,
    receiver::{Request, Token},
    Command, StatusResponse,
};

use super::{bad, parse_date, parse_sequence_set, Tokens};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchKey {
    And(Vec<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    Not(Box<SearchKey>),
    All,
    Answered,
    Bcc(String),
    Before(NaiveDate),
    Body(String),
    Cc(String),
    Deleted,
    Draft,
    Flagged,
    From(String),
    Header(String, String),
    Keyword(String),
    Larger(u64),
    ModSeq(u64),
    New,
    Old,
    On(NaiveDate),
    Recent,
    Seen,
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    SeqSet(Sequence),
    Since(NaiveDate),
    Smaller(u64),
    Subject(String),
    Text(String),
    To(String),
    Uid(Sequence),
    Unseen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOption {
    Min,
    Max,
    All,
    Count,
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Arrival,
    Cc,
    Date,
    From,
    Size,
    Subject,
    To,
}

#[derive(Debug, Clone, Copy)]
pub struct SortSpec {
    pub field: SortField,
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAlgorithm {
    OrderedSubject,
    References,
}

#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub tag: String,
    pub result_options: Vec<ResultOption>,
    pub key: SearchKey,
    pub sort: Option<Vec<SortSpec>>,
    pub thread: Option<ThreadAlgorithm>,
}

impl Request<Command> {
    pub fn parse_search(self) -> Result<SearchArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let mut result_options = Vec::new();
            if matches!(tokens.peek(), Some(Token::Argument(arg)) if arg.eq_ignore_ascii_case(b"RETURN"))
            {
                tokens.next();
                tokens.expect_open()?;
                loop {
                    match tokens.expect_next()? {
                        Token::ParenthesisClose => break,
                        token if token.eq_ignore_ascii_case(b"MIN") => {
                            result_options.push(ResultOption::Min)
                        }
                        token if token.eq_ignore_ascii_case(b"MAX") => {
                            result_options.push(ResultOption::Max)
                        }
                        token if token.eq_ignore_ascii_case(b"ALL") => {
                            result_options.push(ResultOption::All)
                        }
                        token if token.eq_ignore_ascii_case(b"COUNT") => {
                            result_options.push(ResultOption::Count)
                        }
                        token if token.eq_ignore_ascii_case(b"SAVE") => {
                            result_options.push(ResultOption::Save)
                        }
                        _ => return Err("Unsupported RETURN option.".into()),
                    }
                }
            }

            skip_charset(&mut tokens)?;
            let key = parse_key_list(&mut tokens)?;

            Ok(SearchArgs {
                tag: String::new(),
                result_options,
                key,
                sort: None,
                thread: None,
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

    pub fn parse_sort(self) -> Result<SearchArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            tokens.expect_open()?;
            let mut sort = Vec::new();
            let mut reverse = false;
            loop {
                match tokens.expect_next()? {
                    Token::ParenthesisClose => break,
                    token if token.eq_ignore_ascii_case(b"REVERSE") => reverse = true,
                    token => {
                        let field = if token.eq_ignore_ascii_case(b"ARRIVAL") {
                            SortField::Arrival
                        } else if token.eq_ignore_ascii_case(b"CC") {
                            SortField::Cc
                        } else if token.eq_ignore_ascii_case(b"DATE") {
                            SortField::Date
                        } else if token.eq_ignore_ascii_case(b"FROM") {
                            SortField::From
                        } else if token.eq_ignore_ascii_case(b"SIZE") {
                            SortField::Size
                        } else if token.eq_ignore_ascii_case(b"SUBJECT") {
                            SortField::Subject
                        } else if token.eq_ignore_ascii_case(b"TO") {
                            SortField::To
                        } else {
                            return Err("Unknown sort key.".into());
                        };
                        sort.push(SortSpec { field, reverse });
                        reverse = false;
                    }
                }
            }
            if sort.is_empty() {
                return Err("At least one sort key is required.".into());
            }

            // SORT carries a mandatory charset atom before the keys.
            expect_charset(&mut tokens)?;
            let key = parse_key_list(&mut tokens)?;
            Ok((sort, key))
        })();
        match result {
            Ok((sort, key)) => Ok(SearchArgs {
                tag: tokens.tag,
                result_options: Vec::new(),
                key,
                sort: Some(sort),
                thread: None,
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }

    pub fn parse_thread(self) -> Result<SearchArgs, StatusResponse> {
        let mut tokens = Tokens::new(self);
        let result: super::Result<_> = (|| {
            let algorithm = match tokens.expect_next()? {
                token if token.eq_ignore_ascii_case(b"ORDEREDSUBJECT") => {
                    ThreadAlgorithm::OrderedSubject
                }
                token if token.eq_ignore_ascii_case(b"REFERENCES") => {
                    ThreadAlgorithm::References
                }
                _ => return Err("Unknown threading algorithm.".into()),
            };
            expect_charset(&mut tokens)?;
            let key = parse_key_list(&mut tokens)?;
            Ok((algorithm, key))
        })();
        match result {
            Ok((algorithm, key)) => Ok(SearchArgs {
                tag: tokens.tag,
                result_options: Vec::new(),
                key,
                sort: None,
                thread: Some(algorithm),
            }),
            Err(message) => Err(bad(tokens.tag, message)),
        }
    }
}

fn skip_charset(tokens: &mut Tokens) -> super::Result<()> {
    if matches!(tokens.peek(), Some(Token::Argument(arg)) if arg.eq_ignore_ascii_case(b"CHARSET"))
    {
        tokens.next();
        check_charset(&tokens.expect_bytes()?)?;
    }
    Ok(())
}

fn expect_charset(tokens: &mut Tokens) -> super::Result<()> {
    check_charset(&tokens.expect_bytes()?)
}

fn check_charset(charset: &[u8]) -> super::Result<()> {
    if charset.eq_ignore_ascii_case(b"UTF-8") || charset.eq_ignore_ascii_case(b"US-ASCII") {
        Ok(())
    } else {
        Err(format!(
            "Unsupported charset {:?}.",
            String::from_utf8_lossy(charset)
        )
        .into())
    }
}

/// Parses the remaining keys as an implicit AND.
fn parse_key_list(tokens: &mut Tokens) -> super::Result<SearchKey> {
    let mut keys = Vec::new();
    while !tokens.is_empty() {
        keys.push(parse_key(tokens)?);
    }
    Ok(match keys.len() {
        0 => SearchKey::All,
        1 => keys.pop().unwrap(),
        _ => SearchKey::And(keys),
    })
}

fn parse_key(tokens: &mut Tokens) -> super::Result<SearchKey> {
    let token = tokens.expect_next()?;
    match token {
        Token::ParenthesisOpen => {
            let mut keys = Vec::new();
            loop {
                match tokens.peek() {
                    Some(Token::ParenthesisClose) => {
                        tokens.next();
                        break;
                    }
                    Some(_) => keys.push(parse_key(tokens)?),
                    None => return Err("Unbalanced parenthesis in search keys.".into()),
                }
            }
            Ok(match keys.len() {
                0 => SearchKey::All,
                1 => keys.pop().unwrap(),
                _ => SearchKey::And(keys),
            })
        }
        Token::Argument(name) => parse_named_key(&name, tokens),
        _ => Err("Invalid search key.".into()),
    }
}

fn parse_named_key(name: &[u8], tokens: &mut Tokens) -> super::Result<SearchKey> {
    let key = if name.eq_ignore_ascii_case(b"ALL") {
        SearchKey::All
    } else if name.eq_ignore_ascii_case(b"ANSWERED") {
        SearchKey::Answered
    } else if name.eq_ignore_ascii_case(b"BCC") {
        SearchKey::Bcc(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"BEFORE") {
        SearchKey::Before(parse_date(&tokens.expect_bytes()?)?)
    } else if name.eq_ignore_ascii_case(b"BODY") {
        SearchKey::Body(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"CC") {
        SearchKey::Cc(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"DELETED") {
        SearchKey::Deleted
    } else if name.eq_ignore_ascii_case(b"DRAFT") {
        SearchKey::Draft
    } else if name.eq_ignore_ascii_case(b"FLAGGED") {
        SearchKey::Flagged
    } else if name.eq_ignore_ascii_case(b"FROM") {
        SearchKey::From(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"HEADER") {
        let header = tokens.expect_string()?;
        let value = tokens.expect_string()?;
        SearchKey::Header(header, value)
    } else if name.eq_ignore_ascii_case(b"KEYWORD") {
        SearchKey::Keyword(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"LARGER") {
        SearchKey::Larger(tokens.expect_number()?)
    } else if name.eq_ignore_ascii_case(b"MODSEQ") {
        // Optional entry-name and entry-type arguments precede the value.
        let mut value = tokens.expect_bytes()?;
        if value.first() == Some(&b'/') || value.starts_with(b"\"") {
            let _entry_type = tokens.expect_bytes()?;
            value = tokens.expect_bytes()?;
        }
        SearchKey::ModSeq(super::parse_number(&value)?)
    } else if name.eq_ignore_ascii_case(b"NEW") {
        SearchKey::New
    } else if name.eq_ignore_ascii_case(b"NOT") {
        SearchKey::Not(Box::new(parse_key(tokens)?))
    } else if name.eq_ignore_ascii_case(b"OLD") {
        SearchKey::Old
    } else if name.eq_ignore_ascii_case(b"ON") {
        SearchKey::On(parse_date(&tokens.expect_bytes()?)?)
    } else if name.eq_ignore_ascii_case(b"OR") {
        let left = parse_key(tokens)?;
        let right = parse_key(tokens)?;
        SearchKey::Or(Box::new(left), Box::new(right))
    } else if name.eq_ignore_ascii_case(b"RECENT") {
        SearchKey::Recent
    } else if name.eq_ignore_ascii_case(b"SEEN") {
        SearchKey::Seen
    } else if name.eq_ignore_ascii_case(b"SENTBEFORE") {
        SearchKey::SentBefore(parse_date(&tokens.expect_bytes()?)?)
    } else if name.eq_ignore_ascii_case(b"SENTON") {
        SearchKey::SentOn(parse_date(&tokens.expect_bytes()?)?)
    } else if name.eq_ignore_ascii_case(b"SENTSINCE") {
        SearchKey::SentSince(parse_date(&tokens.expect_bytes()?)?)
    } else if name.eq_ignore_ascii_case(b"SINCE") {
        SearchKey::Since(parse_date(&tokens.expect_bytes()?)?)
    } else if name.eq_ignore_ascii_case(b"SMALLER") {
        SearchKey::Smaller(tokens.expect_number()?)
    } else if name.eq_ignore_ascii_case(b"SUBJECT") {
        SearchKey::Subject(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"TEXT") {
        SearchKey::Text(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"TO") {
        SearchKey::To(tokens.expect_string()?)
    } else if name.eq_ignore_ascii_case(b"UID") {
        SearchKey::Uid(parse_sequence_set(&tokens.expect_bytes()?)?)
    } else if name.eq_ignore_ascii_case(b"UNANSWERED") {
        SearchKey::Not(Box::new(SearchKey::Answered))
    } else if name.eq_ignore_ascii_case(b"UNDELETED") {
        SearchKey::Not(Box::new(SearchKey::Deleted))
    } else if name.eq_ignore_ascii_case(b"UNDRAFT") {
        SearchKey::Not(Box::new(SearchKey::Draft))
    } else if name.eq_ignore_ascii_case(b"UNFLAGGED") {
        SearchKey::Not(Box::new(SearchKey::Flagged))
    } else if name.eq_ignore_ascii_case(b"UNKEYWORD") {
        SearchKey::Not(Box::new(SearchKey::Keyword(tokens.expect_string()?)))
    } else if name.eq_ignore_ascii_case(b"UNSEEN") {
        SearchKey::Unseen
    } else {
        // A bare sequence set is a valid key.
        return parse_sequence_set(name).map(SearchKey::SeqSet);
    };
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Receiver;

    fn parse(line: &str) -> SearchArgs {
        let mut receiver: Receiver<Command> = Receiver::default();
        receiver
            .parse(&mut line.as_bytes().iter())
            .unwrap()
            .parse_search()
            .unwrap()
    }

    #[test]
    fn implicit_and() {
        let args = parse("A1 SEARCH UNSEEN LARGER 1024\r\n");
        assert_eq!(
            args.key,
            SearchKey::And(vec![SearchKey::Unseen, SearchKey::Larger(1024)])
        );
    }

    #[test]
    fn not_seen() {
        let args = parse("A3 SEARCH NOT SEEN\r\n");
        assert_eq!(args.key, SearchKey::Not(Box::new(SearchKey::Seen)));
    }

    #[test]
    fn or_and_grouping() {
        let args = parse("A4 SEARCH OR FROM \"alice\" (TO \"bob\" UNSEEN)\r\n");
        match args.key {
            SearchKey::Or(left, right) => {
                assert_eq!(*left, SearchKey::From("alice".to_string()));
                assert_eq!(
                    *right,
                    SearchKey::And(vec![
                        SearchKey::To("bob".to_string()),
                        SearchKey::Unseen
                    ])
                );
            }
            other => panic!("unexpected key: {other:?}"),
        }
    }

    #[test]
    fn esearch_return_options() {
        let args = parse("A5 UID SEARCH RETURN (MIN MAX COUNT) UID 1:100\r\n");
        assert_eq!(
            args.result_options,
            vec![ResultOption::Min, ResultOption::Max, ResultOption::Count]
        );
        assert!(matches!(args.key, SearchKey::Uid(_)));
    }

    #[test]
    fn sort_program() {
        let mut receiver: Receiver<Command> = Receiver::default();
        let args = receiver
            .parse(&mut b"A6 SORT (REVERSE SUBJECT DATE) UTF-8 ALL\r\n".iter())
            .unwrap()
            .parse_sort()
            .unwrap();
        let sort = args.sort.unwrap();
        assert_eq!(sort.len(), 2);
        assert!(sort[0].reverse);
        assert_eq!(sort[0].field, SortField::Subject);
        assert!(!sort[1].reverse);
    }

    #[test]
    fn bare_sequence_key() {
        let args = parse("A7 SEARCH 2:4\r\n");
        assert!(matches!(args.key, SearchKey::SeqSet(_)));
    }
}
