/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

pub mod parser;
pub mod protocol;
pub mod receiver;
pub mod utf7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    // Any state
    Capability,
    #[default]
    Noop,
    Logout,

    // Not authenticated
    StartTls,
    Authenticate,
    Login,

    // Authenticated
    Enable,
    Select,
    Examine,
    Create,
    Delete,
    Rename,
    Subscribe,
    Unsubscribe,
    List,
    Lsub,
    Namespace,
    Status,
    Append,
    Idle,
    Id,

    // Selected
    Close,
    Unselect,
    Check,
    Expunge(bool),
    Search(bool),
    Fetch(bool),
    Store(bool),
    Copy(bool),
    Move(bool),
    Sort(bool),
    Thread(bool),
}

impl Command {
    pub fn is_uid(&self) -> bool {
        matches!(
            self,
            Command::Expunge(true)
                | Command::Search(true)
                | Command::Fetch(true)
                | Command::Store(true)
                | Command::Copy(true)
                | Command::Move(true)
                | Command::Sort(true)
                | Command::Thread(true)
        )
    }

    /// FETCH and STORE arguments need `[`, `]`, `<`, `>` and `.` as their own
    /// tokens; everywhere else they are ordinary atom characters.
    pub fn tokenize_brackets(&self) -> bool {
        matches!(self, Command::Fetch(_) | Command::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseType {
    Ok,
    No,
    Bad,
    PreAuth,
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Alert,
    AlreadyExists,
    AppendUid {
        uid_validity: u32,
        uids: Vec<u32>,
    },
    AuthenticationFailed,
    AuthorizationFailed,
    BadCharset,
    Cannot,
    Capability {
        capabilities: Vec<protocol::capability::Capability>,
    },
    Closed,
    ContactAdmin,
    CopyUid {
        uid_validity: u32,
        src_uids: Vec<u32>,
        dest_uids: Vec<u32>,
    },
    HasChildren,
    HighestModseq {
        modseq: u64,
    },
    Limit,
    Modified {
        uids: Vec<u32>,
    },
    NonExistent,
    NoPerm,
    OverQuota,
    Parse,
    PermanentFlags {
        flags: Vec<Cow<'static, str>>,
    },
    ReadOnly,
    ReadWrite,
    ServerBug,
    TryCreate,
    UidNext {
        uid_next: u32,
    },
    UidValidity {
        uid_validity: u32,
    },
    Unavailable,
    UnknownCte,
    Unseen {
        seqnum: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub tag: Option<String>,
    pub code: Option<ResponseCode>,
    pub message: Cow<'static, str>,
    pub rtype: ResponseType,
}

impl StatusResponse {
    pub fn ok(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Ok,
        }
    }

    pub fn no(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::No,
        }
    }

    pub fn bad(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Bad,
        }
    }

    pub fn bye(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Bye,
        }
    }

    pub fn completed(command: Command) -> Self {
        StatusResponse::ok(format!("{command} completed"))
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse::bad(message).with_code(ResponseCode::Parse)
    }

    pub fn database_failure() -> Self {
        StatusResponse::no("Database failure.").with_code(ResponseCode::ContactAdmin)
    }

    pub fn server_busy() -> Self {
        StatusResponse::no("Server busy, try again later.")
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_code(mut self, code: ResponseCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn serialize(self, mut buf: Vec<u8>) -> Vec<u8> {
        match &self.tag {
            Some(tag) => buf.extend_from_slice(tag.as_bytes()),
            None => buf.push(b'*'),
        }
        buf.push(b' ');
        buf.extend_from_slice(self.rtype.as_str().as_bytes());
        buf.push(b' ');
        if let Some(code) = &self.code {
            buf.push(b'[');
            code.serialize(&mut buf);
            buf.extend_from_slice(b"] ");
        }
        buf.extend_from_slice(self.message.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.serialize(Vec::with_capacity(16))
    }
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Ok => "OK",
            ResponseType::No => "NO",
            ResponseType::Bad => "BAD",
            ResponseType::PreAuth => "PREAUTH",
            ResponseType::Bye => "BYE",
        }
    }
}

impl ResponseCode {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            ResponseCode::Alert => buf.extend_from_slice(b"ALERT"),
            ResponseCode::AlreadyExists => buf.extend_from_slice(b"ALREADYEXISTS"),
            ResponseCode::AppendUid { uid_validity, uids } => {
                buf.extend_from_slice(b"APPENDUID ");
                buf.extend_from_slice(uid_validity.to_string().as_bytes());
                buf.push(b' ');
                protocol::serialize_sequence(buf, uids);
            }
            ResponseCode::AuthenticationFailed => buf.extend_from_slice(b"AUTHENTICATIONFAILED"),
            ResponseCode::AuthorizationFailed => buf.extend_from_slice(b"AUTHORIZATIONFAILED"),
            ResponseCode::BadCharset => buf.extend_from_slice(b"BADCHARSET (UTF-8)"),
            ResponseCode::Cannot => buf.extend_from_slice(b"CANNOT"),
            ResponseCode::Capability { capabilities } => {
                buf.extend_from_slice(b"CAPABILITY");
                for capability in capabilities {
                    buf.push(b' ');
                    capability.serialize(buf);
                }
            }
            ResponseCode::Closed => buf.extend_from_slice(b"CLOSED"),
            ResponseCode::ContactAdmin => buf.extend_from_slice(b"CONTACTADMIN"),
            ResponseCode::CopyUid {
                uid_validity,
                src_uids,
                dest_uids,
            } => {
                buf.extend_from_slice(b"COPYUID ");
                buf.extend_from_slice(uid_validity.to_string().as_bytes());
                buf.push(b' ');
                protocol::serialize_sequence(buf, src_uids);
                buf.push(b' ');
                protocol::serialize_sequence(buf, dest_uids);
            }
            ResponseCode::HasChildren => buf.extend_from_slice(b"HASCHILDREN"),
            ResponseCode::HighestModseq { modseq } => {
                buf.extend_from_slice(b"HIGHESTMODSEQ ");
                buf.extend_from_slice(modseq.to_string().as_bytes());
            }
            ResponseCode::Limit => buf.extend_from_slice(b"LIMIT"),
            ResponseCode::Modified { uids } => {
                buf.extend_from_slice(b"MODIFIED ");
                protocol::serialize_sequence(buf, uids);
            }
            ResponseCode::NonExistent => buf.extend_from_slice(b"NONEXISTENT"),
            ResponseCode::NoPerm => buf.extend_from_slice(b"NOPERM"),
            ResponseCode::OverQuota => buf.extend_from_slice(b"OVERQUOTA"),
            ResponseCode::Parse => buf.extend_from_slice(b"PARSE"),
            ResponseCode::PermanentFlags { flags } => {
                buf.extend_from_slice(b"PERMANENTFLAGS (");
                for (pos, flag) in flags.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b' ');
                    }
                    buf.extend_from_slice(flag.as_bytes());
                }
                buf.push(b')');
            }
            ResponseCode::ReadOnly => buf.extend_from_slice(b"READ-ONLY"),
            ResponseCode::ReadWrite => buf.extend_from_slice(b"READ-WRITE"),
            ResponseCode::ServerBug => buf.extend_from_slice(b"SERVERBUG"),
            ResponseCode::TryCreate => buf.extend_from_slice(b"TRYCREATE"),
            ResponseCode::UidNext { uid_next } => {
                buf.extend_from_slice(b"UIDNEXT ");
                buf.extend_from_slice(uid_next.to_string().as_bytes());
            }
            ResponseCode::UidValidity { uid_validity } => {
                buf.extend_from_slice(b"UIDVALIDITY ");
                buf.extend_from_slice(uid_validity.to_string().as_bytes());
            }
            ResponseCode::Unavailable => buf.extend_from_slice(b"UNAVAILABLE"),
            ResponseCode::UnknownCte => buf.extend_from_slice(b"UNKNOWN-CTE"),
            ResponseCode::Unseen { seqnum } => {
                buf.extend_from_slice(b"UNSEEN ");
                buf.extend_from_slice(seqnum.to_string().as_bytes());
            }
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Command::Capability => "CAPABILITY",
            Command::Noop => "NOOP",
            Command::Logout => "LOGOUT",
            Command::StartTls => "STARTTLS",
            Command::Authenticate => "AUTHENTICATE",
            Command::Login => "LOGIN",
            Command::Enable => "ENABLE",
            Command::Select => "SELECT",
            Command::Examine => "EXAMINE",
            Command::Create => "CREATE",
            Command::Delete => "DELETE",
            Command::Rename => "RENAME",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::List => "LIST",
            Command::Lsub => "LSUB",
            Command::Namespace => "NAMESPACE",
            Command::Status => "STATUS",
            Command::Append => "APPEND",
            Command::Idle => "IDLE",
            Command::Id => "ID",
            Command::Close => "CLOSE",
            Command::Unselect => "UNSELECT",
            Command::Check => "CHECK",
            Command::Expunge(false) => "EXPUNGE",
            Command::Expunge(true) => "UID EXPUNGE",
            Command::Search(false) => "SEARCH",
            Command::Search(true) => "UID SEARCH",
            Command::Fetch(false) => "FETCH",
            Command::Fetch(true) => "UID FETCH",
            Command::Store(false) => "STORE",
            Command::Store(true) => "UID STORE",
            Command::Copy(false) => "COPY",
            Command::Copy(true) => "UID COPY",
            Command::Move(false) => "MOVE",
            Command::Move(true) => "UID MOVE",
            Command::Sort(false) => "SORT",
            Command::Sort(true) => "UID SORT",
            Command::Thread(false) => "THREAD",
            Command::Thread(true) => "UID THREAD",
        })
    }
}

impl receiver::CommandParser for Command {
    fn parse(name: &[u8], is_uid: bool) -> Option<Self> {
        Command::parse(name, is_uid)
    }

    fn tokenize_brackets(&self) -> bool {
        Command::tokenize_brackets(self)
    }
}

impl Command {
    pub fn parse(name: &[u8], is_uid: bool) -> Option<Self> {
        Some(match name {
            b"CAPABILITY" => Command::Capability,
            b"NOOP" => Command::Noop,
            b"LOGOUT" => Command::Logout,
            b"STARTTLS" => Command::StartTls,
            b"AUTHENTICATE" => Command::Authenticate,
            b"LOGIN" => Command::Login,
            b"ENABLE" => Command::Enable,
            b"SELECT" => Command::Select,
            b"EXAMINE" => Command::Examine,
            b"CREATE" => Command::Create,
            b"DELETE" => Command::Delete,
            b"RENAME" => Command::Rename,
            b"SUBSCRIBE" => Command::Subscribe,
            b"UNSUBSCRIBE" => Command::Unsubscribe,
            b"LIST" => Command::List,
            b"LSUB" => Command::Lsub,
            b"NAMESPACE" => Command::Namespace,
            b"STATUS" => Command::Status,
            b"APPEND" => Command::Append,
            b"IDLE" => Command::Idle,
            b"ID" => Command::Id,
            b"CLOSE" => Command::Close,
            b"UNSELECT" => Command::Unselect,
            b"CHECK" => Command::Check,
            b"EXPUNGE" => Command::Expunge(is_uid),
            b"SEARCH" => Command::Search(is_uid),
            b"FETCH" => Command::Fetch(is_uid),
            b"STORE" => Command::Store(is_uid),
            b"COPY" => Command::Copy(is_uid),
            b"MOVE" => Command::Move(is_uid),
            b"SORT" => Command::Sort(is_uid),
            b"THREAD" => Command::Thread(is_uid),
            _ => return None,
        })
    }
}
