/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::IpAddr;
use std::sync::Arc;

use common::{
    listener::{limiter::InFlight, ServerInstance, SessionStream},
    SharedCore,
};
use imap_proto::receiver::{CommandParser, Receiver};

pub mod op;
pub mod session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    Capability,
    #[default]
    Noop,
    Logout,
    StartTls,
    Authenticate,
    Unauthenticate,
    ListScripts,
    GetScript,
    PutScript,
    SetActive,
    DeleteScript,
    RenameScript,
    CheckScript,
    HaveSpace,
}

impl CommandParser for Command {
    fn parse(name: &[u8], _is_uid: bool) -> Option<Self> {
        Some(match name {
            b"CAPABILITY" => Command::Capability,
            b"NOOP" => Command::Noop,
            b"LOGOUT" => Command::Logout,
            b"STARTTLS" => Command::StartTls,
            b"AUTHENTICATE" => Command::Authenticate,
            b"UNAUTHENTICATE" => Command::Unauthenticate,
            b"LISTSCRIPTS" => Command::ListScripts,
            b"GETSCRIPT" => Command::GetScript,
            b"PUTSCRIPT" => Command::PutScript,
            b"SETACTIVE" => Command::SetActive,
            b"DELETESCRIPT" => Command::DeleteScript,
            b"RENAMESCRIPT" => Command::RenameScript,
            b"CHECKSCRIPT" => Command::CheckScript,
            b"HAVESPACE" => Command::HaveSpace,
            _ => return None,
        })
    }

    fn tokenize_brackets(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct ManageSieveSessionManager {
    pub core: SharedCore,
}

impl ManageSieveSessionManager {
    pub fn new(core: SharedCore) -> Self {
        Self { core }
    }
}

pub struct Session<T: SessionStream> {
    pub core: SharedCore,
    pub instance: Arc<ServerInstance>,
    pub receiver: Receiver<Command>,
    pub stream: T,
    pub state: State,
    pub is_tls: bool,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub in_flight: InFlight,
    pub span: tracing::Span,
}

pub enum State {
    NotAuthenticated { auth_failures: u32 },
    Authenticated { account: Account },
}

pub struct Account {
    pub account_id: i64,
    pub address: String,
    pub connection_id: i64,
}

/// RFC 5804 responses quote their human-readable text.
pub fn ok(message: &str) -> Vec<u8> {
    format!("OK \"{message}\"\r\n").into_bytes()
}

pub fn no(message: &str) -> Vec<u8> {
    format!("NO \"{message}\"\r\n").into_bytes()
}

pub fn no_code(code: &str, message: &str) -> Vec<u8> {
    format!("NO ({code}) \"{message}\"\r\n").into_bytes()
}

pub fn bye(message: &str) -> Vec<u8> {
    format!("BYE \"{message}\"\r\n").into_bytes()
}
