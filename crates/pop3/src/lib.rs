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

pub mod op;
pub mod protocol;
pub mod session;

#[derive(Clone)]
pub struct Pop3SessionManager {
    pub core: SharedCore,
}

impl Pop3SessionManager {
    pub fn new(core: SharedCore) -> Self {
        Self { core }
    }
}

pub struct Session<T: SessionStream> {
    pub core: SharedCore,
    pub instance: Arc<ServerInstance>,
    pub stream: T,
    pub state: State,
    pub is_tls: bool,
    /// APOP banner sent in the greeting.
    pub apop_banner: String,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub in_flight: InFlight,
    pub span: tracing::Span,
}

pub enum State {
    NotAuthenticated {
        auth_failures: u32,
        username: Option<String>,
    },
    Authenticated {
        mailbox: Mailbox,
    },
}

/// The POP3 view of INBOX, frozen at authentication time (RFC 1939).
pub struct Mailbox {
    pub account_id: i64,
    pub address: String,
    pub connection_id: i64,
    pub mailbox_id: i64,
    pub messages: Vec<Pop3Message>,
    pub total_size: i64,
}

pub struct Pop3Message {
    pub uid: u32,
    pub size: i64,
    pub content_hash: String,
    pub deleted: bool,
}

impl Mailbox {
    /// Live (not DELE-marked) message by 1-based POP3 number.
    pub fn get(&self, number: usize) -> Option<&Pop3Message> {
        self.messages
            .get(number.checked_sub(1)?)
            .filter(|message| !message.deleted)
    }
}
