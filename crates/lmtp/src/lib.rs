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

pub mod delivery;
pub mod forward;
pub mod session;

#[derive(Clone)]
pub struct LmtpSessionManager {
    pub core: SharedCore,
}

impl LmtpSessionManager {
    pub fn new(core: SharedCore) -> Self {
        Self { core }
    }
}

pub struct Session<T: SessionStream> {
    pub core: SharedCore,
    pub instance: Arc<ServerInstance>,
    pub stream: T,
    pub is_tls: bool,
    pub helo_domain: Option<String>,
    pub transaction: Transaction,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub in_flight: InFlight,
    pub span: tracing::Span,
}

/// One LMTP mail transaction; RSET and end-of-DATA clear it.
#[derive(Default)]
pub struct Transaction {
    pub mail_from: Option<String>,
    pub declared_size: Option<usize>,
    pub recipients: Vec<Recipient>,
}

pub struct Recipient {
    pub address: String,
    pub account_id: i64,
    /// XRCPTFORWARD metadata received with this RCPT, if any.
    pub forward: Option<forward::ForwardParams>,
}

impl Transaction {
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.declared_size = None;
        self.recipients.clear();
    }
}
