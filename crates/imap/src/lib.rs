/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::SharedCore;
use imap_proto::{protocol::capability::Capability, ResponseCode, StatusResponse};

pub mod core;
pub mod op;

static SERVER_GREETING: &str = concat!("Sora IMAP4rev2 v", env!("CARGO_PKG_VERSION"), " ready.");

#[derive(Clone)]
pub struct ImapSessionManager {
    pub core: SharedCore,
}

impl ImapSessionManager {
    pub fn new(core: SharedCore) -> Self {
        Self { core }
    }

    pub fn greeting(is_tls: bool) -> Vec<u8> {
        StatusResponse::ok(SERVER_GREETING)
            .with_code(ResponseCode::Capability {
                capabilities: Capability::all_capabilities(false, is_tls),
            })
            .into_bytes()
    }
}

/// Result type used by the command handlers; an `Err` is written to the
/// client as-is and the session continues unless the response is fatal.
pub type OpResult = Result<(), StatusResponse>;

pub(crate) trait ImapError {
    fn into_status(self, tag: &str) -> StatusResponse;
}

impl ImapError for store::Error {
    fn into_status(self, tag: &str) -> StatusResponse {
        use store::ErrorKind;
        let response = match self.kind {
            ErrorKind::NotFound => {
                StatusResponse::no(self.message).with_code(ResponseCode::NonExistent)
            }
            ErrorKind::AlreadyExists | ErrorKind::UniqueViolation => {
                StatusResponse::no(self.message).with_code(ResponseCode::AlreadyExists)
            }
            ErrorKind::Unauthorized => {
                StatusResponse::no(self.message).with_code(ResponseCode::AuthenticationFailed)
            }
            ErrorKind::Forbidden => {
                StatusResponse::no(self.message).with_code(ResponseCode::NoPerm)
            }
            ErrorKind::Malformed => StatusResponse::bad(self.message),
            ErrorKind::QuotaExceeded => {
                StatusResponse::no(self.message).with_code(ResponseCode::OverQuota)
            }
            ErrorKind::RateLimited => {
                StatusResponse::no(self.message).with_code(ResponseCode::Limit)
            }
            ErrorKind::Transient => {
                StatusResponse::no("Server busy, try again later.")
                    .with_code(ResponseCode::ServerBug)
            }
            ErrorKind::Permanent | ErrorKind::Cancelled => {
                StatusResponse::no("Internal server error.").with_code(ResponseCode::ServerBug)
            }
        };
        response.with_tag(tag)
    }
}
