/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::{SessionResult, SessionStream};
use imap_proto::{
    receiver::{self, Request},
    Command, ResponseType, StatusResponse,
};

use super::{Session, State};

impl<T: SessionStream> Session<T> {
    pub async fn ingest(&mut self, bytes: &[u8]) -> SessionResult {
        self.core.metrics.add_bytes_in(bytes.len() as u64);

        let mut bytes = bytes.iter();
        let mut requests = Vec::with_capacity(2);
        let mut needs_literal = None;

        loop {
            match self.receiver.parse(&mut bytes) {
                Ok(request) => match self.validate(request) {
                    Ok(request) => requests.push(request),
                    Err(response) => {
                        if self.write_response(response).await.is_err() {
                            return SessionResult::Close;
                        }
                    }
                },
                Err(receiver::Error::NeedsMoreData) => break,
                Err(receiver::Error::NeedsLiteral { size }) => {
                    needs_literal = Some(size);
                    break;
                }
                Err(receiver::Error::Error { response }) => {
                    if self.write_response(response).await.is_err() {
                        return SessionResult::Close;
                    }
                    break;
                }
            }
        }

        for request in requests {
            let result = match request.command {
                Command::Capability => self.handle_capability(request).await,
                Command::Noop | Command::Check => self.handle_noop(request).await,
                Command::Id => self.handle_id(request).await,
                Command::Logout => {
                    self.handle_logout(request).await.ok();
                    return SessionResult::Close;
                }
                Command::StartTls => {
                    return match self
                        .write_response(
                            StatusResponse::ok("Begin TLS negotiation now")
                                .with_tag(request.tag),
                        )
                        .await
                    {
                        Ok(()) => SessionResult::UpgradeTls,
                        Err(()) => SessionResult::Close,
                    };
                }
                Command::Authenticate => self.handle_authenticate(request).await,
                Command::Login => self.handle_login(request).await,
                Command::Enable => self.handle_enable(request).await,
                Command::Select => self.handle_select(request, false).await,
                Command::Examine => self.handle_select(request, true).await,
                Command::Create => self.handle_create(request).await,
                Command::Delete => self.handle_delete(request).await,
                Command::Rename => self.handle_rename(request).await,
                Command::Subscribe => self.handle_subscribe(request, true).await,
                Command::Unsubscribe => self.handle_subscribe(request, false).await,
                Command::List => self.handle_list(request, false).await,
                Command::Lsub => self.handle_list(request, true).await,
                Command::Namespace => self.handle_namespace(request).await,
                Command::Status => self.handle_status(request).await,
                Command::Append => self.handle_append(request).await,
                Command::Idle => self.handle_idle(request).await,
                Command::Close => self.handle_close(request).await,
                Command::Unselect => self.handle_unselect(request).await,
                Command::Expunge(is_uid) => self.handle_expunge(request, is_uid).await,
                Command::Search(is_uid) => self.handle_search(request, is_uid).await,
                Command::Fetch(is_uid) => self.handle_fetch(request, is_uid).await,
                Command::Store(is_uid) => self.handle_store(request, is_uid).await,
                Command::Copy(is_uid) => self.handle_copy_move(request, false, is_uid).await,
                Command::Move(is_uid) => self.handle_copy_move(request, true, is_uid).await,
                Command::Sort(is_uid) => self.handle_sort(request, is_uid).await,
                Command::Thread(is_uid) => self.handle_thread(request, is_uid).await,
            };

            if let Err(response) = result {
                let is_bye = matches!(response.rtype, ResponseType::Bye);
                if self.write_response(response).await.is_err() || is_bye {
                    return SessionResult::Close;
                }
            }
        }

        if let Some(size) = needs_literal {
            if self
                .write_bytes(format!("+ Ready for {size} bytes.\r\n").as_bytes())
                .await
                .is_err()
            {
                return SessionResult::Close;
            }
        }

        SessionResult::Continue
    }

    /// Checks a command against the session state before dispatch.
    fn validate(&self, request: Request<Command>) -> Result<Request<Command>, StatusResponse> {
        match &request.command {
            Command::Capability | Command::Noop | Command::Logout | Command::Id => Ok(request),
            Command::StartTls => {
                if self.is_tls {
                    Err(StatusResponse::no("Already in TLS mode.").with_tag(request.tag))
                } else if !self.instance.acceptor.is_tls() {
                    Err(StatusResponse::no("TLS is not available.").with_tag(request.tag))
                } else {
                    Ok(request)
                }
            }
            Command::Authenticate => {
                if !self.state.is_authenticated() {
                    Ok(request)
                } else {
                    Err(StatusResponse::no("Already authenticated.").with_tag(request.tag))
                }
            }
            Command::Login => {
                if self.state.is_authenticated() {
                    Err(StatusResponse::no("Already authenticated.").with_tag(request.tag))
                } else if !self.is_tls && !self.core.config.imap.allow_plain_auth {
                    Err(
                        StatusResponse::no("LOGIN is disabled on the clear-text port.")
                            .with_tag(request.tag),
                    )
                } else {
                    Ok(request)
                }
            }
            Command::Enable
            | Command::Select
            | Command::Examine
            | Command::Create
            | Command::Delete
            | Command::Rename
            | Command::Subscribe
            | Command::Unsubscribe
            | Command::List
            | Command::Lsub
            | Command::Namespace
            | Command::Status
            | Command::Append
            | Command::Idle => {
                if self.state.is_authenticated() {
                    Ok(request)
                } else {
                    Err(StatusResponse::no("Not authenticated.").with_tag(request.tag))
                }
            }
            Command::Close
            | Command::Unselect
            | Command::Check
            | Command::Expunge(_)
            | Command::Search(_)
            | Command::Fetch(_)
            | Command::Store(_)
            | Command::Copy(_)
            | Command::Move(_)
            | Command::Sort(_)
            | Command::Thread(_) => match &self.state {
                State::Selected { mailbox, .. } => {
                    if !mailbox.read_only
                        || !matches!(
                            request.command,
                            Command::Store(_) | Command::Expunge(_) | Command::Move(_)
                        )
                    {
                        Ok(request)
                    } else {
                        Err(StatusResponse::no("Not permitted in EXAMINE state.")
                            .with_tag(request.tag))
                    }
                }
                State::Authenticated { .. } => {
                    Err(StatusResponse::bad("No mailbox is selected.").with_tag(request.tag))
                }
                State::NotAuthenticated { .. } => {
                    Err(StatusResponse::no("Not authenticated.").with_tag(request.tag))
                }
            },
        }
    }
}
