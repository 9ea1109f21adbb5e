/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use common::{
    auth::{decode_sasl_plain, AuthRequest},
    listener::SessionStream,
    ServerProtocol,
};
use imap_proto::{
    receiver::Request, Command, ResponseCode, StatusResponse,
};

use crate::{
    core::{Session, SessionData, State},
    ImapError, OpResult,
};

impl<T: SessionStream> Session<T> {
    pub async fn handle_login(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_login()?;
        self.authenticate(&args.tag.clone(), &args.username, &args.secret, None)
            .await
    }

    pub async fn handle_authenticate(&mut self, request: Request<Command>) -> OpResult {
        let args = request.parse_authenticate()?;
        if args.mechanism != "PLAIN" {
            return Err(StatusResponse::no("Unsupported authentication mechanism.")
                .with_code(ResponseCode::Cannot)
                .with_tag(args.tag));
        }

        // SASL-IR carries the response inline; otherwise issue a
        // continuation request and read one base64 line.
        let response = match args.initial_response {
            Some(response) => response,
            None => {
                self.write_bytes(b"+ \"\"\r\n").await.ok();
                match self.read_sasl_line().await {
                    Some(line) => line,
                    None => {
                        return Err(StatusResponse::bad("Authentication aborted.")
                            .with_tag(args.tag))
                    }
                }
            }
        };

        match decode_sasl_plain(&response) {
            Some((authzid, authcid, secret)) => {
                let authzid = (!authzid.is_empty()).then_some(authzid);
                self.authenticate(&args.tag, &authcid, &secret, authzid.as_deref())
                    .await
            }
            None => Err(StatusResponse::bad("Invalid SASL PLAIN response.")
                .with_tag(args.tag)),
        }
    }

    async fn read_sasl_line(&mut self) -> Option<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 4096];
        let mut line = Vec::new();
        loop {
            let read = tokio::time::timeout(
                self.core.config.imap.timeout_unauth,
                self.stream.read(&mut buf),
            )
            .await
            .ok()?
            .ok()?;
            if read == 0 {
                return None;
            }
            line.extend_from_slice(&buf[..read]);
            if line.ends_with(b"\n") {
                while matches!(line.last(), Some(b'\r') | Some(b'\n')) {
                    line.pop();
                }
                return if line == b"*" { None } else { Some(line) };
            }
            if line.len() > 65536 {
                return None;
            }
        }
    }

    async fn authenticate(
        &mut self,
        tag: &str,
        username: &str,
        secret: &str,
        authzid: Option<&str>,
    ) -> OpResult {
        let result = self
            .core
            .authenticate(AuthRequest {
                username,
                secret,
                authzid,
                protocol: ServerProtocol::Imap,
                remote_ip: self.remote_ip,
            })
            .await;

        match result {
            Ok(token) => {
                let connection_id = self
                    .core
                    .store
                    .register_connection(
                        token.account_id,
                        &token.address,
                        ServerProtocol::Imap.as_str(),
                        &format!("{}:{}", self.remote_ip, self.remote_port),
                        &format!("{}:{}", self.local_ip, self.local_port),
                    )
                    .await
                    .map_err(|err| err.into_status(tag))?;
                self.core.tracker.authenticated(&token.address);

                tracing::debug!(parent: &self.span, event = "authenticated",
                    account_id = token.account_id, account = token.address,
                    "Authentication successful.");

                self.state = State::Authenticated {
                    data: Arc::new(SessionData::new(
                        token.account_id,
                        token.address,
                        connection_id,
                    )),
                };
                self.write_response(
                    StatusResponse::ok("Authentication successful")
                        .with_code(ResponseCode::Capability {
                            capabilities:
                                imap_proto::protocol::capability::Capability::all_capabilities(
                                    true,
                                    self.is_tls,
                                ),
                        })
                        .with_tag(tag),
                )
                .await
                .ok();
                Ok(())
            }
            Err(err) if err.is_unauthorized() => {
                let auth_failures = match &self.state {
                    State::NotAuthenticated { auth_failures } => auth_failures + 1,
                    _ => 1,
                };
                if auth_failures >= self.core.config.imap.max_auth_failures {
                    self.write_response(
                        StatusResponse::no("Too many authentication failures.")
                            .with_code(ResponseCode::AuthenticationFailed)
                            .with_tag(tag),
                    )
                    .await
                    .ok();
                    Err(StatusResponse::bye("Too many authentication failures."))
                } else {
                    self.state = State::NotAuthenticated { auth_failures };
                    Err(StatusResponse::no("Authentication failed.")
                        .with_code(ResponseCode::AuthenticationFailed)
                        .with_tag(tag))
                }
            }
            Err(err) => Err(err.into_status(tag)),
        }
    }
}
