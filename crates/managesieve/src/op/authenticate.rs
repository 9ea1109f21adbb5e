/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    auth::{decode_sasl_plain, AuthRequest},
    listener::{SessionResult, SessionStream},
    ServerProtocol,
};
use imap_proto::receiver::Request;

use crate::{Account, Command, Session, State};

impl<T: SessionStream> Session<T> {
    pub async fn handle_authenticate(&mut self, request: Request<Command>) -> SessionResult {
        if matches!(self.state, State::Authenticated { .. }) {
            self.write_bytes(&crate::no("Already authenticated."))
                .await
                .ok();
            return SessionResult::Continue;
        }

        let mut tokens = request.tokens.into_iter();
        let mechanism = tokens
            .next()
            .map(|token| token.unwrap_bytes())
            .unwrap_or_default();
        if !mechanism.eq_ignore_ascii_case(b"PLAIN") {
            self.write_bytes(&crate::no("Unsupported authentication mechanism."))
                .await
                .ok();
            return SessionResult::Continue;
        }
        let Some(response) = tokens.next().map(|token| token.unwrap_bytes()) else {
            self.write_bytes(&crate::no("Missing initial response."))
                .await
                .ok();
            return SessionResult::Continue;
        };

        let Some((authzid, authcid, secret)) = decode_sasl_plain(&response) else {
            self.write_bytes(&crate::no("Invalid SASL PLAIN response."))
                .await
                .ok();
            return SessionResult::Continue;
        };
        let authzid = (!authzid.is_empty()).then_some(authzid);

        let result = self
            .core
            .authenticate(AuthRequest {
                username: &authcid,
                secret: &secret,
                authzid: authzid.as_deref(),
                protocol: ServerProtocol::ManageSieve,
                remote_ip: self.remote_ip,
            })
            .await;

        match result {
            Ok(token) => {
                let connection_id = match self
                    .core
                    .store
                    .register_connection(
                        token.account_id,
                        &token.address,
                        ServerProtocol::ManageSieve.as_str(),
                        &format!("{}:{}", self.remote_ip, self.remote_port),
                        &format!("{}:{}", self.local_ip, self.local_port),
                    )
                    .await
                {
                    Ok(connection_id) => connection_id,
                    Err(_) => {
                        self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                            .await
                            .ok();
                        return SessionResult::Continue;
                    }
                };
                self.core.tracker.authenticated(&token.address);
                self.state = State::Authenticated {
                    account: Account {
                        account_id: token.account_id,
                        address: token.address,
                        connection_id,
                    },
                };
                self.write_bytes(&crate::ok("Authentication successful."))
                    .await
                    .ok();
                SessionResult::Continue
            }
            Err(err) if err.is_unauthorized() => {
                let auth_failures = match &self.state {
                    State::NotAuthenticated { auth_failures } => auth_failures + 1,
                    _ => 1,
                };
                self.write_bytes(&crate::no("Authentication failed."))
                    .await
                    .ok();
                if auth_failures >= 3 {
                    return SessionResult::Close;
                }
                self.state = State::NotAuthenticated { auth_failures };
                SessionResult::Continue
            }
            Err(_) => {
                self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                    .await
                    .ok();
                SessionResult::Continue
            }
        }
    }

    pub async fn handle_unauthenticate(&mut self) -> SessionResult {
        match std::mem::replace(
            &mut self.state,
            State::NotAuthenticated { auth_failures: 0 },
        ) {
            State::Authenticated { account } => {
                let _ = self
                    .core
                    .store
                    .unregister_connection(account.connection_id)
                    .await;
                self.core
                    .tracker
                    .disconnected(ServerProtocol::ManageSieve, Some(&account.address));
                // Keep the tracker balanced: this connection is still open.
                self.core.tracker.connected(ServerProtocol::ManageSieve);
                self.write_bytes(&crate::ok("Unauthenticate completed."))
                    .await
                    .ok();
            }
            state => {
                self.state = state;
                self.write_bytes(&crate::no("Not authenticated."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }
}
