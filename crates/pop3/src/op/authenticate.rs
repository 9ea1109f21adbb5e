/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use base64::{engine::general_purpose::STANDARD, Engine};
use common::{
    auth::{decode_sasl_plain, AuthRequest},
    listener::{SessionResult, SessionStream},
    ServerProtocol,
};
use tokio::io::AsyncReadExt;

use crate::{protocol, Mailbox, Pop3Message, Session, State};

impl<T: SessionStream> Session<T> {
    pub async fn handle_user(&mut self, name: String) -> SessionResult {
        match &mut self.state {
            State::NotAuthenticated { username, .. } => {
                *username = Some(name);
                self.write_bytes(&protocol::ok("Send PASS.")).await.ok();
                SessionResult::Continue
            }
            State::Authenticated { .. } => {
                self.write_bytes(&protocol::err("Already authenticated."))
                    .await
                    .ok();
                SessionResult::Continue
            }
        }
    }

    pub async fn handle_pass(&mut self, secret: &str) -> SessionResult {
        let username = match &self.state {
            State::NotAuthenticated {
                username: Some(username),
                ..
            } => username.clone(),
            State::NotAuthenticated { .. } => {
                self.write_bytes(&protocol::err("Send USER first."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
            State::Authenticated { .. } => {
                self.write_bytes(&protocol::err("Already authenticated."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
        };
        self.authenticate(&username, secret, None).await
    }

    /// APOP digest authentication against the greeting banner. Only legacy
    /// plain-text credential rows can be verified this way.
    pub async fn handle_apop(&mut self, name: &str, digest: &str) -> SessionResult {
        let credential = match self.core.store.credential_by_address(name).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                self.write_bytes(&protocol::err("Authentication failed."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
            Err(_) => {
                self.write_bytes(&protocol::err("Temporary server error."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
        };

        if credential.password_hash.starts_with('$') {
            self.write_bytes(&protocol::err(
                "APOP is not available for this account.",
            ))
            .await
            .ok();
            return SessionResult::Continue;
        }

        let expected = format!(
            "{:x}",
            md5::compute(format!("{}{}", self.apop_banner, credential.password_hash))
        );
        if expected == digest.to_ascii_lowercase() {
            // Replay through the common path so rate limiting, accounting
            // and connection registration all apply.
            self.authenticate(name, &credential.password_hash, None)
                .await
        } else {
            self.write_bytes(&protocol::err("Authentication failed."))
                .await
                .ok();
            SessionResult::Continue
        }
    }

    pub async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> SessionResult {
        match mechanism {
            "PLAIN" => {
                let response = match initial {
                    Some(initial) => initial.into_bytes(),
                    None => {
                        self.write_bytes(b"+ \r\n").await.ok();
                        match self.read_line().await {
                            Some(line) => line,
                            None => return SessionResult::Close,
                        }
                    }
                };
                match decode_sasl_plain(&response) {
                    Some((authzid, authcid, secret)) => {
                        let authzid = (!authzid.is_empty()).then_some(authzid);
                        self.authenticate(&authcid.clone(), &secret, authzid.as_deref())
                            .await
                    }
                    None => {
                        self.write_bytes(&protocol::err("Invalid SASL response."))
                            .await
                            .ok();
                        SessionResult::Continue
                    }
                }
            }
            "LOGIN" => {
                self.write_bytes(b"+ VXNlcm5hbWU6\r\n").await.ok();
                let Some(username) = self.read_line_base64().await else {
                    return SessionResult::Close;
                };
                self.write_bytes(b"+ UGFzc3dvcmQ6\r\n").await.ok();
                let Some(secret) = self.read_line_base64().await else {
                    return SessionResult::Close;
                };
                self.authenticate(&username, &secret, None).await
            }
            _ => {
                self.write_bytes(&protocol::err("Unsupported mechanism."))
                    .await
                    .ok();
                SessionResult::Continue
            }
        }
    }

    async fn read_line(&mut self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 1024];
        let mut line = Vec::new();
        loop {
            let read = tokio::time::timeout(
                self.core.config.pop3.timeout,
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
            if line.len() > 8192 {
                return None;
            }
        }
    }

    async fn read_line_base64(&mut self) -> Option<String> {
        let line = self.read_line().await?;
        let decoded = STANDARD.decode(&line).ok()?;
        String::from_utf8(decoded).ok()
    }

    pub(crate) async fn authenticate(
        &mut self,
        username: &str,
        secret: &str,
        authzid: Option<&str>,
    ) -> SessionResult {
        let result = self
            .core
            .authenticate(AuthRequest {
                username,
                secret,
                authzid,
                protocol: ServerProtocol::Pop3,
                remote_ip: self.remote_ip,
            })
            .await;

        let token = match result {
            Ok(token) => token,
            Err(err) if err.is_unauthorized() => {
                let auth_failures = match &self.state {
                    State::NotAuthenticated { auth_failures, .. } => auth_failures + 1,
                    _ => 1,
                };
                self.write_bytes(&protocol::err("Authentication failed."))
                    .await
                    .ok();
                if auth_failures >= self.core.config.pop3.max_auth_failures {
                    return SessionResult::Close;
                }
                self.state = State::NotAuthenticated {
                    auth_failures,
                    username: None,
                };
                return SessionResult::Continue;
            }
            Err(_) => {
                self.write_bytes(&protocol::err("Temporary server error."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
        };

        // POP3 operates on a frozen view of INBOX.
        let mailbox = match self.load_mailbox(token.account_id, &token.address).await {
            Ok(mailbox) => mailbox,
            Err(()) => {
                self.write_bytes(&protocol::err("Temporary server error."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
        };

        let count = mailbox.messages.len();
        self.core.tracker.authenticated(&token.address);
        self.state = State::Authenticated { mailbox };
        self.write_bytes(&protocol::ok(&format!("Mailbox locked, {count} messages.")))
            .await
            .ok();
        SessionResult::Continue
    }

    async fn load_mailbox(&self, account_id: i64, address: &str) -> Result<Mailbox, ()> {
        let inbox = self
            .core
            .store
            .mailbox_by_name(account_id, "INBOX", false)
            .await
            .map_err(|_| ())?
            .ok_or(())?;
        let messages = self
            .core
            .store
            .messages_by_uids(inbox.id, None, None, false)
            .await
            .map_err(|_| ())?;
        let connection_id = self
            .core
            .store
            .register_connection(
                account_id,
                address,
                ServerProtocol::Pop3.as_str(),
                &format!("{}:{}", self.remote_ip, self.remote_port),
                &format!("{}:{}", self.local_ip, self.local_port),
            )
            .await
            .map_err(|_| ())?;

        let total_size = messages.iter().map(|message| message.size).sum();
        Ok(Mailbox {
            account_id,
            address: address.to_string(),
            connection_id,
            mailbox_id: inbox.id,
            messages: messages
                .into_iter()
                .map(|message| Pop3Message {
                    uid: message.uid,
                    size: message.size,
                    content_hash: message.content_hash,
                    deleted: false,
                })
                .collect(),
            total_size,
        })
    }

    /// Dovecot-style XCLIENT forwarding, honored only from trusted proxies.
    pub async fn handle_xclient(&mut self, params: &str) -> SessionResult {
        let trusted = self
            .core
            .config
            .lmtp
            .trusted_networks
            .iter()
            .any(|network| network.matches(&self.remote_ip));
        if !trusted {
            self.write_bytes(&protocol::err("Connection not from trusted proxy."))
                .await
                .ok();
            return SessionResult::Continue;
        }

        for pair in params.split_whitespace() {
            if let Some((key, value)) = pair.split_once('=') {
                if key.eq_ignore_ascii_case("ADDR") {
                    if let Ok(ip) = value.parse() {
                        tracing::debug!(parent: &self.span, event = "xclient",
                            forwarded_ip = value, "Updated client address.");
                        self.remote_ip = ip;
                    }
                } else if key.eq_ignore_ascii_case("PORT") {
                    if let Ok(port) = value.parse() {
                        self.remote_port = port;
                    }
                }
            }
        }
        self.write_bytes(&protocol::ok("XCLIENT parameters accepted."))
            .await
            .ok();
        SessionResult::Continue
    }
}
