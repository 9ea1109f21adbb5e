/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::IpAddr, net::SocketAddr, sync::Arc};

use common::{auth::verify_password, ServerProtocol, SharedCore};
use rand::Rng;

pub mod imap;
pub mod lmtp;
pub mod pop3;
pub mod prelookup;
pub mod sieve;
pub mod splice;

/// Buffered line reader used during the authentication phase; bytes read
/// past the consumed lines (pipelined commands) are replayed to the backend
/// before the splice starts.
pub struct LineReader {
    buf: Vec<u8>,
}

impl Default for LineReader {
    fn default() -> Self {
        LineReader {
            buf: Vec::with_capacity(256),
        }
    }
}

impl LineReader {
    pub async fn next_line<T>(
        &mut self,
        stream: &mut T,
        timeout: std::time::Duration,
    ) -> Option<String>
    where
        T: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;
        let mut chunk = vec![0u8; 4096];
        loop {
            if let Some(position) = self.buf.iter().position(|&byte| byte == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=position).collect();
                return Some(String::from_utf8_lossy(&raw).trim_end().to_string());
            }
            if self.buf.len() > 65536 {
                return None;
            }
            let read = tokio::time::timeout(timeout, stream.read(&mut chunk))
                .await
                .ok()?
                .ok()?;
            if read == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Splits a protocol line into whitespace-separated arguments, honoring
/// IMAP-style double quotes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in line.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' && in_quotes {
            escaped = true;
        } else if ch == '"' {
            if in_quotes {
                args.push(std::mem::take(&mut current));
                in_quotes = false;
            } else {
                in_quotes = true;
            }
        } else if ch.is_ascii_whitespace() && !in_quotes {
            if !current.is_empty() {
                args.push(std::mem::take(&mut current));
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Quotes a string for replay inside an IMAP command.
pub fn imap_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_splitting() {
        assert_eq!(
            split_args("a1 LOGIN \"alice@x.test\" \"p w\""),
            vec!["a1", "LOGIN", "alice@x.test", "p w"]
        );
        assert_eq!(
            split_args("a2 LOGIN bob secret"),
            vec!["a2", "LOGIN", "bob", "secret"]
        );
        assert_eq!(split_args("a3 LOGIN \"es\\\"c\" x"), vec![
            "a3", "LOGIN", "es\"c", "x"
        ]);
    }

    #[test]
    fn quoting_round_trip() {
        let quoted = imap_quote("pa\"ss\\wd");
        assert_eq!(quoted, "\"pa\\\"ss\\\\wd\"");
        let args = split_args(&format!("t LOGIN user {quoted}"));
        assert_eq!(args[3], "pa\"ss\\wd");
    }
}

/// Shared state of all four protocol proxies.
pub struct ProxyCore {
    pub core: SharedCore,
    pub prelookup: Option<prelookup::PrelookupClient>,
}

pub type SharedProxy = Arc<ProxyCore>;

impl ProxyCore {
    pub fn new(core: SharedCore) -> SharedProxy {
        let prelookup = core
            .config
            .proxy
            .prelookup
            .clone()
            .map(prelookup::PrelookupClient::new);
        Arc::new(ProxyCore { core, prelookup })
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub backend: SocketAddr,
    pub address: String,
}

#[derive(Debug)]
pub enum ProxyAuthError {
    /// Wrong credentials or unknown user.
    Denied,
    /// Infrastructure failure; the client should retry later.
    Transient,
}

impl ProxyCore {
    /// Authentication pre-lookup plus backend selection. The affinity cache
    /// is consulted first and refreshed on success; pre-lookup backends are
    /// validated against the configured allowlist.
    pub async fn authenticate_route(
        &self,
        protocol: ServerProtocol,
        remote_ip: IpAddr,
        username: &str,
        secret: &str,
    ) -> Result<Route, ProxyAuthError> {
        if !self.core.auth.is_allowed(remote_ip) {
            return Err(ProxyAuthError::Transient);
        }
        if let Some(delay) = self.core.auth.delay(remote_ip, username) {
            tokio::time::sleep(delay).await;
        }

        let result = self
            .authenticate_route_inner(protocol, remote_ip, username, secret)
            .await;
        match &result {
            Ok(route) => {
                self.core.auth.record_success(remote_ip, username);
                self.core.metrics.auth_success(protocol);
                self.core
                    .affinity
                    .set(&route.address, protocol, route.backend);
                let _ = self
                    .core
                    .store
                    .affinity_set(
                        &route.address,
                        protocol.as_str(),
                        &route.backend.to_string(),
                    )
                    .await;
            }
            Err(ProxyAuthError::Denied) => {
                self.core.auth.record_failure(remote_ip, username);
                self.core.metrics.auth_failure(protocol);
            }
            Err(ProxyAuthError::Transient) => (),
        }
        let _ = self
            .core
            .store
            .record_auth_attempt(remote_ip, username, result.is_ok())
            .await;
        result
    }

    async fn authenticate_route_inner(
        &self,
        protocol: ServerProtocol,
        remote_ip: IpAddr,
        username: &str,
        secret: &str,
    ) -> Result<Route, ProxyAuthError> {
        let mut backend_hint: Option<SocketAddr> = None;

        // Pre-lookup first; UserNotFound falls back to the database while
        // Transient (including an open circuit) does not.
        if let Some(prelookup) = &self.prelookup {
            match prelookup.lookup(username).await {
                prelookup::AuthResult::Authenticated(entry) => {
                    if !verify_password(&entry.password_hash, secret) {
                        return Err(ProxyAuthError::Denied);
                    }
                    let route = Route {
                        backend: self
                            .pick_backend(&entry.address, protocol, entry.backend)
                            .ok_or(ProxyAuthError::Transient)?,
                        address: entry.address,
                    };
                    tracing::debug!(context = "proxy", event = "route",
                        protocol = ?protocol,
                        remote.ip = remote_ip.to_string(),
                        account = route.address,
                        backend = route.backend.to_string(),
                        "Routing via pre-lookup.");
                    return Ok(route);
                }
                prelookup::AuthResult::Failed => return Err(ProxyAuthError::Denied),
                // Transient (including an open circuit) never falls back to
                // the database; the client is asked to retry.
                prelookup::AuthResult::Transient => return Err(ProxyAuthError::Transient),
                prelookup::AuthResult::UserNotFound => (),
            }
        }

        // Direct database authentication.
        let credential = match self.core.store.credential_by_address(username).await {
            Ok(Some(credential)) => credential,
            Ok(None) => return Err(ProxyAuthError::Denied),
            Err(_) => return Err(ProxyAuthError::Transient),
        };
        if !verify_password(&credential.password_hash, secret) {
            return Err(ProxyAuthError::Denied);
        }

        Ok(Route {
            backend: self
                .pick_backend(&credential.address, protocol, None)
                .ok_or(ProxyAuthError::Transient)?,
            address: credential.address,
        })
    }

    /// Backend order: affinity hint, pre-lookup answer, then round-robin
    /// over the allowlist. Never blocks a login on an affinity failure.
    fn pick_backend(
        &self,
        address: &str,
        protocol: ServerProtocol,
        prelookup_backend: Option<SocketAddr>,
    ) -> Option<SocketAddr> {
        let valid = &self.core.config.proxy.valid_backends;
        if let Some(backend) = self.core.affinity.get(address, protocol) {
            if valid.is_empty() || valid.contains(&backend) {
                return Some(backend);
            }
        }
        if let Some(backend) = prelookup_backend {
            if valid.is_empty() || valid.contains(&backend) {
                return Some(backend);
            }
            tracing::warn!(context = "proxy", event = "invalid-backend",
                backend = backend.to_string(),
                "Pre-lookup returned a backend outside the allowlist.");
        }
        if valid.is_empty() {
            None
        } else {
            Some(valid[rand::thread_rng().gen_range(0..valid.len())])
        }
    }

    /// Sends the optional PROXY v2 preamble after dialing.
    pub async fn connect_backend(
        &self,
        backend: SocketAddr,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<tokio::net::TcpStream, ProxyAuthError> {
        let mut stream = self.dial(backend).await?;
        if self.core.config.proxy.remote_use_proxy_protocol {
            use tokio::io::AsyncWriteExt;
            let header = splice::proxy_v2_header(client_addr, server_addr);
            if stream.write_all(&header).await.is_err() {
                return Err(ProxyAuthError::Transient);
            }
        }
        Ok(stream)
    }

    pub async fn dial(&self, backend: SocketAddr) -> Result<tokio::net::TcpStream, ProxyAuthError> {
        match tokio::time::timeout(
            self.core.config.proxy.connect_timeout,
            tokio::net::TcpStream::connect(backend),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => {
                tracing::warn!(context = "proxy", event = "error",
                    backend = backend.to_string(), reason = %err,
                    "Failed to connect to backend.");
                Err(ProxyAuthError::Transient)
            }
            Err(_) => Err(ProxyAuthError::Transient),
        }
    }
}
