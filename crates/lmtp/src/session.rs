/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    listener::{SessionData as TcpSessionData, SessionManager, SessionResult, SessionStream},
    ServerProtocol, SERVER_NAME,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::server::TlsStream;

use crate::{forward::ForwardParams, LmtpSessionManager, Recipient, Session, Transaction};

impl SessionManager for LmtpSessionManager {
    #[allow(clippy::manual_async_fn)]
    fn handle<T: SessionStream>(
        self,
        session: TcpSessionData<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let is_tls = session.stream.is_tls();
            let mut session = Session {
                core: self.core,
                instance: session.instance,
                stream: session.stream,
                is_tls,
                helo_domain: None,
                transaction: Transaction::default(),
                remote_ip: session.remote_ip,
                remote_port: session.remote_port,
                local_ip: session.local_ip,
                local_port: session.local_port,
                in_flight: session.in_flight,
                span: session.span,
            };

            let greeting = format!("220 {SERVER_NAME} LMTP ready\r\n");
            if session.write_line(&greeting).await.is_err() {
                session.deregister();
                return;
            }

            if session.handle_conn().await && session.instance.acceptor.is_tls() {
                if let Ok(mut session) = session.into_tls().await {
                    session.handle_conn().await;
                    session.deregister();
                }
            } else {
                session.deregister();
            }
        }
    }

    fn core(&self) -> &common::SharedCore {
        &self.core
    }
}

impl<T: SessionStream> Session<T> {
    pub async fn handle_conn(&mut self) -> bool {
        let mut buf = vec![0u8; 8192];
        let mut pending = Vec::with_capacity(256);
        let mut shutdown_rx = self.instance.shutdown_rx.clone();

        'conn: loop {
            tokio::select! {
                result = tokio::time::timeout(
                    self.core.config.lmtp.timeout,
                    self.stream.read(&mut buf)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(bytes_read)) => {
                            self.core.metrics.add_bytes_in(bytes_read as u64);
                            pending.extend_from_slice(&buf[..bytes_read]);
                            while let Some(position) = pending.iter().position(|&b| b == b'\n') {
                                let raw: Vec<u8> = pending.drain(..=position).collect();
                                let line = String::from_utf8_lossy(&raw);
                                match self.ingest(line.trim()).await {
                                    SessionResult::Continue => (),
                                    SessionResult::UpgradeTls => return true,
                                    SessionResult::Close => break 'conn,
                                }
                            }
                            if pending.len() > 4096 {
                                self.write_line("500 5.5.2 Line too long\r\n").await.ok();
                                break;
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                                "LMTP connection error.");
                            break;
                        }
                        Err(_) => {
                            self.write_line("421 4.4.2 Connection timed out\r\n").await.ok();
                            break;
                        }
                    }
                },
                _ = shutdown_rx.changed() => {
                    self.write_line("421 4.3.0 Server shutting down\r\n").await.ok();
                    break;
                }
            }
        }

        false
    }

    async fn ingest(&mut self, line: &str) -> SessionResult {
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "LHLO" => self.handle_lhlo(args).await,
            "MAIL" => self.handle_mail(args).await,
            "RCPT" => self.handle_rcpt(args).await,
            "DATA" => self.handle_data().await,
            "RSET" => {
                self.transaction.reset();
                self.write_line("250 2.0.0 OK\r\n").await.ok();
                SessionResult::Continue
            }
            "NOOP" => {
                self.write_line("250 2.0.0 OK\r\n").await.ok();
                SessionResult::Continue
            }
            "QUIT" => {
                self.write_line("221 2.0.0 Bye\r\n").await.ok();
                SessionResult::Close
            }
            "STARTTLS" => {
                if self.is_tls {
                    self.write_line("503 5.5.1 Already in TLS mode\r\n").await.ok();
                    SessionResult::Continue
                } else if !self.instance.acceptor.is_tls() {
                    self.write_line("502 5.5.1 TLS not available\r\n").await.ok();
                    SessionResult::Continue
                } else {
                    self.write_line("220 2.0.0 Ready to start TLS\r\n").await.ok();
                    SessionResult::UpgradeTls
                }
            }
            "XCLIENT" => self.handle_xclient(args).await,
            "VRFY" | "EXPN" => {
                self.write_line("252 2.5.2 Cannot verify\r\n").await.ok();
                SessionResult::Continue
            }
            "AUTH" => {
                // Delivery trust comes from the network, not SASL.
                self.write_line("503 5.5.1 Authentication not required\r\n")
                    .await
                    .ok();
                SessionResult::Continue
            }
            _ => {
                self.write_line("500 5.5.2 Unknown command\r\n").await.ok();
                SessionResult::Continue
            }
        }
    }

    async fn handle_lhlo(&mut self, domain: &str) -> SessionResult {
        if domain.is_empty() {
            self.write_line("501 5.5.4 LHLO requires a domain\r\n").await.ok();
            return SessionResult::Continue;
        }
        self.helo_domain = Some(domain.to_string());
        self.transaction.reset();

        let hostname = self
            .core
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let mut response = format!("250-{hostname}\r\n");
        response.push_str("250-PIPELINING\r\n");
        response.push_str(&format!(
            "250-SIZE {}\r\n",
            self.core.config.lmtp.max_message_size
        ));
        response.push_str("250-ENHANCEDSTATUSCODES\r\n");
        response.push_str("250-8BITMIME\r\n");
        if !self.is_tls && self.instance.acceptor.is_tls() {
            response.push_str("250-STARTTLS\r\n");
        }
        if self.is_trusted_proxy() {
            response.push_str("250-XCLIENT NAME ADDR PORT PROTO LOGIN\r\n");
        }
        response.push_str("250 XRCPTFORWARD\r\n");
        self.write_line(&response).await.ok();
        SessionResult::Continue
    }

    async fn handle_mail(&mut self, args: &str) -> SessionResult {
        if self.helo_domain.is_none() {
            self.write_line("503 5.5.1 Send LHLO first\r\n").await.ok();
            return SessionResult::Continue;
        }
        if self.transaction.mail_from.is_some() {
            self.write_line("503 5.5.1 Nested MAIL command\r\n").await.ok();
            return SessionResult::Continue;
        }
        let Some(address) = parse_path(args, "FROM:") else {
            self.write_line("501 5.5.4 Syntax: MAIL FROM:<address>\r\n")
                .await
                .ok();
            return SessionResult::Continue;
        };

        // SIZE declaration (RFC 1870).
        for param in args.split_whitespace().skip(1) {
            if let Some(size) = param
                .strip_prefix("SIZE=")
                .and_then(|size| size.parse::<usize>().ok())
            {
                if size > self.core.config.lmtp.max_message_size {
                    self.write_line("552 5.3.4 Message exceeds maximum size\r\n")
                        .await
                        .ok();
                    return SessionResult::Continue;
                }
                self.transaction.declared_size = Some(size);
            }
        }

        self.transaction.mail_from = Some(address);
        self.write_line("250 2.1.0 OK\r\n").await.ok();
        SessionResult::Continue
    }

    async fn handle_rcpt(&mut self, args: &str) -> SessionResult {
        if self.transaction.mail_from.is_none() {
            self.write_line("503 5.5.1 Send MAIL first\r\n").await.ok();
            return SessionResult::Continue;
        }
        if self.transaction.recipients.len() >= self.core.config.lmtp.max_recipients {
            self.write_line("452 4.5.3 Too many recipients\r\n").await.ok();
            return SessionResult::Continue;
        }
        let Some(address) = parse_path(args, "TO:") else {
            self.write_line("501 5.5.4 Syntax: RCPT TO:<address>\r\n")
                .await
                .ok();
            return SessionResult::Continue;
        };

        // XRCPTFORWARD is only honored from trusted proxies.
        let mut forward = None;
        for param in args.split_whitespace().skip(1) {
            if let Some(encoded) = param.strip_prefix("XRCPTFORWARD=") {
                if !self.is_trusted_proxy() {
                    self.write_line("550 5.7.1 XRCPTFORWARD not allowed\r\n")
                        .await
                        .ok();
                    return SessionResult::Continue;
                }
                match ForwardParams::decode(encoded) {
                    Some(params) => {
                        if !params.variables.is_empty() {
                            tracing::debug!(parent: &self.span, event = "forward",
                                variables = ?params.variables,
                                "Forwarding metadata received.");
                        }
                        forward = Some(params);
                    }
                    None => {
                        self.write_line("501 5.5.4 Invalid XRCPTFORWARD\r\n")
                            .await
                            .ok();
                        return SessionResult::Continue;
                    }
                }
            }
        }

        match self.core.store.credential_by_address(&address).await {
            Ok(Some(credential)) => {
                self.transaction.recipients.push(Recipient {
                    address: credential.address,
                    account_id: credential.account_id,
                    forward,
                });
                self.write_line("250 2.1.5 OK\r\n").await.ok();
            }
            Ok(None) => {
                self.write_line("550 5.1.1 No such user\r\n").await.ok();
            }
            Err(_) => {
                self.write_line("451 4.3.0 Temporary lookup failure\r\n")
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    async fn handle_data(&mut self) -> SessionResult {
        if self.transaction.recipients.is_empty() {
            self.write_line("503 5.5.1 No valid recipients\r\n").await.ok();
            return SessionResult::Continue;
        }
        if self
            .write_line("354 End data with <CR><LF>.<CR><LF>\r\n")
            .await
            .is_err()
        {
            return SessionResult::Close;
        }

        let raw = match self.read_data().await {
            Some(raw) => raw,
            None => return SessionResult::Close,
        };
        if raw.len() > self.core.config.lmtp.max_message_size {
            self.write_line("552 5.3.4 Message exceeds maximum size\r\n")
                .await
                .ok();
            self.transaction.reset();
            return SessionResult::Continue;
        }

        // LMTP: one status line per accepted RCPT, in RCPT order.
        let responses = self.deliver(raw).await;
        for response in responses {
            if self.write_line(&response).await.is_err() {
                return SessionResult::Close;
            }
        }
        self.transaction.reset();
        SessionResult::Continue
    }

    /// Reads the DATA payload up to the lone-dot terminator, reversing
    /// dot-stuffing.
    async fn read_data(&mut self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 8192];
        let mut data = Vec::with_capacity(8192);
        let max = self.core.config.lmtp.max_message_size.saturating_mul(2);

        loop {
            if let Some(end) = find_data_end(&data) {
                let body = unstuff(&data[..end]);
                return Some(body);
            }
            if data.len() > max {
                return None;
            }
            let read = tokio::time::timeout(
                self.core.config.lmtp.timeout,
                self.stream.read(&mut buf),
            )
            .await
            .ok()?
            .ok()?;
            if read == 0 {
                return None;
            }
            self.core.metrics.add_bytes_in(read as u64);
            data.extend_from_slice(&buf[..read]);
        }
    }

    async fn handle_xclient(&mut self, args: &str) -> SessionResult {
        if !self.is_trusted_proxy() {
            self.write_line("550 5.7.1 Connection not from trusted proxy\r\n")
                .await
                .ok();
            return SessionResult::Continue;
        }
        for pair in args.split_whitespace() {
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
        // Re-greet with the new identity, as XCLIENT restarts the session.
        let hostname = self
            .core
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        self.helo_domain = None;
        self.transaction.reset();
        self.write_line(&format!("220 {hostname} LMTP ready\r\n"))
            .await
            .ok();
        SessionResult::Continue
    }

    pub(crate) fn is_trusted_proxy(&self) -> bool {
        self.core
            .config
            .lmtp
            .trusted_networks
            .iter()
            .any(|network| network.matches(&self.remote_ip))
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ()> {
        self.core.metrics.add_bytes_out(line.len() as u64);
        if let Err(err) = self.stream.write_all(line.as_bytes()).await {
            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                "Failed to write to stream.");
            return Err(());
        }
        self.stream.flush().await.map_err(|_| ())
    }

    pub fn deregister(&self) {
        self.core.tracker.disconnected(ServerProtocol::Lmtp, None);
    }

    pub async fn into_tls(self) -> Result<Session<TlsStream<T>>, ()> {
        let stream = match self.instance.tls_upgrade(self.stream, &self.span).await {
            Ok(stream) => stream,
            Err(()) => {
                self.core.tracker.disconnected(ServerProtocol::Lmtp, None);
                return Err(());
            }
        };
        Ok(Session {
            core: self.core,
            instance: self.instance,
            is_tls: true,
            helo_domain: None,
            transaction: Transaction::default(),
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
            local_ip: self.local_ip,
            local_port: self.local_port,
            in_flight: self.in_flight,
            span: self.span,
            stream,
        })
    }
}

/// Extracts the address from `FROM:<a@b>` / `TO:<a@b>` with laxity about
/// whitespace and missing brackets.
fn parse_path(args: &str, prefix: &str) -> Option<String> {
    let rest = args
        .split_whitespace()
        .next()?
        .strip_prefix_ignore_case(prefix)?;
    let address = rest.trim().trim_start_matches('<').trim_end_matches('>');
    if address.is_empty() && prefix == "TO:" {
        return None;
    }
    Some(address.to_ascii_lowercase())
}

trait StripPrefixIgnoreCase {
    fn strip_prefix_ignore_case<'x>(&'x self, prefix: &str) -> Option<&'x str>;
}

impl StripPrefixIgnoreCase for str {
    fn strip_prefix_ignore_case<'x>(&'x self, prefix: &str) -> Option<&'x str> {
        if self.len() >= prefix.len() && self[..prefix.len()].eq_ignore_ascii_case(prefix) {
            Some(&self[prefix.len()..])
        } else {
            None
        }
    }
}

/// Position of the `CRLF.CRLF` terminator, if complete.
fn find_data_end(data: &[u8]) -> Option<usize> {
    if data.starts_with(b".\r\n") {
        return Some(0);
    }
    data.windows(5)
        .position(|window| window == b"\r\n.\r\n")
        .map(|position| position + 2)
}

/// Reverses SMTP dot-stuffing.
fn unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut at_line_start = true;
    let mut bytes = data.iter().peekable();
    while let Some(&byte) = bytes.next() {
        if at_line_start && byte == b'.' && bytes.peek().is_some() {
            at_line_start = false;
            continue;
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_path("FROM:<alice@x.test> SIZE=100", "FROM:"),
            Some("alice@x.test".to_string())
        );
        assert_eq!(
            parse_path("to:<Bob@X.Test>", "TO:"),
            Some("bob@x.test".to_string())
        );
        assert_eq!(parse_path("FROM:<>", "FROM:"), Some(String::new()));
        assert_eq!(parse_path("TO:<>", "TO:"), None);
        assert_eq!(parse_path("BODY=8BITMIME", "TO:"), None);
    }

    #[test]
    fn data_terminator() {
        assert_eq!(find_data_end(b"hello\r\n.\r\n"), Some(7));
        assert_eq!(find_data_end(b".\r\n"), Some(0));
        assert_eq!(find_data_end(b"no terminator yet\r\n"), None);
    }

    #[test]
    fn dot_unstuffing() {
        assert_eq!(unstuff(b"..leading\r\nplain\r\n"), b".leading\r\nplain\r\n");
        assert_eq!(unstuff(b"a\r\n..b\r\n"), b"a\r\n.b\r\n");
    }
}
