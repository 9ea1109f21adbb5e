/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    listener::{SessionData as TcpSessionData, SessionManager, SessionResult, SessionStream},
    ServerProtocol, SERVER_NAME,
};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::server::TlsStream;

use crate::{
    protocol::{self, Command, ParseError},
    Pop3SessionManager, Session, State,
};

impl SessionManager for Pop3SessionManager {
    #[allow(clippy::manual_async_fn)]
    fn handle<T: SessionStream>(
        self,
        session: TcpSessionData<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let is_tls = session.stream.is_tls();
            let apop_banner = format!(
                "<{}.{}@{}>",
                std::process::id(),
                rand::thread_rng().gen::<u32>(),
                self.core
                    .config
                    .hostname
                    .as_deref()
                    .unwrap_or("localhost")
            );
            let mut session = Session {
                core: self.core,
                instance: session.instance,
                stream: session.stream,
                state: State::NotAuthenticated {
                    auth_failures: 0,
                    username: None,
                },
                is_tls,
                apop_banner,
                remote_ip: session.remote_ip,
                remote_port: session.remote_port,
                local_ip: session.local_ip,
                local_port: session.local_port,
                in_flight: session.in_flight,
                span: session.span,
            };

            let greeting = format!("{SERVER_NAME} POP3 ready {}", session.apop_banner);
            if session.write_bytes(&protocol::ok(&greeting)).await.is_err() {
                session.deregister().await;
                return;
            }

            if session.handle_conn().await && session.instance.acceptor.is_tls() {
                if let Ok(mut session) = session.into_tls().await {
                    session.handle_conn().await;
                    session.deregister().await;
                }
            } else {
                session.deregister().await;
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
        let mut line = Vec::with_capacity(128);
        let mut shutdown_rx = self.instance.shutdown_rx.clone();

        'conn: loop {
            tokio::select! {
                result = tokio::time::timeout(
                    self.core.config.pop3.timeout,
                    self.stream.read(&mut buf)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(bytes_read)) => {
                            self.core.metrics.add_bytes_in(bytes_read as u64);
                            line.extend_from_slice(&buf[..bytes_read]);
                            if line.len() > self.core.config.pop3.max_request_size {
                                self.write_bytes(&protocol::err("Line too long.")).await.ok();
                                break;
                            }
                            while let Some(position) = line.iter().position(|&b| b == b'\n') {
                                let raw: Vec<u8> = line.drain(..=position).collect();
                                let text = String::from_utf8_lossy(&raw);
                                match self.ingest(text.trim()).await {
                                    SessionResult::Continue => (),
                                    SessionResult::UpgradeTls => return true,
                                    SessionResult::Close => break 'conn,
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                                "POP3 connection error.");
                            break;
                        }
                        Err(_) => {
                            self.write_bytes(&protocol::err("Connection timed out.")).await.ok();
                            break;
                        }
                    }
                },
                _ = shutdown_rx.changed() => {
                    self.write_bytes(&protocol::err("Server shutting down.")).await.ok();
                    break;
                }
            }
        }

        false
    }

    async fn ingest(&mut self, line: &str) -> SessionResult {
        if line.is_empty() {
            return SessionResult::Continue;
        }
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(ParseError::UnknownCommand(verb)) => {
                tracing::debug!(parent: &self.span, event = "error",
                    verb = verb, "Unknown POP3 command.");
                self.write_bytes(&protocol::err("Unknown command.")).await.ok();
                return SessionResult::Continue;
            }
            Err(_) => {
                self.write_bytes(&protocol::err("Invalid arguments.")).await.ok();
                return SessionResult::Continue;
            }
        };

        match command {
            Command::Capa => self.handle_capa().await,
            Command::Noop => {
                self.write_bytes(&protocol::ok("Nothing happened.")).await.ok();
                SessionResult::Continue
            }
            Command::Quit => self.handle_quit().await,
            Command::Stls => {
                if self.is_tls {
                    self.write_bytes(&protocol::err("Already in TLS mode.")).await.ok();
                    SessionResult::Continue
                } else if !self.instance.acceptor.is_tls() {
                    self.write_bytes(&protocol::err("TLS is not available.")).await.ok();
                    SessionResult::Continue
                } else {
                    self.write_bytes(&protocol::ok("Begin TLS negotiation.")).await.ok();
                    SessionResult::UpgradeTls
                }
            }
            Command::Xclient { params } => self.handle_xclient(&params).await,
            Command::User { name } => self.handle_user(name).await,
            Command::Pass { secret } => self.handle_pass(&secret).await,
            Command::Apop { name, digest } => self.handle_apop(&name, &digest).await,
            Command::Auth { mechanism, initial } => {
                self.handle_auth(&mechanism, initial).await
            }
            Command::Stat => self.handle_stat().await,
            Command::List { number } => self.handle_list(number).await,
            Command::Uidl { number } => self.handle_uidl(number).await,
            Command::Retr { number } => self.handle_retr(number).await,
            Command::Top { number, lines } => self.handle_top(number, lines).await,
            Command::Dele { number } => self.handle_dele(number).await,
            Command::Rset => self.handle_rset().await,
        }
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ()> {
        self.core.metrics.add_bytes_out(bytes.len() as u64);
        if let Err(err) = self.stream.write_all(bytes).await {
            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                "Failed to write to stream.");
            return Err(());
        }
        self.stream.flush().await.map_err(|_| ())
    }

    pub async fn deregister(&mut self) {
        let address = match &self.state {
            State::Authenticated { mailbox } => {
                let _ = self
                    .core
                    .store
                    .unregister_connection(mailbox.connection_id)
                    .await;
                Some(mailbox.address.clone())
            }
            State::NotAuthenticated { .. } => None,
        };
        self.core
            .tracker
            .disconnected(ServerProtocol::Pop3, address.as_deref());
    }

    pub async fn into_tls(self) -> Result<Session<TlsStream<T>>, ()> {
        let stream = match self.instance.tls_upgrade(self.stream, &self.span).await {
            Ok(stream) => stream,
            Err(()) => {
                self.core
                    .tracker
                    .disconnected(ServerProtocol::Pop3, None);
                return Err(());
            }
        };
        Ok(Session {
            core: self.core,
            instance: self.instance,
            state: self.state,
            is_tls: true,
            apop_banner: self.apop_banner,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
            local_ip: self.local_ip,
            local_port: self.local_port,
            in_flight: self.in_flight,
            span: self.span,
            stream,
        })
    }

    pub async fn handle_capa(&mut self) -> SessionResult {
        let mut response = b"+OK Capability list follows\r\n".to_vec();
        response.extend_from_slice(b"TOP\r\nUIDL\r\nRESP-CODES\r\nPIPELINING\r\n");
        response.extend_from_slice(b"SASL PLAIN LOGIN\r\nUSER\r\n");
        if !self.is_tls && self.instance.acceptor.is_tls() {
            response.extend_from_slice(b"STLS\r\n");
        }
        response.extend_from_slice(b"IMPLEMENTATION Sora\r\n.\r\n");
        self.write_bytes(&response).await.ok();
        SessionResult::Continue
    }
}
