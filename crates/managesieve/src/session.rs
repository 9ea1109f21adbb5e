/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    listener::{SessionData as TcpSessionData, SessionManager, SessionResult, SessionStream},
    ServerProtocol,
};
use imap_proto::receiver::{self, Receiver, State as ReceiverState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::server::TlsStream;

use crate::{bye, Command, ManageSieveSessionManager, Session, State};

impl SessionManager for ManageSieveSessionManager {
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
                // ManageSieve requests have no tag.
                receiver: Receiver::with_max_request_size(
                    1024 * 1024,
                )
                .with_start_state(ReceiverState::Command { is_uid: false }),
                stream: session.stream,
                state: State::NotAuthenticated { auth_failures: 0 },
                is_tls,
                remote_ip: session.remote_ip,
                remote_port: session.remote_port,
                local_ip: session.local_ip,
                local_port: session.local_port,
                in_flight: session.in_flight,
                span: session.span,
            };

            let greeting = session.capability_text("Sora ManageSieve ready.");
            if session.write_bytes(&greeting).await.is_err() {
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
        let mut shutdown_rx = self.instance.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = tokio::time::timeout(
                    self.core.config.managesieve.timeout,
                    self.stream.read(&mut buf)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(bytes_read)) => {
                            self.core.metrics.add_bytes_in(bytes_read as u64);
                            match self.ingest(&buf[..bytes_read]).await {
                                SessionResult::Continue => (),
                                SessionResult::UpgradeTls => return true,
                                SessionResult::Close => break,
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                                "ManageSieve connection error.");
                            break;
                        }
                        Err(_) => {
                            self.write_bytes(&bye("Connection timed out.")).await.ok();
                            break;
                        }
                    }
                },
                _ = shutdown_rx.changed() => {
                    self.write_bytes(&bye("Server shutting down.")).await.ok();
                    break;
                }
            }
        }

        false
    }

    async fn ingest(&mut self, bytes: &[u8]) -> SessionResult {
        let mut bytes = bytes.iter();
        let mut requests = Vec::with_capacity(2);

        loop {
            match self.receiver.parse(&mut bytes) {
                Ok(request) => requests.push(request),
                Err(receiver::Error::NeedsMoreData) => break,
                Err(receiver::Error::NeedsLiteral { .. }) => {
                    // RFC 5804 literals are always non-synchronizing from
                    // the client; no continuation is sent.
                    break;
                }
                Err(receiver::Error::Error { response }) => {
                    let message = response.message.clone();
                    if self.write_bytes(&crate::no(&message)).await.is_err() {
                        return SessionResult::Close;
                    }
                    break;
                }
            }
        }

        for request in requests {
            let result = match request.command {
                Command::Capability => self.handle_capability().await,
                Command::Noop => self.handle_noop().await,
                Command::Logout => {
                    self.write_bytes(&crate::ok("Logout completed.")).await.ok();
                    return SessionResult::Close;
                }
                Command::StartTls => {
                    if self.is_tls {
                        self.write_bytes(&crate::no("Already in TLS mode.")).await.ok();
                        SessionResult::Continue
                    } else if !self.instance.acceptor.is_tls() {
                        self.write_bytes(&crate::no("TLS is not available.")).await.ok();
                        SessionResult::Continue
                    } else {
                        self.write_bytes(&crate::ok("Begin TLS negotiation now."))
                            .await
                            .ok();
                        SessionResult::UpgradeTls
                    }
                }
                Command::Authenticate => self.handle_authenticate(request).await,
                Command::Unauthenticate => self.handle_unauthenticate().await,
                Command::ListScripts => self.handle_listscripts().await,
                Command::GetScript => self.handle_getscript(request).await,
                Command::PutScript => self.handle_putscript(request).await,
                Command::SetActive => self.handle_setactive(request).await,
                Command::DeleteScript => self.handle_deletescript(request).await,
                Command::RenameScript => self.handle_renamescript(request).await,
                Command::CheckScript => self.handle_checkscript(request).await,
                Command::HaveSpace => self.handle_havespace(request).await,
            };
            if result != SessionResult::Continue {
                return result;
            }
        }

        SessionResult::Continue
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
            State::Authenticated { account } => {
                let _ = self
                    .core
                    .store
                    .unregister_connection(account.connection_id)
                    .await;
                Some(account.address.clone())
            }
            State::NotAuthenticated { .. } => None,
        };
        self.core
            .tracker
            .disconnected(ServerProtocol::ManageSieve, address.as_deref());
    }

    pub async fn into_tls(self) -> Result<Session<TlsStream<T>>, ()> {
        let stream = match self.instance.tls_upgrade(self.stream, &self.span).await {
            Ok(stream) => stream,
            Err(()) => {
                self.core
                    .tracker
                    .disconnected(ServerProtocol::ManageSieve, None);
                return Err(());
            }
        };
        Ok(Session {
            core: self.core,
            instance: self.instance,
            receiver: self.receiver,
            state: self.state,
            is_tls: true,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
            local_ip: self.local_ip,
            local_port: self.local_port,
            in_flight: self.in_flight,
            span: self.span,
            stream,
        })
    }

    /// The capability listing, used in the greeting and for CAPABILITY.
    pub fn capability_text(&self, message: &str) -> Vec<u8> {
        let mut response = Vec::with_capacity(256);
        response.extend_from_slice(b"\"IMPLEMENTATION\" \"Sora ManageSieve v");
        response.extend_from_slice(env!("CARGO_PKG_VERSION").as_bytes());
        response.extend_from_slice(b"\"\r\n\"VERSION\" \"1.0\"\r\n");
        if self.is_tls {
            response.extend_from_slice(b"\"SASL\" \"PLAIN\"\r\n");
        } else {
            response.extend_from_slice(b"\"SASL\" \"\"\r\n");
            if self.instance.acceptor.is_tls() {
                response.extend_from_slice(b"\"STARTTLS\"\r\n");
            }
        }
        response.extend_from_slice(b"\"SIEVE\" \"");
        response.extend_from_slice(
            self.core
                .config
                .managesieve
                .extensions
                .join(" ")
                .as_bytes(),
        );
        response.extend_from_slice(b"\"\r\n");
        response.extend_from_slice(b"\"MAXSCRIPTSIZE\" \"");
        response.extend_from_slice(
            self.core
                .config
                .managesieve
                .max_script_size
                .to_string()
                .as_bytes(),
        );
        response.extend_from_slice(b"\"\r\n");
        response.extend(crate::ok(message));
        response
    }

    pub async fn handle_capability(&mut self) -> SessionResult {
        let response = self.capability_text("Capability completed.");
        self.write_bytes(&response).await.ok();
        SessionResult::Continue
    }

    pub async fn handle_noop(&mut self) -> SessionResult {
        self.write_bytes(&crate::ok("Done.")).await.ok();
        SessionResult::Continue
    }
}
