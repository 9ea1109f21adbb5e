/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use common::{
    listener::{SessionData as TcpSessionData, SessionManager, SessionResult, SessionStream},
    ServerProtocol,
};
use imap_proto::{protocol::ProtocolVersion, receiver::Receiver, StatusResponse};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::server::TlsStream;

use crate::ImapSessionManager;

use super::{Session, State};

/// How often an idle-ish session polls its `active_connections` row for an
/// admin termination request.
const KICK_POLL: Duration = Duration::from_secs(30);

impl SessionManager for ImapSessionManager {
    #[allow(clippy::manual_async_fn)]
    fn handle<T: SessionStream>(
        self,
        session: TcpSessionData<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let is_tls = session.stream.is_tls();
            let mut session = Session {
                core: self.core.clone(),
                receiver: Receiver::with_max_request_size(
                    self.core.config.imap.max_request_size,
                ),
                version: ProtocolVersion::Rev1,
                state: State::NotAuthenticated { auth_failures: 0 },
                is_tls,
                is_condstore: false,
                is_qresync: false,
                remote_ip: session.remote_ip,
                remote_port: session.remote_port,
                local_ip: session.local_ip,
                local_port: session.local_port,
                in_flight: session.in_flight,
                span: session.span,
                instance: session.instance,
                stream: session.stream,
            };

            if session
                .write_bytes(&ImapSessionManager::greeting(is_tls))
                .await
                .is_err()
            {
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
    /// Runs the connection until EOF, timeout, LOGOUT or STARTTLS. Returns
    /// true when the caller should upgrade the stream to TLS.
    pub async fn handle_conn(&mut self) -> bool {
        let mut buf = vec![0; 8192];
        let mut shutdown_rx = self.instance.shutdown_rx.clone();
        let mut kick_timer = tokio::time::interval(KICK_POLL);
        kick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = tokio::time::timeout(
                    if self.state.is_authenticated() {
                        self.core.config.imap.timeout_auth
                    } else {
                        self.core.config.imap.timeout_unauth
                    },
                    self.stream.read(&mut buf)) => {
                    match result {
                        Ok(Ok(0)) => {
                            tracing::debug!(parent: &self.span, event = "close",
                                "IMAP connection closed by client.");
                            break;
                        }
                        Ok(Ok(bytes_read)) => {
                            match self.ingest(&buf[..bytes_read]).await {
                                SessionResult::Continue => (),
                                SessionResult::UpgradeTls => return true,
                                SessionResult::Close => break,
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                                "IMAP connection error.");
                            break;
                        }
                        Err(_) => {
                            self.write_bytes(b"* BYE Connection timed out.\r\n").await.ok();
                            tracing::debug!(parent: &self.span, event = "timeout",
                                "IMAP connection timed out.");
                            break;
                        }
                    }
                },
                _ = kick_timer.tick() => {
                    if self.termination_requested().await {
                        self.write_bytes(
                            b"* BYE Session terminated by administrator.\r\n",
                        ).await.ok();
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    self.write_bytes(b"* BYE Server shutting down.\r\n").await.ok();
                    tracing::debug!(parent: &self.span, event = "shutdown",
                        "IMAP server shutting down.");
                    break;
                }
            }
        }

        false
    }

    async fn termination_requested(&self) -> bool {
        match &self.state {
            State::Authenticated { data } | State::Selected { data, .. } => self
                .core
                .store
                .termination_requested(data.connection_id)
                .await
                .unwrap_or(false),
            State::NotAuthenticated { .. } => false,
        }
    }

    /// Removes the session's accounting on close.
    pub async fn deregister(&mut self) {
        let address = match &self.state {
            State::Authenticated { data } | State::Selected { data, .. } => {
                let _ = self
                    .core
                    .store
                    .unregister_connection(data.connection_id)
                    .await;
                Some(data.address.clone())
            }
            State::NotAuthenticated { .. } => None,
        };
        self.core
            .tracker
            .disconnected(ServerProtocol::Imap, address.as_deref());
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ()> {
        self.core.metrics.add_bytes_out(bytes.len() as u64);
        if let Err(err) = self.stream.write_all(bytes).await {
            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                "Failed to write to stream.");
            return Err(());
        }
        if let Err(err) = self.stream.flush().await {
            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                "Failed to flush stream.");
            return Err(());
        }
        Ok(())
    }

    pub async fn write_response(&mut self, response: StatusResponse) -> Result<(), ()> {
        self.write_bytes(&response.into_bytes()).await
    }
}

impl<T: SessionStream> Session<T> {
    pub async fn into_tls(self) -> Result<Session<TlsStream<T>>, ()> {
        let stream = match self.instance.tls_upgrade(self.stream, &self.span).await {
            Ok(stream) => stream,
            Err(()) => {
                self.core
                    .tracker
                    .disconnected(ServerProtocol::Imap, None);
                return Err(());
            }
        };
        Ok(Session {
            core: self.core,
            instance: self.instance,
            receiver: self.receiver,
            version: self.version,
            state: self.state,
            is_tls: true,
            is_condstore: self.is_condstore,
            is_qresync: self.is_qresync,
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
