/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::IpAddr, sync::Arc};

use rustls::ServerConfig;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tokio_rustls::TlsAcceptor;

use crate::{config::IpNet, ServerProtocol, SharedCore};

use self::limiter::{ConcurrencyLimiter, InFlight};

pub mod limiter;
pub mod listen;
pub mod stream;
pub mod tls;

pub struct ServerInstance {
    pub id: String,
    pub protocol: ServerProtocol,
    pub acceptor: TcpAcceptor,
    pub limiter: ConcurrencyLimiter,
    pub proxy_networks: Vec<IpNet>,
    /// Networks exempt from the per-IP connection cap.
    pub trusted_networks: Vec<IpNet>,
    pub shutdown_rx: watch::Receiver<bool>,
}

#[derive(Default)]
pub enum TcpAcceptor {
    Tls {
        config: Arc<ServerConfig>,
        acceptor: TlsAcceptor,
        implicit: bool,
    },
    #[default]
    Plain,
}

impl TcpAcceptor {
    pub fn is_tls(&self) -> bool {
        matches!(self, TcpAcceptor::Tls { .. })
    }

    pub fn is_tls_implicit(&self) -> bool {
        matches!(self, TcpAcceptor::Tls { implicit: true, .. })
    }
}

pub struct SessionData<T: SessionStream> {
    pub stream: T,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub in_flight: InFlight,
    pub instance: Arc<ServerInstance>,
    pub span: tracing::Span,
}

pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Sync + Send + 'static {
    fn is_tls(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    Continue,
    UpgradeTls,
    Close,
}

pub trait SessionManager: Sync + Send + Clone + 'static {
    fn spawn<T: SessionStream>(&self, session: SessionData<T>, is_tls_implicit: bool) {
        let manager = self.clone();

        tokio::spawn(async move {
            if is_tls_implicit {
                match session.instance.clone().accept_tls(session).await {
                    Ok(session) => manager.handle(session).await,
                    Err(()) => (),
                }
            } else {
                manager.handle(session).await;
            }
        });
    }

    fn handle<T: SessionStream>(
        self,
        session: SessionData<T>,
    ) -> impl std::future::Future<Output = ()> + Send;

    fn core(&self) -> &SharedCore;
}

impl ServerInstance {
    pub async fn accept_tls<T: SessionStream>(
        self: Arc<Self>,
        session: SessionData<T>,
    ) -> Result<SessionData<tokio_rustls::server::TlsStream<T>>, ()> {
        match &self.acceptor {
            TcpAcceptor::Tls { acceptor, .. } => {
                let span = session.span.clone();
                match acceptor.accept(session.stream).await {
                    Ok(stream) => Ok(SessionData {
                        stream,
                        local_ip: session.local_ip,
                        local_port: session.local_port,
                        remote_ip: session.remote_ip,
                        remote_port: session.remote_port,
                        in_flight: session.in_flight,
                        instance: session.instance,
                        span: session.span,
                    }),
                    Err(err) => {
                        tracing::debug!(
                            parent: &span,
                            context = "tls",
                            event = "error",
                            reason = %err,
                            "TLS handshake failed."
                        );
                        Err(())
                    }
                }
            }
            TcpAcceptor::Plain => Err(()),
        }
    }

    /// Upgrades an established plain-text stream in place (STARTTLS / STLS).
    pub async fn tls_upgrade<T: SessionStream>(
        &self,
        stream: T,
        span: &tracing::Span,
    ) -> Result<tokio_rustls::server::TlsStream<T>, ()> {
        match &self.acceptor {
            TcpAcceptor::Tls { acceptor, .. } => acceptor.accept(stream).await.map_err(|err| {
                tracing::debug!(
                    parent: span,
                    context = "tls",
                    event = "error",
                    reason = %err,
                    "STARTTLS handshake failed."
                );
            }),
            TcpAcceptor::Plain => Err(()),
        }
    }
}
