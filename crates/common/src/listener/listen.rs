/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::IpAddr, net::SocketAddr, sync::Arc};

use proxy_header::io::ProxiedStream;
use tokio::{net::TcpListener, sync::watch};

use crate::{config::ListenerConfig, SharedCore};

use super::{
    limiter::ConcurrencyLimiter, SessionData, SessionManager, SessionStream, ServerInstance,
    TcpAcceptor,
};

impl ListenerConfig {
    /// Binds every address of this listener and accepts sessions until
    /// shutdown is signalled.
    pub fn spawn(
        self,
        manager: impl SessionManager,
        acceptor: TcpAcceptor,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let core = manager.core().clone();
        let is_tls_implicit = acceptor.is_tls_implicit();
        let instance = Arc::new(ServerInstance {
            id: self.id,
            protocol: self.protocol,
            limiter: ConcurrencyLimiter::new(self.max_connections, self.max_per_ip),
            proxy_networks: self.proxy_networks,
            trusted_networks: self.trusted_networks,
            acceptor,
            shutdown_rx: shutdown_rx.clone(),
        });
        let has_proxies = !instance.proxy_networks.is_empty();

        for addr in self.bind {
            tracing::info!(
                id = instance.id,
                protocol = ?instance.protocol,
                bind.ip = addr.ip().to_string(),
                bind.port = addr.port(),
                tls = is_tls_implicit,
                "Starting listener"
            );

            let mut shutdown_rx = shutdown_rx.clone();
            let manager = manager.clone();
            let instance = instance.clone();
            let core = core.clone();
            tokio::spawn(async move {
                let listener = match TcpListener::bind(addr).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        tracing::error!(
                            event = "error",
                            instance = instance.id,
                            reason = %err,
                            "Failed to bind listener"
                        );
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        stream = listener.accept() => {
                            match stream {
                                Ok((stream, remote_addr)) => {
                                    if has_proxies
                                        && instance
                                            .proxy_networks
                                            .iter()
                                            .any(|network| network.matches(&remote_addr.ip()))
                                    {
                                        let instance = instance.clone();
                                        let manager = manager.clone();
                                        let core = core.clone();

                                        tokio::spawn(async move {
                                            match ProxiedStream::create_from_tokio(
                                                stream,
                                                Default::default(),
                                            )
                                            .await
                                            {
                                                Ok(stream) => {
                                                    let remote_addr = stream
                                                        .proxy_header()
                                                        .proxied_address()
                                                        .map(|addr| addr.source)
                                                        .unwrap_or(remote_addr);
                                                    if let Some(session) = instance.build_session(
                                                        stream,
                                                        addr,
                                                        remote_addr,
                                                        &core,
                                                    ) {
                                                        manager.spawn(session, is_tls_implicit);
                                                    }
                                                }
                                                Err(err) => {
                                                    tracing::trace!(
                                                        context = "io",
                                                        event = "error",
                                                        instance = instance.id,
                                                        reason = %err,
                                                        "Failed to read PROXY preamble"
                                                    );
                                                }
                                            }
                                        });
                                    } else if let Some(session) =
                                        instance.build_session(stream, addr, remote_addr, &core)
                                    {
                                        manager.spawn(session, is_tls_implicit);
                                    }
                                }
                                Err(err) => {
                                    tracing::trace!(
                                        context = "io",
                                        event = "error",
                                        instance = instance.id,
                                        "Failed to accept TCP connection: {}",
                                        err
                                    );
                                }
                            }
                        },
                        _ = shutdown_rx.changed() => {
                            tracing::debug!(
                                event = "shutdown",
                                instance = instance.id,
                                "Listener shutting down."
                            );
                            break;
                        }
                    }
                }
            });
        }
    }
}

impl ServerInstance {
    fn build_session<T: SessionStream>(
        self: &Arc<Self>,
        stream: T,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        core: &SharedCore,
    ) -> Option<SessionData<T>> {
        // Convert mapped IPv6 addresses to IPv4
        let remote_ip = match remote_addr.ip() {
            IpAddr::V6(ip) => ip
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(ip)),
            remote_ip => remote_ip,
        };

        // Trusted infrastructure (internal proxies, load balancers) bypasses
        // the per-IP cap; the total cap always applies.
        let trusted = self
            .trusted_networks
            .iter()
            .any(|network| network.matches(&remote_ip));
        let in_flight = match self.limiter.is_allowed(remote_ip, trusted) {
            Some(in_flight) => in_flight,
            None => {
                tracing::info!(
                    context = "throttle",
                    event = "too-many-requests",
                    instance = self.id,
                    protocol = ?self.protocol,
                    remote.ip = remote_ip.to_string(),
                    max_concurrent = self.limiter.max_concurrent,
                    max_per_ip = self.limiter.max_per_ip,
                    per_ip = self.limiter.connections_for(remote_ip),
                    "Too many concurrent connections."
                );
                return None;
            }
        };

        core.metrics.connection_accepted(self.protocol);
        core.tracker.connected(self.protocol);

        let span = tracing::info_span!(
            "session",
            instance = self.id,
            protocol = ?self.protocol,
            remote.ip = remote_ip.to_string(),
            remote.port = remote_addr.port(),
        );

        Some(SessionData {
            stream,
            local_ip: local_addr.ip(),
            local_port: local_addr.port(),
            remote_ip,
            remote_port: remote_addr.port(),
            in_flight,
            instance: self.clone(),
            span,
        })
    }
}
