/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD, Engine};
use common::{
    auth::decode_sasl_plain,
    listener::{SessionData, SessionManager, SessionStream},
    ServerProtocol, SharedCore,
};
use tokio::io::AsyncWriteExt;

use crate::{split_args, LineReader, ProxyAuthError, SharedProxy};

#[derive(Clone)]
pub struct SieveProxyManager {
    pub proxy: SharedProxy,
}

impl SieveProxyManager {
    pub fn new(proxy: SharedProxy) -> Self {
        Self { proxy }
    }
}

impl SessionManager for SieveProxyManager {
    #[allow(clippy::manual_async_fn)]
    fn handle<T: SessionStream>(
        self,
        mut session: SessionData<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let proxy = self.proxy;
            let timeout = proxy.core.config.proxy.session_timeout;
            let mut reader = LineReader::default();
            let mut auth_failures = 0u32;

            let greeting = concat!(
                "\"IMPLEMENTATION\" \"Sora proxy\"\r\n",
                "\"VERSION\" \"1.0\"\r\n",
                "\"SASL\" \"PLAIN\"\r\n",
                "\"SIEVE\" \"fileinto envelope\"\r\n",
                "OK \"Sora ManageSieve proxy ready.\"\r\n"
            );
            if write(&mut session.stream, greeting.as_bytes()).await.is_err() {
                proxy
                    .core
                    .tracker
                    .disconnected(ServerProtocol::ManageSieve, None);
                return;
            }

            loop {
                let Some(line) = reader.next_line(&mut session.stream, timeout).await else {
                    break;
                };
                let args = split_args(&line);
                let verb = args
                    .first()
                    .map(|verb| verb.to_ascii_uppercase())
                    .unwrap_or_default();

                match verb.as_str() {
                    "CAPABILITY" => {
                        let response = concat!(
                            "\"IMPLEMENTATION\" \"Sora proxy\"\r\n",
                            "\"VERSION\" \"1.0\"\r\n",
                            "\"SASL\" \"PLAIN\"\r\n",
                            "\"SIEVE\" \"fileinto envelope\"\r\n",
                            "OK \"Capability completed.\"\r\n"
                        );
                        if write(&mut session.stream, response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    "NOOP" => {
                        write(&mut session.stream, b"OK \"Done.\"\r\n").await.ok();
                    }
                    "LOGOUT" => {
                        write(&mut session.stream, b"OK \"Logout completed.\"\r\n")
                            .await
                            .ok();
                        break;
                    }
                    "AUTHENTICATE" => {
                        if !args
                            .get(1)
                            .is_some_and(|mech| mech.eq_ignore_ascii_case("PLAIN"))
                        {
                            write(
                                &mut session.stream,
                                b"NO \"Unsupported authentication mechanism.\"\r\n",
                            )
                            .await
                            .ok();
                            continue;
                        }
                        let Some(initial) = args.get(2) else {
                            write(&mut session.stream, b"NO \"Missing initial response.\"\r\n")
                                .await
                                .ok();
                            continue;
                        };
                        let Some((_, authcid, secret)) =
                            decode_sasl_plain(initial.as_bytes())
                        else {
                            write(
                                &mut session.stream,
                                b"NO \"Invalid SASL PLAIN response.\"\r\n",
                            )
                            .await
                            .ok();
                            continue;
                        };

                        match proxy
                            .authenticate_route(
                                ServerProtocol::ManageSieve,
                                session.remote_ip,
                                &authcid,
                                &secret,
                            )
                            .await
                        {
                            Ok(route) => {
                                proxy
                                    .sieve_backend(session, reader, route, authcid, secret)
                                    .await;
                                break;
                            }
                            Err(ProxyAuthError::Denied) => {
                                auth_failures += 1;
                                if write(
                                    &mut session.stream,
                                    b"NO \"Authentication failed.\"\r\n",
                                )
                                .await
                                .is_err()
                                    || auth_failures >= 3
                                {
                                    break;
                                }
                            }
                            Err(ProxyAuthError::Transient) => {
                                write(
                                    &mut session.stream,
                                    b"NO (TRYLATER) \"Try again later.\"\r\n",
                                )
                                .await
                                .ok();
                                break;
                            }
                        }
                    }
                    _ => {
                        write(&mut session.stream, b"NO \"Authenticate first.\"\r\n")
                            .await
                            .ok();
                    }
                }
            }
            proxy
                .core
                .tracker
                .disconnected(ServerProtocol::ManageSieve, None);
        }
    }

    fn core(&self) -> &SharedCore {
        &self.proxy.core
    }
}

impl crate::ProxyCore {
    async fn sieve_backend<T: SessionStream>(
        &self,
        mut session: SessionData<T>,
        mut reader: LineReader,
        route: crate::Route,
        username: String,
        secret: String,
    ) -> Option<()> {
        let timeout = self.core.config.proxy.session_timeout;
        let client_addr = SocketAddr::new(session.remote_ip, session.remote_port);
        let server_addr = SocketAddr::new(session.local_ip, session.local_port);

        let mut backend = match self
            .connect_backend(route.backend, client_addr, server_addr)
            .await
        {
            Ok(backend) => backend,
            Err(_) => {
                write(
                    &mut session.stream,
                    b"NO (TRYLATER) \"Backend unavailable.\"\r\n",
                )
                .await
                .ok();
                return None;
            }
        };
        let mut backend_reader = LineReader::default();

        // Consume the backend capability greeting up to its OK line.
        loop {
            let line = backend_reader.next_line(&mut backend, timeout).await?;
            if line.starts_with("OK") || line.starts_with("NO") || line.starts_with("BYE") {
                break;
            }
        }

        // Replay the credentials.
        let response = STANDARD.encode(format!("\0{username}\0{secret}"));
        backend
            .write_all(format!("AUTHENTICATE \"PLAIN\" \"{response}\"\r\n").as_bytes())
            .await
            .ok()?;
        let line = backend_reader.next_line(&mut backend, timeout).await?;
        write(&mut session.stream, format!("{line}\r\n").as_bytes())
            .await
            .ok()?;
        if !line.starts_with("OK") {
            return None;
        }

        tracing::debug!(
            context = "proxy",
            event = "spliced",
            protocol = "managesieve",
            account = route.address,
            backend = route.backend.to_string(),
            "Entering splice."
        );

        let leftover = reader.take_leftover();
        if !leftover.is_empty() {
            backend.write_all(&leftover).await.ok()?;
        }
        let leftover = backend_reader.take_leftover();
        if !leftover.is_empty() {
            write(&mut session.stream, &leftover).await.ok()?;
        }
        crate::splice::splice(&mut session.stream, &mut backend, timeout).await;
        Some(())
    }
}

async fn write<T: SessionStream>(stream: &mut T, bytes: &[u8]) -> Result<(), ()> {
    stream.write_all(bytes).await.map_err(|_| ())?;
    stream.flush().await.map_err(|_| ())
}
