/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::SocketAddr;

use common::{
    auth::decode_sasl_plain,
    listener::{SessionData, SessionManager, SessionStream},
    ServerProtocol, SharedCore,
};
use tokio::io::AsyncWriteExt;

use crate::{LineReader, ProxyAuthError, SharedProxy};

#[derive(Clone)]
pub struct Pop3ProxyManager {
    pub proxy: SharedProxy,
}

impl Pop3ProxyManager {
    pub fn new(proxy: SharedProxy) -> Self {
        Self { proxy }
    }
}

impl SessionManager for Pop3ProxyManager {
    #[allow(clippy::manual_async_fn)]
    fn handle<T: SessionStream>(
        self,
        mut session: SessionData<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let proxy = self.proxy;
            let timeout = proxy.core.config.proxy.session_timeout;
            let mut reader = LineReader::default();
            let mut username: Option<String> = None;
            let mut auth_failures = 0u32;

            if write(&mut session.stream, b"+OK Sora POP3 proxy ready.\r\n")
                .await
                .is_err()
            {
                proxy.core.tracker.disconnected(ServerProtocol::Pop3, None);
                return;
            }

            loop {
                let Some(line) = reader.next_line(&mut session.stream, timeout).await else {
                    break;
                };
                let mut parts = line.split_whitespace();
                let verb = parts.next().unwrap_or("").to_ascii_uppercase();

                let credentials = match verb.as_str() {
                    "CAPA" => {
                        write(
                            &mut session.stream,
                            b"+OK Capability list follows\r\nUSER\r\nSASL PLAIN\r\nPIPELINING\r\n.\r\n",
                        )
                        .await
                        .ok();
                        continue;
                    }
                    "NOOP" => {
                        write(&mut session.stream, b"+OK\r\n").await.ok();
                        continue;
                    }
                    "QUIT" => {
                        write(&mut session.stream, b"+OK Bye\r\n").await.ok();
                        break;
                    }
                    "USER" => {
                        username = parts.next().map(|name| name.to_string());
                        write(&mut session.stream, b"+OK Send PASS\r\n").await.ok();
                        continue;
                    }
                    "PASS" => match (&username, line.splitn(2, ' ').nth(1)) {
                        (Some(username), Some(secret)) => {
                            Some((username.clone(), secret.to_string()))
                        }
                        _ => {
                            write(&mut session.stream, b"-ERR Send USER first\r\n")
                                .await
                                .ok();
                            continue;
                        }
                    },
                    "AUTH" => {
                        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
                        if mechanism != "PLAIN" {
                            write(&mut session.stream, b"-ERR Unsupported mechanism\r\n")
                                .await
                                .ok();
                            continue;
                        }
                        let initial = match parts.next() {
                            Some(initial) => initial.to_string(),
                            None => {
                                if write(&mut session.stream, b"+ \r\n").await.is_err() {
                                    break;
                                }
                                match reader.next_line(&mut session.stream, timeout).await {
                                    Some(line) => line,
                                    None => break,
                                }
                            }
                        };
                        match decode_sasl_plain(initial.as_bytes()) {
                            Some((_, authcid, secret)) => Some((authcid, secret)),
                            None => {
                                write(&mut session.stream, b"-ERR Invalid SASL response\r\n")
                                    .await
                                    .ok();
                                continue;
                            }
                        }
                    }
                    _ => {
                        write(&mut session.stream, b"-ERR Authenticate first\r\n")
                            .await
                            .ok();
                        continue;
                    }
                };

                let Some((user, secret)) = credentials else {
                    continue;
                };

                match proxy
                    .authenticate_route(
                        ServerProtocol::Pop3,
                        session.remote_ip,
                        &user,
                        &secret,
                    )
                    .await
                {
                    Ok(route) => {
                        proxy
                            .pop3_backend(session, reader, route, user, secret)
                            .await;
                        break;
                    }
                    Err(ProxyAuthError::Denied) => {
                        auth_failures += 1;
                        if write(&mut session.stream, b"-ERR Authentication failed\r\n")
                            .await
                            .is_err()
                            || auth_failures >= 3
                        {
                            break;
                        }
                        username = None;
                    }
                    Err(ProxyAuthError::Transient) => {
                        write(&mut session.stream, b"-ERR [SYS/TEMP] Try again later\r\n")
                            .await
                            .ok();
                        break;
                    }
                }
            }
            proxy.core.tracker.disconnected(ServerProtocol::Pop3, None);
        }
    }

    fn core(&self) -> &SharedCore {
        &self.proxy.core
    }
}

impl crate::ProxyCore {
    async fn pop3_backend<T: SessionStream>(
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
                write(&mut session.stream, b"-ERR [SYS/TEMP] Backend unavailable\r\n")
                    .await
                    .ok();
                return None;
            }
        };
        let mut backend_reader = LineReader::default();

        // Greeting.
        backend_reader.next_line(&mut backend, timeout).await?;

        // Forward the original client identity.
        if self.core.config.proxy.remote_use_xclient {
            let xclient = format!(
                "XCLIENT ADDR={} PORT={} PROTO=POP3\r\n",
                session.remote_ip, session.remote_port
            );
            backend.write_all(xclient.as_bytes()).await.ok()?;
            backend_reader.next_line(&mut backend, timeout).await?;
        }

        // Replay credentials.
        backend
            .write_all(format!("USER {username}\r\n").as_bytes())
            .await
            .ok()?;
        backend_reader.next_line(&mut backend, timeout).await?;
        backend
            .write_all(format!("PASS {secret}\r\n").as_bytes())
            .await
            .ok()?;
        let response = backend_reader.next_line(&mut backend, timeout).await?;
        write(&mut session.stream, format!("{response}\r\n").as_bytes())
            .await
            .ok()?;
        if !response.starts_with("+OK") {
            return None;
        }

        tracing::debug!(
            context = "proxy",
            event = "spliced",
            protocol = "pop3",
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
