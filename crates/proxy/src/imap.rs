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

use crate::{imap_quote, split_args, LineReader, ProxyAuthError, SharedProxy};

#[derive(Clone)]
pub struct ImapProxyManager {
    pub proxy: SharedProxy,
}

impl ImapProxyManager {
    pub fn new(proxy: SharedProxy) -> Self {
        Self { proxy }
    }
}

impl SessionManager for ImapProxyManager {
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

            if write(
                &mut session.stream,
                b"* OK [CAPABILITY IMAP4rev1 IMAP4rev2 AUTH=PLAIN SASL-IR ID] Sora proxy ready.\r\n",
            )
            .await
            .is_err()
            {
                proxy.core.tracker.disconnected(ServerProtocol::Imap, None);
                return;
            }

            loop {
                let Some(line) = reader.next_line(&mut session.stream, timeout).await else {
                    break;
                };
                let args = split_args(&line);
                let tag = args.first().cloned().unwrap_or_default();
                let command = args
                    .get(1)
                    .map(|verb| verb.to_ascii_uppercase())
                    .unwrap_or_default();

                let (username, secret) = match command.as_str() {
                    "CAPABILITY" => {
                        let response = format!(
                            "* CAPABILITY IMAP4rev1 IMAP4rev2 AUTH=PLAIN SASL-IR ID\r\n{tag} OK CAPABILITY completed\r\n"
                        );
                        if write(&mut session.stream, response.as_bytes()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    "NOOP" => {
                        let response = format!("{tag} OK NOOP completed\r\n");
                        if write(&mut session.stream, response.as_bytes()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    "ID" => {
                        let response =
                            format!("* ID NIL\r\n{tag} OK ID completed\r\n");
                        if write(&mut session.stream, response.as_bytes()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    "LOGOUT" => {
                        let response = format!(
                            "* BYE Sora proxy logging out\r\n{tag} OK LOGOUT completed\r\n"
                        );
                        write(&mut session.stream, response.as_bytes()).await.ok();
                        break;
                    }
                    "LOGIN" => match (args.get(2), args.get(3)) {
                        (Some(username), Some(secret)) => {
                            (username.clone(), secret.clone())
                        }
                        _ => {
                            let response =
                                format!("{tag} BAD LOGIN requires a username and password\r\n");
                            if write(&mut session.stream, response.as_bytes()).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    },
                    "AUTHENTICATE" => {
                        if !args
                            .get(2)
                            .is_some_and(|mech| mech.eq_ignore_ascii_case("PLAIN"))
                        {
                            let response =
                                format!("{tag} NO Unsupported authentication mechanism\r\n");
                            if write(&mut session.stream, response.as_bytes()).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let initial = match args.get(3) {
                            Some(initial) => initial.clone(),
                            None => {
                                if write(&mut session.stream, b"+ \"\"\r\n").await.is_err() {
                                    break;
                                }
                                match reader.next_line(&mut session.stream, timeout).await {
                                    Some(line) => line,
                                    None => break,
                                }
                            }
                        };
                        match decode_sasl_plain(initial.as_bytes()) {
                            Some((_, authcid, secret)) => (authcid, secret),
                            None => {
                                let response =
                                    format!("{tag} BAD Invalid SASL PLAIN response\r\n");
                                if write(&mut session.stream, response.as_bytes())
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        }
                    }
                    _ => {
                        let response = format!("{tag} NO Authenticate first\r\n");
                        if write(&mut session.stream, response.as_bytes()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                match proxy
                    .authenticate_route(
                        ServerProtocol::Imap,
                        session.remote_ip,
                        &username,
                        &secret,
                    )
                    .await
                {
                    Ok(route) => {
                        proxy
                            .run_backend(
                                session, reader, route, tag, username, secret,
                            )
                            .await;
                        break;
                    }
                    Err(ProxyAuthError::Denied) => {
                        auth_failures += 1;
                        let response = format!(
                            "{tag} NO [AUTHENTICATIONFAILED] Authentication failed\r\n"
                        );
                        if write(&mut session.stream, response.as_bytes()).await.is_err()
                            || auth_failures >= 3
                        {
                            break;
                        }
                    }
                    Err(ProxyAuthError::Transient) => {
                        let response =
                            format!("{tag} NO [UNAVAILABLE] Try again later\r\n");
                        write(&mut session.stream, response.as_bytes()).await.ok();
                        break;
                    }
                }
            }
            proxy.core.tracker.disconnected(ServerProtocol::Imap, None);
        }
    }

    fn core(&self) -> &SharedCore {
        &self.proxy.core
    }
}

impl crate::ProxyCore {
    async fn run_backend<T: SessionStream>(
        &self,
        mut session: SessionData<T>,
        mut reader: LineReader,
        route: crate::Route,
        tag: String,
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
                let response = format!("{tag} NO [UNAVAILABLE] Backend unavailable\r\n");
                write(&mut session.stream, response.as_bytes()).await.ok();
                return None;
            }
        };
        let mut backend_reader = LineReader::default();

        // Consume the backend greeting.
        backend_reader.next_line(&mut backend, timeout).await?;

        // Preserve the original client identity via an ID exchange.
        if self.core.config.proxy.remote_use_xclient {
            let id = format!(
                "p1 ID (\"name\" \"sora-proxy\" \"x-originating-ip\" {} \"x-originating-port\" \"{}\")\r\n",
                imap_quote(&session.remote_ip.to_string()),
                session.remote_port,
            );
            backend.write_all(id.as_bytes()).await.ok()?;
            loop {
                let line = backend_reader.next_line(&mut backend, timeout).await?;
                if line.starts_with("p1 ") {
                    break;
                }
            }
        }

        // Replay the client's credentials.
        let login = format!(
            "{tag} LOGIN {} {}\r\n",
            imap_quote(&username),
            imap_quote(&secret)
        );
        backend.write_all(login.as_bytes()).await.ok()?;
        loop {
            let line = backend_reader.next_line(&mut backend, timeout).await?;
            let is_tagged = line.starts_with(&format!("{tag} "));
            let forward = format!("{line}\r\n");
            write(&mut session.stream, forward.as_bytes()).await.ok()?;
            if is_tagged {
                if !line.contains(" OK") {
                    return None;
                }
                break;
            }
        }

        tracing::debug!(
            context = "proxy",
            event = "spliced",
            protocol = "imap",
            account = route.address,
            backend = route.backend.to_string(),
            "Entering splice."
        );

        // Replay any pipelined bytes, then hand the connection over.
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
