/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD, Engine};
use common::{
    listener::{SessionData, SessionManager, SessionStream},
    ServerProtocol, SharedCore,
};
use tokio::io::AsyncWriteExt;

use crate::{LineReader, SharedProxy};

/// LMTP frontend: accepts LHLO and MAIL locally, resolves the route on the
/// first RCPT, then bridges to the backend replaying the transaction with
/// XCLIENT and per-RCPT XRCPTFORWARD identity metadata.
#[derive(Clone)]
pub struct LmtpProxyManager {
    pub proxy: SharedProxy,
}

impl LmtpProxyManager {
    pub fn new(proxy: SharedProxy) -> Self {
        Self { proxy }
    }
}

impl SessionManager for LmtpProxyManager {
    #[allow(clippy::manual_async_fn)]
    fn handle<T: SessionStream>(
        self,
        mut session: SessionData<T>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let proxy = self.proxy;
            let timeout = proxy.core.config.proxy.session_timeout;
            let mut reader = LineReader::default();
            let mut helo = None;
            let mut mail_from: Option<String> = None;

            let hostname = proxy
                .core
                .config
                .hostname
                .clone()
                .unwrap_or_else(|| "localhost".to_string());
            if write(
                &mut session.stream,
                format!("220 {hostname} Sora LMTP proxy ready\r\n").as_bytes(),
            )
            .await
            .is_err()
            {
                proxy.core.tracker.disconnected(ServerProtocol::Lmtp, None);
                return;
            }

            loop {
                let Some(line) = reader.next_line(&mut session.stream, timeout).await else {
                    break;
                };
                let (verb, args) = match line.split_once(' ') {
                    Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim().to_string()),
                    None => (line.to_ascii_uppercase(), String::new()),
                };

                match verb.as_str() {
                    "LHLO" => {
                        helo = Some(args);
                        let response = format!(
                            "250-{hostname}\r\n250-PIPELINING\r\n250-ENHANCEDSTATUSCODES\r\n250 8BITMIME\r\n"
                        );
                        if write(&mut session.stream, response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    "MAIL" => {
                        if helo.is_none() {
                            write(&mut session.stream, b"503 5.5.1 Send LHLO first\r\n")
                                .await
                                .ok();
                            continue;
                        }
                        mail_from = Some(line.clone());
                        if write(&mut session.stream, b"250 2.1.0 OK\r\n").await.is_err() {
                            break;
                        }
                    }
                    "RCPT" => {
                        let Some(mail_line) = mail_from.clone() else {
                            write(&mut session.stream, b"503 5.5.1 Send MAIL first\r\n")
                                .await
                                .ok();
                            continue;
                        };
                        let Some(address) = extract_address(&args) else {
                            write(
                                &mut session.stream,
                                b"501 5.5.4 Syntax: RCPT TO:<address>\r\n",
                            )
                            .await
                            .ok();
                            continue;
                        };

                        // Route on the recipient; delivery has no password
                        // to check, so only the account lookup gates it.
                        let route = match proxy.core.store.credential_by_address(&address).await
                        {
                            Ok(Some(credential)) => {
                                crate::Route {
                                    backend: match proxy.lmtp_backend_for(&credential.address) {
                                        Some(backend) => backend,
                                        None => {
                                            write(
                                                &mut session.stream,
                                                b"451 4.3.0 No backend available\r\n",
                                            )
                                            .await
                                            .ok();
                                            continue;
                                        }
                                    },
                                    address: credential.address,
                                }
                            }
                            Ok(None) => {
                                write(&mut session.stream, b"550 5.1.1 No such user\r\n")
                                    .await
                                    .ok();
                                continue;
                            }
                            Err(_) => {
                                write(
                                    &mut session.stream,
                                    b"451 4.3.0 Temporary lookup failure\r\n",
                                )
                                .await
                                .ok();
                                continue;
                            }
                        };

                        proxy
                            .lmtp_backend(
                                session,
                                reader,
                                route,
                                helo.unwrap_or_default(),
                                mail_line,
                                line,
                            )
                            .await;
                        proxy.core.tracker.disconnected(ServerProtocol::Lmtp, None);
                        return;
                    }
                    "RSET" => {
                        mail_from = None;
                        write(&mut session.stream, b"250 2.0.0 OK\r\n").await.ok();
                    }
                    "NOOP" => {
                        write(&mut session.stream, b"250 2.0.0 OK\r\n").await.ok();
                    }
                    "QUIT" => {
                        write(&mut session.stream, b"221 2.0.0 Bye\r\n").await.ok();
                        break;
                    }
                    _ => {
                        write(&mut session.stream, b"500 5.5.2 Unknown command\r\n")
                            .await
                            .ok();
                    }
                }
            }
            proxy.core.tracker.disconnected(ServerProtocol::Lmtp, None);
        }
    }

    fn core(&self) -> &SharedCore {
        &self.proxy.core
    }
}

impl crate::ProxyCore {
    fn lmtp_backend_for(&self, address: &str) -> Option<SocketAddr> {
        if let Some(backend) = self.core.affinity.get(address, ServerProtocol::Lmtp) {
            return Some(backend);
        }
        let valid = &self.core.config.proxy.valid_backends;
        if valid.is_empty() {
            None
        } else {
            use rand::Rng;
            Some(valid[rand::thread_rng().gen_range(0..valid.len())])
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn lmtp_backend<T: SessionStream>(
        &self,
        mut session: SessionData<T>,
        mut reader: LineReader,
        route: crate::Route,
        helo: String,
        mail_line: String,
        rcpt_line: String,
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
                write(&mut session.stream, b"451 4.3.0 Backend unavailable\r\n")
                    .await
                    .ok();
                return None;
            }
        };
        let mut backend_reader = LineReader::default();

        // Greeting, then replay the transaction so far.
        backend_reader.next_line(&mut backend, timeout).await?;
        backend
            .write_all(format!("LHLO {helo}\r\n").as_bytes())
            .await
            .ok()?;
        loop {
            let line = backend_reader.next_line(&mut backend, timeout).await?;
            if !line.starts_with("250-") {
                break;
            }
        }

        if self.core.config.proxy.remote_use_xclient {
            let xclient = format!(
                "XCLIENT ADDR={} PORT={} PROTO=LMTP\r\n",
                session.remote_ip, session.remote_port
            );
            backend.write_all(xclient.as_bytes()).await.ok()?;
            // XCLIENT resets the session; re-issue LHLO.
            backend_reader.next_line(&mut backend, timeout).await?;
            backend
                .write_all(format!("LHLO {helo}\r\n").as_bytes())
                .await
                .ok()?;
            loop {
                let line = backend_reader.next_line(&mut backend, timeout).await?;
                if !line.starts_with("250-") {
                    break;
                }
            }
        }

        backend
            .write_all(format!("{mail_line}\r\n").as_bytes())
            .await
            .ok()?;
        let response = backend_reader.next_line(&mut backend, timeout).await?;
        if !response.starts_with("250") {
            write(&mut session.stream, format!("{response}\r\n").as_bytes())
                .await
                .ok()?;
            return None;
        }

        // First RCPT carries the forwarding metadata.
        let forward = STANDARD.encode(format!(
            "proxy={}\toriginating-ip={}",
            session.local_ip, session.remote_ip
        ));
        backend
            .write_all(format!("{rcpt_line} XRCPTFORWARD={forward}\r\n").as_bytes())
            .await
            .ok()?;
        let response = backend_reader.next_line(&mut backend, timeout).await?;
        write(&mut session.stream, format!("{response}\r\n").as_bytes())
            .await
            .ok()?;

        tracing::debug!(
            context = "proxy",
            event = "spliced",
            protocol = "lmtp",
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

fn extract_address(args: &str) -> Option<String> {
    let rest = args.split_whitespace().next()?;
    let rest = if rest.len() >= 3 && rest[..3].eq_ignore_ascii_case("TO:") {
        &rest[3..]
    } else {
        rest
    };
    let address = rest.trim().trim_start_matches('<').trim_end_matches('>');
    if address.is_empty() {
        None
    } else {
        Some(address.to_ascii_lowercase())
    }
}

async fn write<T: SessionStream>(stream: &mut T, bytes: &[u8]) -> Result<(), ()> {
    stream.write_all(bytes).await.map_err(|_| ())?;
    stream.flush().await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::extract_address;

    #[test]
    fn address_extraction() {
        assert_eq!(
            extract_address("TO:<alice@x.test>"),
            Some("alice@x.test".to_string())
        );
        assert_eq!(
            extract_address("to:<Bob@X.Test> XRCPTFORWARD=abc"),
            Some("bob@x.test".to_string())
        );
        assert_eq!(extract_address("TO:<>"), None);
    }
}
