/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fs::File, io::BufReader, sync::Arc};

use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

use super::TcpAcceptor;

impl TlsConfig {
    pub fn build_acceptor(&self, implicit: bool) -> Result<TcpAcceptor, String> {
        let certs = read_certificates(self)?;
        let key = read_private_key(self)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| format!("Failed to build TLS configuration: {err}"))?;
        let config = Arc::new(config);

        Ok(TcpAcceptor::Tls {
            acceptor: TlsAcceptor::from(config.clone()),
            config,
            implicit,
        })
    }
}

fn read_certificates(config: &TlsConfig) -> Result<Vec<CertificateDer<'static>>, String> {
    let mut reader = BufReader::new(
        File::open(&config.certificate)
            .map_err(|err| format!("Failed to open {}: {err}", config.certificate.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("Failed to parse {}: {err}", config.certificate.display()))?;
    if certs.is_empty() {
        return Err(format!(
            "No certificates found in {}",
            config.certificate.display()
        ));
    }
    Ok(certs)
}

fn read_private_key(config: &TlsConfig) -> Result<PrivateKeyDer<'static>, String> {
    let mut reader = BufReader::new(
        File::open(&config.private_key)
            .map_err(|err| format!("Failed to open {}: {err}", config.private_key.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| format!("Failed to parse {}: {err}", config.private_key.display()))?
        .ok_or_else(|| {
            format!(
                "No private key found in {}",
                config.private_key.display()
            )
        })
}
