/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::IpAddr;

use base64::{engine::general_purpose::STANDARD, Engine};
use store::{Error, Result};

use crate::{Core, ServerProtocol};

pub mod limiter;

/// Outcome of a successful authentication.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub account_id: i64,
    pub address: String,
    /// True when a master credential authenticated on behalf of the account.
    pub is_master: bool,
}

pub struct AuthRequest<'x> {
    pub username: &'x str,
    pub secret: &'x str,
    /// SASL authorization identity; with a master credential this selects the
    /// account to impersonate.
    pub authzid: Option<&'x str>,
    pub protocol: ServerProtocol,
    pub remote_ip: IpAddr,
}

impl Core {
    pub async fn authenticate(&self, req: AuthRequest<'_>) -> Result<AccessToken> {
        // Per-IP attempt cap and progressive delay
        if !self.auth.is_allowed(req.remote_ip) {
            return Err(Error::rate_limited("Too many authentication attempts"));
        }
        if let Some(delay) = self.auth.delay(req.remote_ip, req.username) {
            tokio::time::sleep(delay).await;
        }

        let result = self.authenticate_inner(&req).await;
        match &result {
            Ok(token) => {
                self.auth.record_success(req.remote_ip, req.username);
                self.metrics.auth_success(req.protocol);
                if token.is_master {
                    tracing::info!(
                        context = "auth",
                        event = "impersonate",
                        protocol = ?req.protocol,
                        remote.ip = req.remote_ip.to_string(),
                        account = token.address,
                        "Master credential impersonating account."
                    );
                }
            }
            Err(err) if err.is_unauthorized() => {
                self.auth.record_failure(req.remote_ip, req.username);
                self.metrics.auth_failure(req.protocol);
            }
            Err(_) => (),
        }
        let _ = self
            .store
            .record_auth_attempt(req.remote_ip, req.username, result.is_ok())
            .await;
        result
    }

    async fn authenticate_inner(&self, req: &AuthRequest<'_>) -> Result<AccessToken> {
        // Master credential with an authzid logs in as the target user
        // without a password check against that user.
        if let (Some(master_user), Some(master_secret)) = (
            self.config.auth.master_username.as_deref(),
            self.config.auth.master_password.as_deref(),
        ) {
            if req.username == master_user {
                if !verify_password(master_secret, req.secret) {
                    return Err(Error::unauthorized("Authentication failed"));
                }
                let target = req
                    .authzid
                    .filter(|authzid| !authzid.is_empty())
                    .ok_or_else(|| {
                        Error::unauthorized("Master login requires an authorization identity")
                    })?;
                let credential = self
                    .store
                    .credential_by_address(target)
                    .await?
                    .ok_or_else(|| Error::unauthorized("Authentication failed"))?;
                return Ok(AccessToken {
                    account_id: credential.account_id,
                    address: credential.address,
                    is_master: true,
                });
            }
        }

        let credential = self
            .store
            .credential_by_address(req.username)
            .await?
            .ok_or_else(|| Error::unauthorized("Authentication failed"))?;
        if !verify_password(&credential.password_hash, req.secret) {
            return Err(Error::unauthorized("Authentication failed"));
        }

        Ok(AccessToken {
            account_id: credential.account_id,
            address: credential.address,
            is_master: false,
        })
    }
}

/// Verifies a secret against a stored hash, dispatching on the hash prefix.
pub fn verify_password(hash: &str, secret: &str) -> bool {
    if hash.starts_with("$argon2") {
        use argon2::{Argon2, PasswordHash, PasswordVerifier};
        PasswordHash::new(hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(secret.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    } else if hash.starts_with("$2") {
        bcrypt::verify(secret, hash).unwrap_or(false)
    } else if hash.starts_with("$6$") || hash.starts_with("$5$") || hash.starts_with("$1$") {
        pwhash::unix::verify(secret, hash)
    } else {
        // Legacy plain-text rows created by early imports.
        hash.as_bytes().len() == secret.as_bytes().len()
            && hash
                .as_bytes()
                .iter()
                .zip(secret.as_bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

/// Decodes a SASL PLAIN initial response into (authzid, authcid, password).
pub fn decode_sasl_plain(response: &[u8]) -> Option<(String, String, String)> {
    let decoded = STANDARD.decode(response).ok()?;
    let mut parts = decoded.split(|&ch| ch == 0);
    let authzid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let authcid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let secret = String::from_utf8(parts.next()?.to_vec()).ok()?;
    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some((authzid, authcid, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sasl_plain() {
        let encoded = STANDARD.encode(b"\0alice@example.org\0secret");
        let (authzid, authcid, secret) = decode_sasl_plain(encoded.as_bytes()).unwrap();
        assert_eq!(authzid, "");
        assert_eq!(authcid, "alice@example.org");
        assert_eq!(secret, "secret");

        let encoded = STANDARD.encode(b"bob@example.org\0master\0pw");
        let (authzid, authcid, _) = decode_sasl_plain(encoded.as_bytes()).unwrap();
        assert_eq!(authzid, "bob@example.org");
        assert_eq!(authcid, "master");

        assert!(decode_sasl_plain(b"not base64!").is_none());
        assert!(decode_sasl_plain(STANDARD.encode(b"onlyone").as_bytes()).is_none());
    }

    #[test]
    fn password_dispatch() {
        // Plain-text fallback is constant-time compared.
        assert!(verify_password("secret", "secret"));
        assert!(!verify_password("secret", "Secret"));
        assert!(!verify_password("secret", "secret2"));

        let hash = bcrypt::hash("hunter2", 4).unwrap();
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
    }
}
