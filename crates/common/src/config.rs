/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use serde::Deserialize;

use crate::ServerProtocol;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub hostname: Option<String>,
    pub database: DatabaseConfig,
    pub s3: S3Config,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub imap: ImapConfig,
    #[serde(default)]
    pub pop3: Pop3Config,
    #[serde(default)]
    pub lmtp: LmtpConfig,
    #[serde(default)]
    pub managesieve: ManageSieveConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub id: String,
    pub protocol: ServerProtocol,
    /// Whether this listener runs the backend server or the reverse proxy.
    #[serde(default)]
    pub kind: ListenerKind,
    pub bind: Vec<SocketAddr>,
    #[serde(default)]
    pub tls_implicit: bool,
    /// CIDR networks trusted to send a PROXY protocol preamble.
    #[serde(default)]
    pub proxy_networks: Vec<IpNet>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u64,
    /// Per-source-IP connection cap; 0 disables it (proxy scenarios).
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: u64,
    /// CIDR networks exempt from the per-IP cap (internal load balancers).
    #[serde(default)]
    pub trusted_networks: Vec<IpNet>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    #[default]
    Backend,
    Proxy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Optional read replica; falls back to the primary when absent.
    #[serde(default)]
    pub read_host: Option<String>,
    #[serde(default = "default_pool_size")]
    pub max_connections: usize,
    #[serde(default, with = "opt_duration")]
    pub connect_timeout: Option<Duration>,
    #[serde(default = "default_true")]
    pub create_tables: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_s3_timeout", with = "duration")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// Total on-disk budget; eviction runs until the cache is below it.
    pub max_size_bytes: u64,
    /// Objects larger than this bypass the cache entirely.
    pub max_object_bytes: u64,
    #[serde(with = "duration")]
    pub eviction_interval: Duration,
    pub warmup_per_account: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: PathBuf::from("/var/cache/sora"),
            max_size_bytes: 1024 * 1024 * 1024,
            max_object_bytes: 5 * 1024 * 1024,
            eviction_interval: Duration::from_secs(300),
            warmup_per_account: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub staging_path: PathBuf,
    pub batch_size: i64,
    pub max_attempts: i32,
    #[serde(with = "duration")]
    pub interval: Duration,
    #[serde(with = "duration")]
    pub attempt_timeout: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        UploaderConfig {
            staging_path: PathBuf::from("/var/spool/sora/staging"),
            batch_size: 20,
            max_attempts: 5,
            interval: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Master credential allowed to impersonate any account via authzid.
    pub master_username: Option<String>,
    pub master_password: Option<String>,
    pub max_attempts_per_ip: u32,
    #[serde(with = "duration")]
    pub attempt_window: Duration,
    /// Base of the progressive delay; doubles per consecutive failure.
    #[serde(with = "duration")]
    pub delay_base: Duration,
    #[serde(with = "duration")]
    pub delay_max: Duration,
    #[serde(with = "duration")]
    pub cleanup_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            master_username: None,
            master_password: None,
            max_attempts_per_ip: 10,
            attempt_window: Duration::from_secs(900),
            delay_base: Duration::from_millis(500),
            delay_max: Duration::from_secs(8),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub max_request_size: usize,
    pub max_auth_failures: u32,
    #[serde(with = "duration")]
    pub timeout_unauth: Duration,
    #[serde(with = "duration")]
    pub timeout_auth: Duration,
    #[serde(with = "duration")]
    pub timeout_idle: Duration,
    pub allow_plain_auth: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        ImapConfig {
            max_request_size: 52428800,
            max_auth_failures: 3,
            timeout_unauth: Duration::from_secs(60),
            timeout_auth: Duration::from_secs(1800),
            timeout_idle: Duration::from_secs(29 * 60),
            allow_plain_auth: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Pop3Config {
    pub max_request_size: usize,
    pub max_auth_failures: u32,
    #[serde(with = "duration")]
    pub timeout: Duration,
}

impl Default for Pop3Config {
    fn default() -> Self {
        Pop3Config {
            max_request_size: 52428800,
            max_auth_failures: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LmtpConfig {
    pub max_message_size: usize,
    pub max_recipients: usize,
    #[serde(with = "duration")]
    pub timeout: Duration,
    /// Networks whose XCLIENT / XRCPTFORWARD parameters are honored.
    pub trusted_networks: Vec<IpNet>,
    pub allow_sieve_create: bool,
    #[serde(with = "opt_duration")]
    pub fts_retention: Option<Duration>,
}

impl Default for LmtpConfig {
    fn default() -> Self {
        LmtpConfig {
            max_message_size: 52428800,
            max_recipients: 100,
            timeout: Duration::from_secs(300),
            trusted_networks: Vec::new(),
            allow_sieve_create: true,
            fts_retention: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManageSieveConfig {
    pub max_script_size: usize,
    pub max_scripts: usize,
    #[serde(with = "duration")]
    pub timeout: Duration,
    /// Extensions advertised in the SIEVE capability line.
    pub extensions: Vec<String>,
}

impl Default for ManageSieveConfig {
    fn default() -> Self {
        ManageSieveConfig {
            max_script_size: 1024 * 1024,
            max_scripts: 50,
            timeout: Duration::from_secs(300),
            extensions: vec![
                "fileinto".to_string(),
                "envelope".to_string(),
                "vacation".to_string(),
                "reject".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Backends a pre-lookup or affinity answer may route to.
    pub valid_backends: Vec<SocketAddr>,
    pub remote_use_proxy_protocol: bool,
    pub remote_use_xclient: bool,
    #[serde(with = "duration")]
    pub connect_timeout: Duration,
    #[serde(with = "duration")]
    pub session_timeout: Duration,
    #[serde(with = "duration")]
    pub affinity_ttl: Duration,
    #[serde(default)]
    pub prelookup: Option<PrelookupConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            valid_backends: Vec::new(),
            remote_use_proxy_protocol: false,
            remote_use_xclient: true,
            connect_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(1800),
            affinity_ttl: Duration::from_secs(3600),
            prelookup: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrelookupConfig {
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_prelookup_timeout", with = "duration")]
    pub timeout: Duration,
    #[serde(default = "default_positive_ttl", with = "duration")]
    pub positive_ttl: Duration,
    #[serde(default = "default_negative_ttl", with = "duration")]
    pub negative_ttl: Duration,
    #[serde(default = "default_cache_size")]
    pub cache_max_entries: usize,
    #[serde(default = "default_window_size")]
    pub breaker_window: usize,
    #[serde(default = "default_breaker_cooldown", with = "duration")]
    pub breaker_cooldown: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// A parsed CIDR network, e.g. `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

impl std::str::FromStr for IpNet {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => (
                addr.parse::<IpAddr>()
                    .map_err(|err| format!("invalid network {value:?}: {err}"))?,
                prefix
                    .parse::<u8>()
                    .map_err(|err| format!("invalid prefix in {value:?}: {err}"))?,
            ),
            None => {
                let addr = value
                    .parse::<IpAddr>()
                    .map_err(|err| format!("invalid address {value:?}: {err}"))?;
                (addr, if addr.is_ipv4() { 32 } else { 128 })
            }
        };
        if (addr.is_ipv4() && prefix > 32) || prefix > 128 {
            return Err(format!("prefix out of range in {value:?}"));
        }
        Ok(IpNet { addr, prefix })
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|err| err.to_string())
    }
}

/// Parses `90s`, `15m`, `12h`, `1d` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, unit) = value.split_at(
        value
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(value.len()),
    );
    let amount = digits
        .parse::<u64>()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    let secs = match unit.trim() {
        "" | "s" => amount,
        "ms" => return Ok(Duration::from_millis(amount)),
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    Ok(Duration::from_secs(secs))
}

mod duration {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<std::time::Duration, D::Error> {
        parse_duration(&String::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}

mod opt_duration {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<std::time::Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(value) => parse_duration(&value)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pool_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u64 {
    8192
}

fn default_max_per_ip() -> u64 {
    64
}

fn default_s3_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_prelookup_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_positive_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_negative_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_size() -> usize {
    10000
}

fn default_window_size() -> usize {
    20
}

fn default_breaker_cooldown() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_matching() {
        let net: IpNet = "10.0.0.0/8".parse().unwrap();
        assert!(net.matches(&"10.200.1.1".parse().unwrap()));
        assert!(!net.matches(&"11.0.0.1".parse().unwrap()));

        let single: IpNet = "192.168.1.5".parse().unwrap();
        assert!(single.matches(&"192.168.1.5".parse().unwrap()));
        assert!(!single.matches(&"192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30").unwrap().as_secs(), 30);
        assert_eq!(parse_duration("29m").unwrap().as_secs(), 29 * 60);
        assert_eq!(parse_duration("500ms").unwrap().as_millis(), 500);
        assert!(parse_duration("10y").is_err());
    }

    #[test]
    fn minimal_config() {
        let config = Config::parse(
            r#"
            [database]
            host = "localhost"
            database = "sora"
            user = "sora"
            password = "secret"

            [s3]
            region = "us-east-1"
            bucket = "sora-mail"
            access_key = "ak"
            secret_key = "sk"

            [[listener]]
            id = "imap"
            protocol = "imap"
            bind = ["127.0.0.1:1143"]
            proxy_networks = ["127.0.0.0/8"]
            max_per_ip = 16
            trusted_networks = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();

        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.imap.timeout_idle.as_secs(), 29 * 60);
        assert!(config.listeners[0].proxy_networks[0].matches(&"127.0.0.1".parse().unwrap()));
        assert_eq!(config.listeners[0].max_per_ip, 16);
        assert!(config.listeners[0].trusted_networks[0].matches(&"10.20.0.1".parse().unwrap()));
    }
}
