/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use store::{blob::ContentStore, Store};

pub mod affinity;
pub mod auth;
pub mod config;
pub mod event;
pub mod ingest;
pub mod listener;
pub mod metrics;
pub mod tracker;

pub static SERVER_NAME: &str = concat!("Sora v", env!("CARGO_PKG_VERSION"));

/// Shared state handed to every protocol server and proxy in the process.
pub struct Core {
    pub config: config::Config,
    pub store: Store,
    pub blob: Arc<ContentStore>,
    pub tracker: tracker::ConnectionTracker,
    pub auth: auth::limiter::AuthLimiter,
    pub affinity: affinity::AffinityCache,
    pub events: event::MailboxBus,
    pub metrics: metrics::Metrics,
}

pub type SharedCore = Arc<Core>;

impl Core {
    pub fn new(config: config::Config, store: Store, blob: ContentStore) -> Self {
        let auth = auth::limiter::AuthLimiter::new(&config.auth);
        let affinity = affinity::AffinityCache::new(config.proxy.affinity_ttl);

        Core {
            config,
            store,
            blob: Arc::new(blob),
            tracker: tracker::ConnectionTracker::default(),
            auth,
            affinity,
            events: event::MailboxBus::default(),
            metrics: metrics::Metrics::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    Imap,
    Pop3,
    Lmtp,
    ManageSieve,
}

impl ServerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerProtocol::Imap => "imap",
            ServerProtocol::Pop3 => "pop3",
            ServerProtocol::Lmtp => "lmtp",
            ServerProtocol::ManageSieve => "managesieve",
        }
    }
}

impl std::fmt::Display for ServerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
