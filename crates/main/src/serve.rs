/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{
    config::ListenerKind,
    listener::TcpAcceptor,
    ServerProtocol, SharedCore,
};
use imap::ImapSessionManager;
use lmtp::LmtpSessionManager;
use managesieve::ManageSieveSessionManager;
use pop3::Pop3SessionManager;
use proxy::{
    imap::ImapProxyManager, lmtp::LmtpProxyManager, pop3::Pop3ProxyManager,
    sieve::SieveProxyManager, ProxyCore,
};
use store::blob::{purge::ContentSweeper, uploader::Uploader};
use tokio::sync::watch;

use crate::admin::CommandError;

pub async fn serve(core: SharedCore) -> Result<(), CommandError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_core = ProxyCore::new(core.clone());

    // Listeners, one spawn per configured bind address.
    for listener in core.config.listeners.clone() {
        let acceptor = match (&core.config.tls, listener.tls_implicit) {
            (Some(tls), implicit) => tls
                .build_acceptor(implicit)
                .map_err(CommandError::Server)?,
            (None, true) => {
                return Err(CommandError::User(format!(
                    "Listener {} requires TLS but no certificate is configured",
                    listener.id
                )));
            }
            (None, false) => TcpAcceptor::Plain,
        };

        match (listener.kind, listener.protocol) {
            (ListenerKind::Backend, ServerProtocol::Imap) => listener.spawn(
                ImapSessionManager::new(core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
            (ListenerKind::Backend, ServerProtocol::Pop3) => listener.spawn(
                Pop3SessionManager::new(core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
            (ListenerKind::Backend, ServerProtocol::Lmtp) => listener.spawn(
                LmtpSessionManager::new(core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
            (ListenerKind::Backend, ServerProtocol::ManageSieve) => listener.spawn(
                ManageSieveSessionManager::new(core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
            (ListenerKind::Proxy, ServerProtocol::Imap) => listener.spawn(
                ImapProxyManager::new(proxy_core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
            (ListenerKind::Proxy, ServerProtocol::Pop3) => listener.spawn(
                Pop3ProxyManager::new(proxy_core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
            (ListenerKind::Proxy, ServerProtocol::Lmtp) => listener.spawn(
                LmtpProxyManager::new(proxy_core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
            (ListenerKind::Proxy, ServerProtocol::ManageSieve) => listener.spawn(
                SieveProxyManager::new(proxy_core.clone()),
                acceptor,
                shutdown_rx.clone(),
            ),
        }
    }

    // The process-wide upload worker.
    Uploader {
        store: core.store.clone(),
        content: core.blob.clone(),
        batch_size: core.config.uploader.batch_size,
        max_attempts: core.config.uploader.max_attempts,
        interval: core.config.uploader.interval,
        attempt_timeout: core.config.uploader.attempt_timeout,
        stats: Default::default(),
    }
    .spawn(shutdown_rx.clone());

    spawn_maintenance(core.clone(), proxy_core.clone(), shutdown_rx.clone());
    spawn_cache_warmup(core.clone());

    tracing::info!(
        listeners = core.config.listeners.len(),
        "Sora is running; press Ctrl+C to stop."
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| CommandError::Server(format!("Failed to wait for shutdown: {err}")))?;

    tracing::info!("Shutting down.");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    Ok(())
}

/// Periodic background work: cache eviction, limiter and affinity cleanup,
/// stale connection pruning, expunged-message purge, the content sweeper and
/// a health heartbeat.
fn spawn_maintenance(
    core: SharedCore,
    proxy_core: proxy::SharedProxy,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let sweeper = ContentSweeper {
            store: core.store.clone(),
            content: core.blob.clone(),
            batch_size: 500,
        };
        let hostname = core
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let mut interval = tokio::time::interval(core.config.cache.eviction_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    core.blob.cache.evict().await;
                    core.auth.cleanup();
                    core.affinity.cleanup();
                    core.events.cleanup();
                    if let Some(prelookup) = &proxy_core.prelookup {
                        prelookup.cleanup();
                    }
                    let _ = core
                        .store
                        .pg()
                        .prune_stale_connections(chrono::Duration::days(1))
                        .await;
                    let _ = core
                        .store
                        .pg()
                        .purge_expunged(chrono::Duration::days(7))
                        .await;
                    sweeper.run_once().await;

                    let snapshot = core.metrics.snapshot();
                    let _ = core
                        .store
                        .write_health_status(
                            "server",
                            &hostname,
                            if core.store.is_available() { "healthy" } else { "degraded" },
                            serde_json::to_value(&snapshot).unwrap_or_default(),
                        )
                        .await;
                    tracing::debug!(
                        context = "maintenance",
                        connections = core.tracker.snapshot().total,
                        cache_objects = core.blob.cache.stats().objects,
                        "Maintenance pass complete."
                    );
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });
}

/// Pre-fetches recently delivered content for active accounts into the disk
/// cache on startup.
fn spawn_cache_warmup(core: SharedCore) {
    tokio::spawn(async move {
        let per_account = core.config.cache.warmup_per_account;
        if per_account == 0 {
            return;
        }
        let Ok(accounts) = core.store.pg().active_account_ids().await else {
            return;
        };
        let mut warmed = 0;
        for account_id in accounts {
            if let Ok(hashes) = core
                .store
                .pg()
                .recent_content_hashes(account_id, per_account as i64)
                .await
            {
                warmed += hashes.len();
                core.blob.warmup(&hashes).await;
            }
        }
        if warmed > 0 {
            tracing::info!(context = "cache", event = "warmup", objects = warmed,
                "Cache warmup complete.");
        }
    });
}
