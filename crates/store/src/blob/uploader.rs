/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::watch;

use crate::{blob::ContentStore, Store};

/// Process-wide upload worker: claims due `pending_uploads` rows, streams the
/// staged bytes to S3, then finalizes the metadata in one transaction.
pub struct Uploader {
    pub store: Store,
    pub content: Arc<ContentStore>,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub interval: Duration,
    pub attempt_timeout: Duration,
    pub stats: Arc<UploaderStats>,
}

#[derive(Default)]
pub struct UploaderStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

fn backoff(attempts: i32) -> Duration {
    let minutes = 1u64 << attempts.clamp(0, 6) as u64;
    Duration::from_secs(minutes * 60)
}

impl Uploader {
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        self.run_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!(context = "uploader", event = "shutdown",
                            "Uploader shutting down.");
                        break;
                    }
                }
            }
        });
    }

    pub async fn run_once(&self) {
        let batch = match self
            .store
            .pg()
            .claim_pending_uploads(self.max_attempts, self.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(context = "uploader", event = "error", reason = %err,
                    "Failed to claim pending uploads.");
                return;
            }
        };

        for upload in batch {
            match tokio::time::timeout(self.attempt_timeout, self.process(&upload.content_hash))
                .await
            {
                Ok(Ok(())) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        context = "uploader",
                        event = "uploaded",
                        content_hash = upload.content_hash,
                        size = upload.size,
                        "Content uploaded."
                    );
                }
                Ok(Err(err)) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        context = "uploader",
                        event = "error",
                        content_hash = upload.content_hash,
                        attempts = upload.attempts + 1,
                        reason = %err,
                        "Upload attempt failed."
                    );
                    let _ = self
                        .store
                        .pg()
                        .fail_upload(upload.id, backoff(upload.attempts + 1))
                        .await;
                }
                Err(_) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        context = "uploader",
                        event = "timeout",
                        content_hash = upload.content_hash,
                        "Upload attempt timed out."
                    );
                    let _ = self
                        .store
                        .pg()
                        .fail_upload(upload.id, backoff(upload.attempts + 1))
                        .await;
                }
            }
        }
    }

    async fn process(&self, content_hash: &str) -> crate::Result<()> {
        match self.content.staging.read(content_hash).await {
            Some(data) => {
                self.content.put(content_hash, &data).await?;
                self.store.complete_upload(content_hash).await?;
                // The bytes are durable in S3; staging can let go of them.
                self.content.staging.remove(content_hash).await;
                self.content.cache.put(content_hash, &data).await;
                Ok(())
            }
            None => {
                // Another instance may have finished this hash already.
                if self.content.exists(content_hash).await? {
                    self.store.complete_upload(content_hash).await
                } else {
                    Err(crate::Error::internal(
                        "Staged content missing and object absent from store",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::backoff;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0).as_secs(), 60);
        assert_eq!(backoff(1).as_secs(), 120);
        assert_eq!(backoff(3).as_secs(), 480);
        assert_eq!(backoff(6), backoff(12));
    }
}
