/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use crate::{blob::ContentStore, Store};

/// Background sweeper for shared content. A hash is deleted only when no
/// live or expunged message references it and no pending upload does either;
/// this check runs here rather than through reference counters that can
/// drift.
pub struct ContentSweeper {
    pub store: Store,
    pub content: Arc<ContentStore>,
    pub batch_size: i64,
}

impl ContentSweeper {
    pub async fn run_once(&self) -> u64 {
        let orphans = match self.store.pg().orphaned_content_hashes(self.batch_size).await {
            Ok(orphans) => orphans,
            Err(err) => {
                tracing::warn!(context = "sweeper", event = "error", reason = %err,
                    "Failed to list orphaned content.");
                return 0;
            }
        };

        let mut removed = 0;
        for hash in orphans {
            if let Err(err) = self.content.delete(&hash).await {
                tracing::warn!(context = "sweeper", event = "error",
                    content_hash = hash, reason = %err,
                    "Failed to delete orphaned object.");
                continue;
            }
            if let Err(err) = self.store.pg().delete_content(&hash).await {
                tracing::warn!(context = "sweeper", event = "error",
                    content_hash = hash, reason = %err,
                    "Failed to delete content row.");
                continue;
            }
            self.content.staging.remove(&hash).await;
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(context = "sweeper", event = "purged", removed = removed,
                "Removed orphaned content.");
        }
        removed
    }
}
