/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use ahash::AHashMap;
use parking_lot::Mutex;

use super::cache_path;

/// Local LRU disk cache for message content. The index is guarded by a single
/// mutex; file I/O happens outside it. Objects above the per-object threshold
/// bypass the cache entirely.
pub struct DiskCache {
    root: PathBuf,
    max_total_bytes: u64,
    max_object_bytes: u64,
    index: Mutex<AHashMap<String, Entry>>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    last_access: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub objects: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl DiskCache {
    /// Opens the cache, rebuilding the index from the files already on disk.
    pub async fn open(
        root: PathBuf,
        max_total_bytes: u64,
        max_object_bytes: u64,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        let cache = DiskCache {
            root,
            max_total_bytes,
            max_object_bytes,
            index: Mutex::new(AHashMap::new()),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
        cache.rebuild_index().await?;
        Ok(cache)
    }

    async fn rebuild_index(&self) -> std::io::Result<()> {
        let mut stack = vec![self.root.clone()];
        let mut total = 0;
        let mut entries = AHashMap::new();
        while let Some(dir) = stack.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    stack.push(entry.path());
                } else if let Some(name) = entry.file_name().to_str() {
                    let accessed = metadata
                        .accessed()
                        .ok()
                        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                        .map(|at| at.as_micros() as u64)
                        .unwrap_or_else(now_micros);
                    total += metadata.len();
                    entries.insert(
                        name.to_string(),
                        Entry {
                            size: metadata.len(),
                            last_access: accessed,
                        },
                    );
                }
            }
        }
        self.total_bytes.store(total, Ordering::Relaxed);
        *self.index.lock() = entries;
        Ok(())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.index.lock().contains_key(hash)
    }

    pub async fn get(&self, hash: &str) -> Option<Vec<u8>> {
        let known = {
            let mut index = self.index.lock();
            match index.get_mut(hash) {
                Some(entry) => {
                    entry.last_access = now_micros();
                    true
                }
                None => false,
            }
        };
        if !known {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match tokio::fs::read(cache_path(&self.root, hash)).await {
            Ok(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            Err(_) => {
                // Index drifted from disk; drop the stale entry.
                if let Some(entry) = self.index.lock().remove(hash) {
                    self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(&self, hash: &str, data: &[u8]) {
        if data.len() as u64 > self.max_object_bytes || self.contains(hash) {
            return;
        }
        let path = cache_path(&self.root, hash);
        if let Some(parent) = path.parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                return;
            }
        }
        if tokio::fs::write(&path, data).await.is_err() {
            return;
        }
        self.index.lock().insert(
            hash.to_string(),
            Entry {
                size: data.len() as u64,
                last_access: now_micros(),
            },
        );
        self.total_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    pub async fn remove(&self, hash: &str) {
        if let Some(entry) = self.index.lock().remove(hash) {
            self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        }
        let _ = tokio::fs::remove_file(cache_path(&self.root, hash)).await;
    }

    /// Deletes least-recently-used files until the cache is under its total
    /// budget.
    pub async fn evict(&self) -> u64 {
        let mut evicted = 0;
        while self.total_bytes.load(Ordering::Relaxed) > self.max_total_bytes {
            let victim = {
                let index = self.index.lock();
                index
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_access)
                    .map(|(hash, _)| hash.clone())
            };
            match victim {
                Some(hash) => {
                    self.remove(&hash).await;
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            tracing::debug!(
                context = "cache",
                event = "evict",
                evicted = evicted,
                total_bytes = self.total_bytes.load(Ordering::Relaxed),
                "Evicted cache objects."
            );
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            objects: self.index.lock().len(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drops every cached object (admin purge).
    pub async fn purge(&self) {
        let hashes: Vec<String> = self.index.lock().keys().cloned().collect();
        for hash in hashes {
            self.remove(&hash).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache(max_total: u64, max_object: u64) -> DiskCache {
        let dir = std::env::temp_dir().join(format!(
            "sora-cache-test-{}-{}",
            std::process::id(),
            now_micros()
        ));
        DiskCache::open(dir, max_total, max_object).await.unwrap()
    }

    #[tokio::test]
    async fn put_get_remove() {
        let cache = cache(1024, 128).await;
        cache.put("aabbccdd", b"hello").await;
        assert_eq!(cache.get("aabbccdd").await.unwrap(), b"hello");
        assert_eq!(cache.stats().hits, 1);

        cache.remove("aabbccdd").await;
        assert!(cache.get("aabbccdd").await.is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn oversized_objects_bypass() {
        let cache = cache(1024, 4).await;
        cache.put("aabbccdd", b"too large").await;
        assert!(!cache.contains("aabbccdd"));
    }

    #[tokio::test]
    async fn eviction_is_lru() {
        let cache = cache(10, 64).await;
        cache.put("aaaa0001", b"12345").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("bbbb0002", b"12345").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Touch the older entry so the newer one becomes the LRU victim.
        cache.get("aaaa0001").await.unwrap();
        cache.put("cccc0003", b"12345").await;
        cache.evict().await;

        assert!(cache.stats().total_bytes <= 10);
        assert!(cache.contains("aaaa0001"));
        assert!(!cache.contains("bbbb0002"));
    }
}
