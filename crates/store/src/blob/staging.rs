/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use crate::{Error, Result};

use super::cache_path;

/// On-disk staging for message bodies whose S3 upload has not completed.
/// A staged file is the only source of those bytes, so writes go through a
/// temp file and rename; files are removed only after the upload succeeds.
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub async fn open(root: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Staging { root })
    }

    pub async fn write(&self, hash: &str, data: &[u8]) -> Result<()> {
        let path = cache_path(&self.root, hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::internal(format!("Failed to create staging dir: {err}")))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|err| Error::internal(format!("Failed to write staging file: {err}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| Error::internal(format!("Failed to commit staging file: {err}")))?;
        Ok(())
    }

    pub async fn read(&self, hash: &str) -> Option<Vec<u8>> {
        tokio::fs::read(cache_path(&self.root, hash)).await.ok()
    }

    pub async fn remove(&self, hash: &str) {
        let _ = tokio::fs::remove_file(cache_path(&self.root, hash)).await;
    }

    pub async fn contains(&self, hash: &str) -> bool {
        tokio::fs::try_exists(cache_path(&self.root, hash))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_remove() {
        let root = std::env::temp_dir().join(format!("sora-staging-test-{}", std::process::id()));
        let staging = Staging::open(root).await.unwrap();

        staging.write("ffee0011", b"raw message").await.unwrap();
        assert!(staging.contains("ffee0011").await);
        assert_eq!(staging.read("ffee0011").await.unwrap(), b"raw message");

        staging.remove("ffee0011").await;
        assert!(!staging.contains("ffee0011").await);
        assert!(staging.read("ffee0011").await.is_none());
    }
}
