/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{path::Path, time::Duration};

use s3::{creds::Credentials, Bucket, Region};

use crate::{Error, Result};

pub mod cache;
pub mod purge;
pub mod staging;
pub mod uploader;

pub use cache::{CacheStats, DiskCache};
pub use staging::Staging;

/// Content-addressed store: deduplicated bodies in S3 fronted by a local
/// disk cache, with a staging area holding bytes whose upload is pending.
pub struct ContentStore {
    bucket: Box<Bucket>,
    pub cache: DiskCache,
    pub staging: Staging,
}

pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub timeout: Duration,
}

/// Object key layout: `<first-2-hex>/<next-2-hex>/<full-hash>`.
pub fn object_key(hash: &str) -> String {
    if hash.len() >= 4 {
        format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash)
    } else {
        hash.to_string()
    }
}

/// BLAKE3 over the canonical raw bytes, lower-case hex.
pub fn content_hash(raw: &[u8]) -> String {
    blake3::hash(raw).to_hex().to_string()
}

impl ContentStore {
    pub fn open(
        s3: S3Settings,
        cache: DiskCache,
        staging: Staging,
    ) -> Result<Self> {
        let region = match s3.endpoint {
            Some(endpoint) => Region::Custom {
                region: s3.region,
                endpoint,
            },
            None => s3
                .region
                .parse()
                .map_err(|err| Error::internal(format!("Invalid S3 region: {err}")))?,
        };
        let credentials = Credentials::new(
            Some(&s3.access_key),
            Some(&s3.secret_key),
            None,
            None,
            None,
        )
        .map_err(|err| Error::internal(format!("Invalid S3 credentials: {err}")))?;
        let bucket = Bucket::new(&s3.bucket, region, credentials)
            .map_err(|err| Error::internal(format!("Failed to open S3 bucket: {err}")))?
            .with_path_style();

        Ok(ContentStore {
            bucket: bucket.with_request_timeout(s3.timeout).map_err(|err| {
                Error::internal(format!("Failed to set S3 request timeout: {err}"))
            })?,
            cache,
            staging,
        })
    }

    pub async fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        let response = self
            .bucket
            .put_object(object_key(hash), data)
            .await
            .map_err(|err| Error::transient(format!("S3 put failed: {err}")))?;
        match response.status_code() {
            200..=299 => Ok(()),
            code if code >= 500 => Err(Error::transient(format!("S3 put returned {code}"))),
            code => Err(Error::internal(format!("S3 put returned {code}"))),
        }
    }

    /// Resolves content bytes: staging (not yet uploaded), then disk cache,
    /// then S3 with a cache fill on the way out.
    pub async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        if let Some(data) = self.staging.read(hash).await {
            return Ok(data);
        }
        if let Some(data) = self.cache.get(hash).await {
            return Ok(data);
        }

        let response = self
            .bucket
            .get_object(object_key(hash))
            .await
            .map_err(|err| Error::transient(format!("S3 get failed: {err}")))?;
        match response.status_code() {
            200..=299 => {
                let data = response.to_vec();
                self.cache.put(hash, &data).await;
                Ok(data)
            }
            404 => Err(Error::not_found("Message content unavailable")),
            code if code >= 500 => Err(Error::transient(format!("S3 get returned {code}"))),
            code => Err(Error::internal(format!("S3 get returned {code}"))),
        }
    }

    pub async fn exists(&self, hash: &str) -> Result<bool> {
        match self.bucket.head_object(object_key(hash)).await {
            Ok((_, 200)) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, code)) if code >= 500 => {
                Err(Error::transient(format!("S3 head returned {code}")))
            }
            Ok((_, code)) => Err(Error::internal(format!("S3 head returned {code}"))),
            Err(err) => Err(Error::transient(format!("S3 head failed: {err}"))),
        }
    }

    pub async fn delete(&self, hash: &str) -> Result<()> {
        self.bucket
            .delete_object(object_key(hash))
            .await
            .map_err(|err| Error::transient(format!("S3 delete failed: {err}")))?;
        self.cache.remove(hash).await;
        Ok(())
    }

    /// Pre-fetches a set of hashes into the disk cache.
    pub async fn warmup(&self, hashes: &[String]) {
        for hash in hashes {
            if self.cache.contains(hash) {
                continue;
            }
            if let Ok(response) = self.bucket.get_object(object_key(hash)).await {
                if (200..300).contains(&response.status_code()) {
                    self.cache.put(hash, response.as_slice()).await;
                }
            }
        }
    }
}

pub(crate) fn cache_path(root: &Path, hash: &str) -> std::path::PathBuf {
    let mut path = root.to_path_buf();
    if hash.len() >= 4 {
        path.push(&hash[0..2]);
        path.push(&hash[2..4]);
    }
    path.push(hash);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let hash = content_hash(b"hello world");
        let key = object_key(&hash);
        assert_eq!(&key[2..3], "/");
        assert_eq!(&key[5..6], "/");
        assert!(key.ends_with(&hash));
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc").len(), 64);
    }
}
