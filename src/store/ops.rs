//! Markers for derived outputs that were already produced from a given input.
//!
//! A marker is keyed by `{article}:{kind}` and stores the fingerprint of the
//! inputs it was produced from. A step is skipped while the fingerprint is
//! unchanged and its output still exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use super::repo::{exists, write_json};
use crate::error::{PlanetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    CoverImage,
    HeroImage,
    GridImage,
    VideoThumbnail,
    NftMetadata,
    ArticleHtml,
    SlugMirror,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::CoverImage => "cover",
            OpKind::HeroImage => "hero",
            OpKind::GridImage => "grid",
            OpKind::VideoThumbnail => "video_thumbnail",
            OpKind::NftMetadata => "nft",
            OpKind::ArticleHtml => "html",
            OpKind::SlugMirror => "slug",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpRecord {
    pub fingerprint: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpsCache {
    entries: BTreeMap<String, OpRecord>,
    dirty: bool,
}

fn key(article: Uuid, kind: OpKind) -> String {
    format!("{}:{}", article.to_string().to_uppercase(), kind.as_str())
}

/// Hex sha256 over the given parts, each length-prefixed.
pub fn fingerprint<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

impl OpsCache {
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Self {
                entries: serde_json::from_slice(&bytes)?,
                dirty: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(PlanetError::persistence(path, err)),
        }
    }

    /// Persist when anything changed since the last load or save.
    pub async fn flush(&mut self, path: &Path) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        write_json(path, &self.entries).await?;
        self.dirty = false;
        Ok(())
    }

    pub fn matches(&self, article: Uuid, kind: OpKind, fingerprint: &str) -> bool {
        self.entries
            .get(&key(article, kind))
            .is_some_and(|record| record.fingerprint == fingerprint)
    }

    /// Marker matches and the produced output is still on disk.
    pub async fn is_done(
        &self,
        article: Uuid,
        kind: OpKind,
        fingerprint: &str,
        output: &Path,
    ) -> bool {
        self.matches(article, kind, fingerprint) && exists(output).await
    }

    pub fn mark(&mut self, article: Uuid, kind: OpKind, fingerprint: String) {
        self.entries.insert(
            key(article, kind),
            OpRecord {
                fingerprint,
                at: Utc::now(),
            },
        );
        self.dirty = true;
    }

    pub fn forget(&mut self, article: Uuid, kind: OpKind) {
        if self.entries.remove(&key(article, kind)).is_some() {
            self.dirty = true;
        }
    }

    pub fn forget_article(&mut self, article: Uuid) {
        let prefix = format!("{}:", article.to_string().to_uppercase());
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_separates_parts() {
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
        assert_eq!(fingerprint(["x"]), fingerprint(vec!["x".to_string()]));
    }

    #[tokio::test]
    async fn markers_survive_reload_and_require_output() {
        let td = tempdir().unwrap();
        let path = td.path().join("ops.json");
        let output = td.path().join("_grid.png");
        let article = Uuid::new_v4();

        let mut cache = OpsCache::load(&path).await.unwrap();
        assert!(cache.is_empty());
        cache.mark(article, OpKind::GridImage, "f1".into());
        cache.flush(&path).await.unwrap();

        let cache = OpsCache::load(&path).await.unwrap();
        assert!(cache.matches(article, OpKind::GridImage, "f1"));
        assert!(!cache.matches(article, OpKind::GridImage, "f2"));
        assert!(!cache.matches(article, OpKind::HeroImage, "f1"));
        assert!(!cache.is_done(article, OpKind::GridImage, "f1", &output).await);
        std::fs::write(&output, b"png").unwrap();
        assert!(cache.is_done(article, OpKind::GridImage, "f1", &output).await);
    }

    #[test]
    fn forget_article_drops_only_that_article() {
        let mut cache = OpsCache::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.mark(a, OpKind::CoverImage, "1".into());
        cache.mark(a, OpKind::NftMetadata, "2".into());
        cache.mark(b, OpKind::CoverImage, "3".into());
        cache.forget(b, OpKind::HeroImage);
        assert_eq!(cache.len(), 3);
        cache.forget_article(a);
        assert_eq!(cache.len(), 1);
        assert!(cache.matches(b, OpKind::CoverImage, "3"));
    }
}
