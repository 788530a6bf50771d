use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::paths::Layout;
use crate::error::{IoContext, PlanetError, Result};
use crate::model::{sort_owned, Draft, FollowedArticle, FollowedSite, OwnedArticle, OwnedSite};

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

/// Write `bytes` next to `path` and rename over it, so readers never see a
/// half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.at(parent)?;
    }
    let tmp = temp_path(path);
    if let Err(err) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(PlanetError::persistence(&tmp, err));
    }
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(PlanetError::persistence(path, err));
    }
    Ok(())
}

pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).await.at(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write `bytes` only when the file at `path` does not already hold exactly
/// them. Returns whether a write happened.
pub async fn write_if_changed(path: &Path, bytes: &[u8]) -> Result<bool> {
    match fs::read(path).await {
        Ok(existing) if existing == bytes => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(PlanetError::persistence(path, err)),
    }
    write_atomic(path, bytes).await?;
    Ok(true)
}

pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PlanetError::persistence(path, err)),
    }
}

pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PlanetError::persistence(path, err)),
    }
}

/// Recursively copy `from` into `to`, creating `to` as needed.
pub async fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = stack.pop() {
        fs::create_dir_all(&dst).await.at(&dst)?;
        let mut entries = fs::read_dir(&src).await.at(&src)?;
        while let Some(entry) = entries.next_entry().await.at(&src)? {
            let kind = entry.file_type().await.at(entry.path())?;
            let target = dst.join(entry.file_name());
            if kind.is_dir() {
                stack.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await.at(&target)?;
            }
        }
    }
    Ok(())
}

/// Subdirectories of `root` whose names parse as UUIDs.
pub async fn list_ids(root: &Path) -> Result<Vec<Uuid>> {
    let mut ids = Vec::new();
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(err) => return Err(PlanetError::persistence(root, err)),
    };
    while let Some(entry) = entries.next_entry().await.at(root)? {
        if !entry.file_type().await.at(entry.path())?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

/// Parse every `*.json` directly under `dir`. Unreadable records are logged
/// and skipped so one corrupt article does not hide the rest of the site.
async fn load_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(err) => return Err(PlanetError::persistence(dir, err)),
    };
    while let Some(entry) = entries.next_entry().await.at(dir)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json::<T>(&path).await {
            Ok(record) => records.push(record),
            Err(err) => warn!(?err, path = %path.display(), "skipping unreadable article"),
        }
    }
    Ok(records)
}

pub async fn load_owned_site(layout: &Layout, id: Uuid) -> Result<(OwnedSite, Vec<OwnedArticle>)> {
    let site: OwnedSite = read_json(&layout.owned_info(id)).await?;
    let mut articles: Vec<OwnedArticle> = load_records(&layout.owned_articles_dir(id)).await?;
    for article in &mut articles {
        article.site_id = id;
    }
    sort_owned(&mut articles);
    Ok((site, articles))
}

pub async fn save_owned_site(layout: &Layout, site: &OwnedSite) -> Result<()> {
    write_json(&layout.owned_info(site.id()), site).await
}

pub async fn save_owned_article(layout: &Layout, article: &OwnedArticle) -> Result<()> {
    write_json(&layout.owned_article(article.site_id, article.id()), article).await
}

pub async fn delete_owned_article(layout: &Layout, site: Uuid, article: Uuid) -> Result<()> {
    remove_file_if_exists(&layout.owned_article(site, article)).await
}

pub async fn load_followed_site(
    layout: &Layout,
    id: Uuid,
) -> Result<(FollowedSite, Vec<FollowedArticle>)> {
    let site: FollowedSite = read_json(&layout.followed_info(id)).await?;
    let mut articles: Vec<FollowedArticle> =
        load_records(&layout.followed_articles_dir(id)).await?;
    for article in &mut articles {
        article.site_id = id;
    }
    articles.sort_by(|a, b| b.core.created.cmp(&a.core.created));
    Ok((site, articles))
}

pub async fn save_followed_site(layout: &Layout, site: &FollowedSite) -> Result<()> {
    write_json(&layout.followed_info(site.id()), site).await
}

pub async fn save_followed_article(layout: &Layout, article: &FollowedArticle) -> Result<()> {
    write_json(&layout.followed_article(article.site_id, article.id()), article).await
}

pub async fn delete_followed_article(layout: &Layout, site: Uuid, article: Uuid) -> Result<()> {
    remove_file_if_exists(&layout.followed_article(site, article)).await
}

pub async fn load_drafts(layout: &Layout, site: Uuid) -> Result<Vec<Draft>> {
    let mut drafts = Vec::new();
    for id in list_ids(&layout.drafts_dir(site)).await? {
        match read_json::<Draft>(&layout.draft_info(site, id)).await {
            Ok(draft) => drafts.push(draft),
            Err(err) => warn!(?err, draft = %id, "skipping unreadable draft"),
        }
    }
    Ok(drafts)
}

pub async fn save_draft(layout: &Layout, draft: &Draft) -> Result<()> {
    write_json(&layout.draft_info(draft.site_id, draft.id), draft).await
}

pub async fn delete_draft(layout: &Layout, site: Uuid, draft: Uuid) -> Result<()> {
    remove_dir_if_exists(&layout.draft_dir(site, draft)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SiteCore;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn owned_site() -> OwnedSite {
        OwnedSite {
            core: SiteCore::new("Mine", "about"),
            publish_key: "k51key".into(),
            updated: Utc::now(),
            template_id: "plain".into(),
            last_published_at: None,
            last_published_cid: None,
            aggregation_sources: Vec::new(),
            reuse_original_id: false,
            tag_index: BTreeMap::new(),
            archived: false,
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_temp_files() {
        let td = tempdir().unwrap();
        let path = td.path().join("nested").join("file.json");
        write_json(&path, &vec![1, 2, 3]).await.unwrap();
        let back: Vec<i32> = read_json(&path).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn write_if_changed_skips_identical_bytes() {
        let td = tempdir().unwrap();
        let path = td.path().join("a.bin");
        assert!(write_if_changed(&path, b"hello").await.unwrap());
        assert!(!write_if_changed(&path, b"hello").await.unwrap());
        assert!(write_if_changed(&path, b"world").await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"world");
    }

    #[tokio::test]
    async fn owned_site_round_trip_sorts_articles() {
        let td = tempdir().unwrap();
        let layout = Layout::new(td.path());
        let site = owned_site();
        save_owned_site(&layout, &site).await.unwrap();
        let mut older = OwnedArticle::new(site.id(), "older", "");
        older.core.created = Utc::now() - chrono::Duration::hours(1);
        let newer = OwnedArticle::new(site.id(), "newer", "");
        save_owned_article(&layout, &older).await.unwrap();
        save_owned_article(&layout, &newer).await.unwrap();
        std::fs::write(layout.owned_articles_dir(site.id()).join("junk.json"), "{").unwrap();

        let (loaded, articles) = load_owned_site(&layout, site.id()).await.unwrap();
        assert_eq!(loaded, site);
        let titles: Vec<_> = articles.iter().map(|a| a.core.title.as_str()).collect();
        assert_eq!(titles, vec!["newer", "older"]);
    }

    #[tokio::test]
    async fn list_ids_ignores_non_uuid_entries() {
        let td = tempdir().unwrap();
        let id = Uuid::new_v4();
        std::fs::create_dir_all(td.path().join(super::super::paths::id_dir(id))).unwrap();
        std::fs::create_dir_all(td.path().join("scratch")).unwrap();
        std::fs::write(td.path().join("notes.txt"), "x").unwrap();
        assert_eq!(list_ids(td.path()).await.unwrap(), vec![id]);
        assert!(list_ids(&td.path().join("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_dir_copies_nested_files() {
        let td = tempdir().unwrap();
        let src = td.path().join("src");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("top.txt"), "1").unwrap();
        std::fs::write(src.join("a/b/deep.txt"), "2").unwrap();
        let dst = td.path().join("dst");
        copy_dir(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("a/b/deep.txt")).unwrap(), "2");
        assert_eq!(std::fs::read_to_string(dst.join("top.txt")).unwrap(), "1");
    }
}
