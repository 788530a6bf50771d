//! Owned sites: article store, public artifact rebuild and publishing.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::Services;
use crate::error::{IoContext, PlanetError, Result};
use crate::guard::SiteGuard;
use crate::model::{
    consolidate_tags, is_audio, is_video, mime_type, sort_owned, ArticleCore, Draft, OwnedArticle,
    OwnedSite, SiteCore, COVER_IMAGE, GRID_PNG, VIDEO_THUMBNAIL,
};
use crate::render::{summarize, TemplateInfo};
use crate::store::ops::fingerprint;
use crate::store::paths::id_dir;
use crate::store::{self, Layout, OpKind, OpsCache};
use crate::syndication::{has_audio, render_feed, FeedKind};
use crate::wire::{BackupManifest, NftAttribute, NftMetadata, PublicArticle, PublicSite};

const GRID_SIZE: u32 = 512;
const HERO_MIN_WIDTH: u32 = 600;
const HERO_MIN_HEIGHT: u32 = 400;
const NFT_GATEWAY: &str = "https://ipfs.io/ipfs/";

/// Name of the signing key that publishes a site.
pub fn key_name(site: Uuid) -> String {
    id_dir(site)
}

#[derive(Debug, Clone, Default)]
pub struct NewArticle {
    pub title: String,
    pub body: String,
    /// Files copied into the article's public directory.
    pub attachments: Vec<PathBuf>,
    pub tags: BTreeMap<String, String>,
    pub slug: Option<String>,
    pub external_link: Option<String>,
}

/// Field-level edit; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ArticleEdit {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tags: Option<BTreeMap<String, String>>,
    pub slug: Option<Option<String>>,
    pub external_link: Option<Option<String>>,
    /// Replace the attachment set with these files.
    pub attachments: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildReport {
    pub articles: usize,
    /// Articles whose derived outputs failed; the rest of the site was still built.
    pub failures: Vec<(Uuid, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub cid: String,
    pub published_at: DateTime<Utc>,
    pub rebuild: RebuildReport,
}

/// In-memory state of one owned site.
#[derive(Debug)]
pub struct OwnedPlanet {
    pub site: OwnedSite,
    pub articles: Vec<OwnedArticle>,
    pub drafts: Vec<Draft>,
    pub(crate) ops: OpsCache,
}

/// An owned site plus its per-operation guards. Publishing and aggregation
/// use separate guards because aggregation ends by publishing.
#[derive(Debug)]
pub struct OwnedHandle {
    id: Uuid,
    state: Mutex<OwnedPlanet>,
    publishing: SiteGuard,
    pub(crate) aggregating: SiteGuard,
}

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !slug.starts_with('.')
        && Uuid::parse_str(slug).is_err()
        && !slug.ends_with(".html")
        && !slug.ends_with(".xml")
        && slug != "planet.json"
}

/// Tags that would shadow a site-level page get no page of their own.
const RESERVED_TAGS: &[&str] = &["index", "tags", "archive", "archives"];

/// File name of a tag's page, when the tag key is usable as one.
fn tag_page(key: &str) -> Option<String> {
    let usable = !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !RESERVED_TAGS.contains(&key);
    usable.then(|| format!("{key}.html"))
}

fn normalize_slug(slug: Option<String>) -> Result<Option<String>> {
    match slug.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(slug) if !valid_slug(&slug) => Err(PlanetError::InvalidAddress(format!("slug {slug}"))),
        other => Ok(other),
    }
}

/// File name used for a backup bundle.
pub fn sanitize_name(name: &str, fallback: Uuid) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        id_dir(fallback)
    } else {
        cleaned
    }
}

/// Point video/audio roles at the first matching attachment.
pub(crate) fn assign_attachments(core: &mut ArticleCore, names: Vec<String>) {
    core.video_filename = names.iter().find(|n| is_video(n)).cloned();
    core.audio_filename = names.iter().find(|n| is_audio(n)).cloned();
    if let Some(hero) = &core.hero_image_filename {
        if hero != VIDEO_THUMBNAIL && !names.contains(hero) {
            core.hero_image_filename = None;
            core.hero_image_width = None;
            core.hero_image_height = None;
        }
    }
    core.set_attachments(names);
}

/// Attachment names copied into a directory, and which of them got new bytes.
#[derive(Debug, Default)]
struct Copied {
    names: Vec<String>,
    replaced: Vec<String>,
}

/// Copy `files` into `dir`. A target that already holds the same bytes is
/// left alone; one that held different bytes is reported as replaced.
async fn copy_attachments(dir: &Path, files: &[PathBuf]) -> Result<Copied> {
    tokio::fs::create_dir_all(dir).await.at(dir)?;
    let mut copied = Copied::default();
    for file in files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PlanetError::Internal(format!("bad attachment path {}", file.display())))?
            .to_string();
        let target = dir.join(&name);
        if target != *file {
            let existed = store::exists(&target).await;
            let bytes = tokio::fs::read(file).await.at(file)?;
            if store::write_if_changed(&target, &bytes).await? && existed {
                copied.replaced.push(name.clone());
            }
        }
        if !copied.names.contains(&name) {
            copied.names.push(name);
        }
    }
    Ok(copied)
}

/// Fingerprint of an input file's name and contents.
async fn file_fingerprint(name: &str, path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await.at(path)?;
    Ok(fingerprint([name.as_bytes(), bytes.as_slice()]))
}

impl OwnedPlanet {
    fn id(&self) -> Uuid {
        self.site.id()
    }

    fn position(&self, article: Uuid) -> Result<usize> {
        self.articles
            .iter()
            .position(|a| a.id() == article)
            .ok_or_else(|| PlanetError::NotFound(format!("article {article}")))
    }

    /// Re-sort, rebuild the tag index and bump `updated` after a mutation.
    pub(crate) fn touch(&mut self) {
        sort_owned(&mut self.articles);
        self.site.tag_index = consolidate_tags(&self.articles);
        self.site.updated = Utc::now();
    }

    pub(crate) async fn save_all(&mut self, layout: &Layout) -> Result<()> {
        store::save_owned_site(layout, &self.site).await?;
        for article in &self.articles {
            store::save_owned_article(layout, article).await?;
        }
        self.ops.flush(&layout.ops_file(self.id())).await
    }

    async fn compose(&mut self, svc: &Services, new: NewArticle) -> Result<Uuid> {
        let slug = normalize_slug(new.slug)?;
        let site = self.id();
        let mut article = OwnedArticle::new(site, new.title, new.body);
        article.tags = new.tags;
        article.slug = slug;
        article.external_link = new.external_link;

        let dir = svc.layout.public_article_dir(site, article.id());
        let names = match copy_attachments(&dir, &new.attachments).await {
            Ok(copied) => copied.names,
            Err(err) => {
                let _ = store::remove_dir_if_exists(&dir).await;
                return Err(err);
            }
        };
        assign_attachments(&mut article.core, names);
        store::save_owned_article(&svc.layout, &article).await?;

        let id = article.id();
        self.articles.push(article);
        self.touch();
        store::save_owned_site(&svc.layout, &self.site).await?;
        info!(site = %site, article = %id, "article composed");
        Ok(id)
    }

    async fn edit(&mut self, svc: &Services, id: Uuid, edit: ArticleEdit) -> Result<()> {
        let idx = self.position(id)?;
        let site = self.id();
        let mut article = self.articles[idx].clone();
        if let Some(title) = edit.title {
            article.core.title = title;
        }
        if let Some(body) = edit.body {
            article.core.set_body(&body);
        }
        if let Some(tags) = edit.tags {
            article.tags = tags;
        }
        if let Some(external) = edit.external_link {
            article.external_link = external;
        }
        let old_slug = article.slug().map(str::to_string);
        if let Some(slug) = edit.slug {
            article.slug = normalize_slug(slug)?;
        }
        if let Some(files) = edit.attachments {
            let dir = svc.layout.public_article_dir(site, id);
            let copied = copy_attachments(&dir, &files).await?;
            for stale in article.core.attachments.iter().filter(|n| !copied.names.contains(n)) {
                store::remove_file_if_exists(&dir.join(stale)).await?;
            }
            article.core.forget_cids(&copied.replaced);
            if !copied.replaced.is_empty() {
                self.ops.forget(id, OpKind::HeroImage);
            }
            assign_attachments(&mut article.core, copied.names);
        }
        if let Some(old) = old_slug {
            if article.slug() != Some(old.as_str()) {
                store::remove_dir_if_exists(&svc.layout.public_slug_dir(site, &old)).await?;
            }
        }

        store::save_owned_article(&svc.layout, &article).await?;
        self.articles[idx] = article;
        self.touch();
        store::save_owned_site(&svc.layout, &self.site).await
    }

    pub(crate) async fn remove(&mut self, layout: &Layout, id: Uuid) -> Result<()> {
        let idx = self.position(id)?;
        let site = self.id();
        store::delete_owned_article(layout, site, id).await?;
        store::remove_dir_if_exists(&layout.public_article_dir(site, id)).await?;
        if let Some(slug) = self.articles[idx].slug() {
            store::remove_dir_if_exists(&layout.public_slug_dir(site, slug)).await?;
        }
        self.articles.remove(idx);
        self.ops.forget_article(id);
        Ok(())
    }

    /// Regenerate every derived output under `Public/{site}`. Per-article
    /// failures are collected; only a missing template aborts the rebuild.
    pub(crate) async fn rebuild(&mut self, svc: &Services) -> Result<RebuildReport> {
        let template = svc.templates.template(&self.site.template_id)?;
        let site = self.id();
        let public_dir = svc.layout.public_dir(site);
        tokio::fs::create_dir_all(&public_dir).await.at(&public_dir)?;
        let header = PublicSite::from_owned(&self.site, &[]);

        let mut report = RebuildReport {
            articles: self.articles.len(),
            failures: Vec::new(),
        };
        for idx in 0..self.articles.len() {
            let before = self.articles[idx].clone();
            let article = &mut self.articles[idx];
            let id = article.id();
            if let Err(err) = rebuild_article(
                svc,
                &template,
                &header,
                article,
                &mut self.ops,
                &mut report.failures,
            )
            .await
            {
                warn!(?err, site = %site, article = %id, "article rebuild failed");
                report.failures.push((id, err.to_string()));
            }
            if self.articles[idx] != before {
                if let Err(err) = store::save_owned_article(&svc.layout, &self.articles[idx]).await {
                    report.failures.push((id, err.to_string()));
                }
            }
        }

        let manifest = PublicSite::from_owned(&self.site, &self.articles);
        store::write_if_changed(
            &svc.layout.public_manifest(site),
            &serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;
        let index = svc.templates.render_index(&template.name, &manifest)?;
        store::write_if_changed(&svc.layout.public_index(site), index.as_bytes()).await?;
        write_site_pages(svc, &template.name, &manifest).await?;
        self.ops.flush(&svc.layout.ops_file(site)).await?;
        debug!(site = %site, articles = report.articles, failures = report.failures.len(), "public artifact rebuilt");
        Ok(report)
    }
}

/// Feeds, tag pages and the archive beside `index.html`. Pages of tags that
/// no longer exist are removed.
async fn write_site_pages(svc: &Services, template: &str, manifest: &PublicSite) -> Result<()> {
    let dir = svc.layout.public_dir(manifest.id);
    let root = svc.settings.gateway(&format!("ipns/{}/", manifest.publish_key));
    let rss = render_feed(manifest, &root, FeedKind::All)?;
    store::write_if_changed(&dir.join(FeedKind::All.file_name()), rss.as_bytes()).await?;
    let podcast = dir.join(FeedKind::Podcast.file_name());
    if has_audio(manifest) {
        let xml = render_feed(manifest, &root, FeedKind::Podcast)?;
        store::write_if_changed(&podcast, xml.as_bytes()).await?;
    } else {
        store::remove_file_if_exists(&podcast).await?;
    }

    let labels = manifest.tags.clone().unwrap_or_default();
    let mut by_tag: BTreeMap<&str, Vec<&PublicArticle>> = BTreeMap::new();
    for article in &manifest.articles {
        for key in article.tags.iter().flat_map(|tags| tags.keys()) {
            by_tag.entry(key.as_str()).or_default().push(article);
        }
    }
    let mut keep = vec!["index.html".to_string(), "tags.html".into(), "archive.html".into()];
    let mut pages = Vec::new();
    for (key, articles) in &by_tag {
        let Some(file) = tag_page(key) else {
            debug!(tag = %key, "tag gets no page");
            continue;
        };
        let label = labels.get(*key).map(String::as_str).unwrap_or(*key);
        let html = svc.templates.render_tag(template, manifest, label, articles)?;
        store::write_if_changed(&dir.join(&file), html.as_bytes()).await?;
        pages.push((file.clone(), label.to_string()));
        keep.push(file);
    }
    let tags = svc.templates.render_tags(template, manifest, &pages)?;
    store::write_if_changed(&dir.join("tags.html"), tags.as_bytes()).await?;
    let archive = svc.templates.render_archive(template, manifest)?;
    store::write_if_changed(&dir.join("archive.html"), archive.as_bytes()).await?;

    let mut entries = tokio::fs::read_dir(&dir).await.at(&dir)?;
    while let Some(entry) = entries.next_entry().await.at(&dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_file = entry.file_type().await.at(&dir)?.is_file();
        if is_file && name.ends_with(".html") && !keep.contains(&name) {
            store::remove_file_if_exists(&entry.path()).await?;
        }
    }
    Ok(())
}

/// Log a derived-image failure and keep building the article.
fn note_failure(failures: &mut Vec<(Uuid, String)>, article: Uuid, step: &str, err: PlanetError) {
    warn!(?err, article = %article, step, "derived output failed; continuing");
    failures.push((article, format!("{step}: {err}")));
}

async fn refresh_cover(
    svc: &Services,
    dir: &Path,
    core: &ArticleCore,
    ops: &mut OpsCache,
) -> Result<()> {
    let cover = dir.join(COVER_IMAGE);
    let fp = fingerprint([core.title.as_str()]);
    if !ops.is_done(core.id, OpKind::CoverImage, &fp, &cover).await {
        svc.media.render_cover(&core.title, &cover).await?;
        ops.mark(core.id, OpKind::CoverImage, fp);
    }
    Ok(())
}

async fn refresh_thumbnail(
    svc: &Services,
    dir: &Path,
    video: &str,
    core: &ArticleCore,
    ops: &mut OpsCache,
) -> Result<()> {
    let thumb = dir.join(VIDEO_THUMBNAIL);
    let fp = file_fingerprint(video, &dir.join(video)).await?;
    if !ops.is_done(core.id, OpKind::VideoThumbnail, &fp, &thumb).await {
        svc.media.video_thumbnail(&dir.join(video), &thumb).await?;
        ops.mark(core.id, OpKind::VideoThumbnail, fp);
    }
    Ok(())
}

async fn refresh_grid(
    svc: &Services,
    dir: &Path,
    hero: &str,
    core: &ArticleCore,
    ops: &mut OpsCache,
) -> Result<()> {
    let grid = dir.join(GRID_PNG);
    let fp = file_fingerprint(hero, &dir.join(hero)).await?;
    if !ops.is_done(core.id, OpKind::GridImage, &fp, &grid).await {
        svc.media.square_grid(&dir.join(hero), &grid, GRID_SIZE).await?;
        ops.mark(core.id, OpKind::GridImage, fp);
    }
    Ok(())
}

/// Derived images are best-effort: a failure is recorded in `failures` and
/// the article page is still written.
async fn rebuild_article(
    svc: &Services,
    template: &TemplateInfo,
    header: &PublicSite,
    article: &mut OwnedArticle,
    ops: &mut OpsCache,
    failures: &mut Vec<(Uuid, String)>,
) -> Result<()> {
    let site = article.site_id;
    let id = article.id();
    let dir = svc.layout.public_article_dir(site, id);
    tokio::fs::create_dir_all(&dir).await.at(&dir)?;

    if article.core.rendered_html.is_none() {
        article.core.rendered_html = Some(svc.markdown.render(&article.core.body_markdown));
    }

    if template.requires_cover_image && article.core.is_text_only() {
        if let Err(err) = refresh_cover(svc, &dir, &article.core, ops).await {
            note_failure(failures, id, "cover image", err);
        }
    }

    if let Some(video) = article.core.video_filename.clone() {
        if let Err(err) = refresh_thumbnail(svc, &dir, &video, &article.core, ops).await {
            note_failure(failures, id, "video thumbnail", err);
        }
    }

    refresh_hero(svc, &dir, &mut article.core, ops).await?;
    if let Some(hero) = article.core.hero_image_filename.clone() {
        if let Err(err) = refresh_grid(svc, &dir, &hero, &article.core, ops).await {
            note_failure(failures, id, "grid image", err);
        }
    }

    refresh_cids(svc, &dir, &mut article.core).await?;

    if template.generate_nft_metadata && !article.core.attachment_cids.is_empty() {
        write_nft(svc, &dir, article, ops).await?;
    }

    let public = PublicArticle::from(&*article);
    let html = svc.templates.render_article(&template.name, header, &public)?;
    let json = serde_json::to_vec_pretty(&public)?;
    let html_fp = fingerprint([html.as_bytes(), json.as_slice()]);
    let index = dir.join("index.html");
    if !ops.is_done(id, OpKind::ArticleHtml, &html_fp, &index).await {
        store::write_atomic(&index, html.as_bytes()).await?;
        store::write_atomic(&dir.join("article.json"), &json).await?;
        ops.mark(id, OpKind::ArticleHtml, html_fp.clone());
    }

    if let Some(slug) = article.slug() {
        let mirror = svc.layout.public_slug_dir(site, slug);
        let fp = fingerprint([slug, html_fp.as_str()]);
        if !ops.is_done(id, OpKind::SlugMirror, &fp, &mirror.join("index.html")).await {
            store::remove_dir_if_exists(&mirror).await?;
            store::copy_dir(&dir, &mirror).await?;
            ops.mark(id, OpKind::SlugMirror, fp);
        }
    }
    Ok(())
}

/// Keep the current hero while it is still attached, otherwise pick the
/// video thumbnail, the first image of at least 600x400, or the first image.
async fn refresh_hero(
    svc: &Services,
    dir: &Path,
    core: &mut ArticleCore,
    ops: &mut OpsCache,
) -> Result<()> {
    let mut inputs: Vec<&str> = core.attachments.iter().map(String::as_str).collect();
    inputs.push(core.hero_image_filename.as_deref().unwrap_or(""));
    let fp = fingerprint(inputs);
    if ops.matches(core.id, OpKind::HeroImage, &fp) {
        return Ok(());
    }

    let current = core
        .hero_image_filename
        .clone()
        .filter(|h| core.attachments.contains(h) || (h == VIDEO_THUMBNAIL && core.has_video()));
    let thumb_ready = core.has_video() && store::exists(&dir.join(VIDEO_THUMBNAIL)).await;
    let chosen = match current {
        Some(hero) => {
            let dims = svc.media.dimensions(&dir.join(&hero)).await.ok();
            Some((hero, dims))
        }
        None if thumb_ready => {
            let dims = svc.media.dimensions(&dir.join(VIDEO_THUMBNAIL)).await.ok();
            Some((VIDEO_THUMBNAIL.to_string(), dims))
        }
        None => {
            let mut first = None;
            let mut qualifying = None;
            for name in core.image_attachments() {
                let dims = match svc.media.dimensions(&dir.join(name)).await {
                    Ok(dims) => Some(dims),
                    Err(err) => {
                        debug!(?err, image = name, "could not read image size");
                        None
                    }
                };
                if first.is_none() {
                    first = Some((name.to_string(), dims));
                }
                if let Some((w, h)) = dims {
                    if w >= HERO_MIN_WIDTH && h >= HERO_MIN_HEIGHT {
                        qualifying = Some((name.to_string(), dims));
                        break;
                    }
                }
            }
            qualifying.or(first)
        }
    };

    match chosen {
        Some((name, dims)) => {
            core.hero_image_filename = Some(name);
            core.hero_image_width = dims.map(|d| d.0);
            core.hero_image_height = dims.map(|d| d.1);
        }
        None => {
            core.hero_image_filename = None;
            core.hero_image_width = None;
            core.hero_image_height = None;
        }
    }

    let mut inputs: Vec<&str> = core.attachments.iter().map(String::as_str).collect();
    inputs.push(core.hero_image_filename.as_deref().unwrap_or(""));
    ops.mark(core.id, OpKind::HeroImage, fingerprint(inputs));
    Ok(())
}

/// Hash attachments that have no CIDv0 yet; drop entries for removed files.
async fn refresh_cids(svc: &Services, dir: &Path, core: &mut ArticleCore) -> Result<()> {
    core.prune_cids();
    for name in core.attachments.clone() {
        let current = core.attachment_cids.get(&name);
        if current.is_some_and(|cid| cid.starts_with("Qm")) {
            continue;
        }
        let cid = svc.network.file_hash(&dir.join(&name)).await?;
        core.attachment_cids.insert(name, cid);
    }
    Ok(())
}

async fn write_nft(
    svc: &Services,
    dir: &Path,
    article: &OwnedArticle,
    ops: &mut OpsCache,
) -> Result<()> {
    let core = &article.core;
    let Some(first) = core
        .attachments
        .iter()
        .find(|a| core.attachment_cids.contains_key(*a))
    else {
        return Ok(());
    };
    let mut image_cid = core.attachment_cids[first].clone();
    let thumb = dir.join(VIDEO_THUMBNAIL);
    if core.has_video() && store::exists(&thumb).await {
        image_cid = svc.network.file_hash(&thumb).await?;
    }
    let mut animation_cid = None;
    if let Some(audio) = &core.audio_filename {
        let cover = dir.join(COVER_IMAGE);
        if store::exists(&cover).await {
            image_cid = svc.network.file_hash(&cover).await?;
        }
        animation_cid = core.attachment_cids.get(audio).cloned();
    }
    if let Some(video) = &core.video_filename {
        if let Some(cid) = core.attachment_cids.get(video) {
            animation_cid = Some(cid.clone());
        }
    }

    let mut attributes = vec![
        NftAttribute {
            trait_type: "title".into(),
            value: core.title.clone(),
        },
        NftAttribute {
            trait_type: "title_sha256".into(),
            value: fingerprint_plain(&core.title),
        },
    ];
    if !core.body_markdown.is_empty() {
        attributes.push(NftAttribute {
            trait_type: "content_sha256".into(),
            value: fingerprint_plain(&core.body_markdown),
        });
    }
    attributes.push(NftAttribute {
        trait_type: "created_at".into(),
        value: core.created.timestamp().to_string(),
    });

    let summary = summarize(&core.body_markdown);
    let metadata = NftMetadata {
        name: core.title.clone(),
        description: if summary.is_empty() { first.clone() } else { summary },
        image: format!("{NFT_GATEWAY}{image_cid}"),
        external_url: article.external_link.clone().unwrap_or_default(),
        mime_type: mime_type(first).to_string(),
        animation_url: animation_cid.map(|cid| format!("{NFT_GATEWAY}{cid}")),
        attributes,
    };
    let bytes = serde_json::to_vec_pretty(&metadata)?;
    let fp = fingerprint([bytes.as_slice()]);
    let cid_file = dir.join("nft.json.cid.txt");
    if ops.is_done(core.id, OpKind::NftMetadata, &fp, &cid_file).await {
        return Ok(());
    }
    let nft = dir.join("nft.json");
    store::write_atomic(&nft, &bytes).await?;
    let cid = svc.network.file_hash(&nft).await?;
    store::write_atomic(&cid_file, cid.as_bytes()).await?;
    ops.mark(core.id, OpKind::NftMetadata, fp);
    Ok(())
}

/// Plain hex sha256 of a string, as used in NFT attributes.
fn fingerprint_plain(text: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(text.as_bytes()))
}

impl OwnedHandle {
    pub(crate) fn from_state(state: OwnedPlanet) -> Self {
        Self {
            id: state.site.id(),
            state: Mutex::new(state),
            publishing: SiteGuard::new(),
            aggregating: SiteGuard::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, OwnedPlanet> {
        self.state.lock().await
    }

    /// Copy of the site record and its articles, newest first.
    pub async fn snapshot(&self) -> (OwnedSite, Vec<OwnedArticle>) {
        let st = self.state.lock().await;
        (st.site.clone(), st.articles.clone())
    }

    pub async fn drafts(&self) -> Vec<Draft> {
        self.state.lock().await.drafts.clone()
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing.is_busy()
    }

    pub fn is_aggregating(&self) -> bool {
        self.aggregating.is_busy()
    }

    /// Create a new site with a fresh signing key named after its id.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn create(svc: &Services, name: &str, about: &str, template: &str) -> Result<Self> {
        svc.templates.template(template)?;
        let core = SiteCore::new(name, about);
        let id = core.id;
        let publish_key = svc.network.generate_key(&key_name(id)).await?;
        let site = OwnedSite {
            core,
            publish_key,
            updated: Utc::now(),
            template_id: template.to_string(),
            last_published_at: None,
            last_published_cid: None,
            aggregation_sources: Vec::new(),
            reuse_original_id: false,
            tag_index: BTreeMap::new(),
            archived: false,
            archived_at: None,
        };
        let articles_dir = svc.layout.owned_articles_dir(id);
        tokio::fs::create_dir_all(&articles_dir).await.at(&articles_dir)?;
        let public_dir = svc.layout.public_dir(id);
        tokio::fs::create_dir_all(&public_dir).await.at(&public_dir)?;
        store::save_owned_site(&svc.layout, &site).await?;
        info!(site = %id, "owned site created");
        Ok(Self::from_state(OwnedPlanet {
            site,
            articles: Vec::new(),
            drafts: Vec::new(),
            ops: OpsCache::default(),
        }))
    }

    pub async fn load(layout: &Layout, id: Uuid) -> Result<Self> {
        let (site, articles) = store::load_owned_site(layout, id).await?;
        let drafts = store::load_drafts(layout, id).await?;
        let ops = OpsCache::load(&layout.ops_file(id)).await?;
        Ok(Self::from_state(OwnedPlanet {
            site,
            articles,
            drafts,
            ops,
        }))
    }

    /// Persist the site, its articles and operation markers. No network I/O.
    pub async fn save(&self, svc: &Services) -> Result<()> {
        self.state.lock().await.save_all(&svc.layout).await
    }

    pub async fn compose_article(&self, svc: &Services, new: NewArticle) -> Result<Uuid> {
        self.state.lock().await.compose(svc, new).await
    }

    pub async fn update_article(&self, svc: &Services, id: Uuid, edit: ArticleEdit) -> Result<()> {
        self.state.lock().await.edit(svc, id, edit).await
    }

    pub async fn delete_article(&self, svc: &Services, id: Uuid) -> Result<()> {
        let mut st = self.state.lock().await;
        st.remove(&svc.layout, id).await?;
        st.touch();
        store::save_owned_site(&svc.layout, &st.site).await?;
        st.ops.flush(&svc.layout.ops_file(self.id)).await
    }

    pub async fn set_pinned(&self, svc: &Services, id: Uuid, pinned: bool) -> Result<()> {
        let mut st = self.state.lock().await;
        let idx = st.position(id)?;
        let mut article = st.articles[idx].clone();
        article.pinned_at = pinned.then(Utc::now);
        store::save_owned_article(&svc.layout, &article).await?;
        st.articles[idx] = article;
        st.touch();
        store::save_owned_site(&svc.layout, &st.site).await
    }

    pub async fn configure_aggregation(
        &self,
        svc: &Services,
        sources: Vec<String>,
        reuse_original_id: bool,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        let mut site = st.site.clone();
        site.aggregation_sources = sources;
        site.reuse_original_id = reuse_original_id;
        store::save_owned_site(&svc.layout, &site).await?;
        st.site = site;
        Ok(())
    }

    pub async fn archive(&self, svc: &Services) -> Result<()> {
        let mut st = self.state.lock().await;
        let mut site = st.site.clone();
        site.archived = true;
        site.archived_at = Some(Utc::now());
        store::save_owned_site(&svc.layout, &site).await?;
        st.site = site;
        Ok(())
    }

    /// Start a draft, prefilled from `article` when editing one.
    pub async fn create_draft(&self, svc: &Services, article: Option<Uuid>) -> Result<Draft> {
        let mut st = self.state.lock().await;
        let mut draft = Draft {
            id: Uuid::new_v4(),
            site_id: self.id,
            article_id: article,
            title: String::new(),
            content: String::new(),
            attachments: Vec::new(),
            tags: BTreeMap::new(),
            date: Utc::now(),
        };
        if let Some(article_id) = article {
            let source = &st.articles[st.position(article_id)?];
            draft.title = source.core.title.clone();
            draft.content = source.core.body_markdown.clone();
            draft.tags = source.tags.clone();
            let from = svc.layout.public_article_dir(self.id, article_id);
            let files: Vec<PathBuf> = source.core.attachments.iter().map(|n| from.join(n)).collect();
            draft.attachments = copy_attachments(&svc.layout.draft_dir(self.id, draft.id), &files)
                .await?
                .names;
        }
        store::save_draft(&svc.layout, &draft).await?;
        st.drafts.push(draft.clone());
        Ok(draft)
    }

    /// Copy a file into the draft's directory and list it as an attachment.
    pub async fn attach_to_draft(&self, svc: &Services, draft: Uuid, file: &Path) -> Result<String> {
        let mut st = self.state.lock().await;
        let idx = st
            .drafts
            .iter()
            .position(|d| d.id == draft)
            .ok_or_else(|| PlanetError::NotFound(format!("draft {draft}")))?;
        let dir = svc.layout.draft_dir(self.id, draft);
        let names = copy_attachments(&dir, &[file.to_path_buf()]).await?.names;
        let mut updated = st.drafts[idx].clone();
        for name in &names {
            if !updated.attachments.contains(name) {
                updated.attachments.push(name.clone());
            }
        }
        store::save_draft(&svc.layout, &updated).await?;
        st.drafts[idx] = updated;
        Ok(names.into_iter().next().unwrap_or_default())
    }

    pub async fn save_draft(&self, svc: &Services, draft: Draft) -> Result<()> {
        let mut st = self.state.lock().await;
        let idx = st
            .drafts
            .iter()
            .position(|d| d.id == draft.id)
            .ok_or_else(|| PlanetError::NotFound(format!("draft {}", draft.id)))?;
        store::save_draft(&svc.layout, &draft).await?;
        st.drafts[idx] = draft;
        Ok(())
    }

    /// Turn a draft into a new article, or apply it to the article it edits,
    /// then discard the draft directory.
    pub async fn commit_draft(&self, svc: &Services, draft: Uuid) -> Result<Uuid> {
        let mut st = self.state.lock().await;
        let idx = st
            .drafts
            .iter()
            .position(|d| d.id == draft)
            .ok_or_else(|| PlanetError::NotFound(format!("draft {draft}")))?;
        let d = st.drafts[idx].clone();
        let dir = svc.layout.draft_dir(self.id, d.id);
        let files: Vec<PathBuf> = d.attachments.iter().map(|n| dir.join(n)).collect();

        let article = match d.article_id {
            Some(existing) if st.position(existing).is_ok() => {
                let edit = ArticleEdit {
                    title: Some(d.title),
                    body: Some(d.content),
                    tags: Some(d.tags),
                    attachments: Some(files),
                    ..Default::default()
                };
                st.edit(svc, existing, edit).await?;
                existing
            }
            _ => {
                let new = NewArticle {
                    title: d.title,
                    body: d.content,
                    attachments: files,
                    tags: d.tags,
                    ..Default::default()
                };
                st.compose(svc, new).await?
            }
        };
        store::delete_draft(&svc.layout, self.id, draft).await?;
        st.drafts.remove(idx);
        Ok(article)
    }

    pub async fn delete_draft(&self, svc: &Services, draft: Uuid) -> Result<()> {
        let mut st = self.state.lock().await;
        store::delete_draft(&svc.layout, self.id, draft).await?;
        st.drafts.retain(|d| d.id != draft);
        Ok(())
    }

    /// Remove every aggregated post that came from `domain`, then rebuild.
    #[instrument(skip_all, fields(site = %self.id, domain = %domain))]
    pub async fn delete_posts_from_domain(&self, svc: &Services, domain: &str) -> Result<usize> {
        let mut st = self.state.lock().await;
        let doomed: Vec<Uuid> = st
            .articles
            .iter()
            .filter(|a| a.original_site_domain.as_deref() == Some(domain))
            .map(OwnedArticle::id)
            .collect();
        for id in &doomed {
            st.remove(&svc.layout, *id).await?;
        }
        if !doomed.is_empty() {
            st.touch();
            st.save_all(&svc.layout).await?;
            st.rebuild(svc).await?;
        }
        info!(removed = doomed.len(), "aggregated posts removed");
        Ok(doomed.len())
    }

    pub async fn rebuild_public_artifact(&self, svc: &Services) -> Result<RebuildReport> {
        self.state.lock().await.rebuild(svc).await
    }

    /// Rebuild, add the public tree to the network and point the site's name
    /// at it. Returns `None` without doing anything when a publish for this
    /// site is already running. Site state only changes after both network
    /// steps succeed.
    #[instrument(skip_all, fields(site = %self.id))]
    pub async fn publish(&self, svc: &Services) -> Result<Option<PublishReport>> {
        let Some(_running) = self.publishing.try_acquire() else {
            debug!("publish already running; skipping");
            return Ok(None);
        };

        let rebuild = self.state.lock().await.rebuild(svc).await?;
        let public_dir = svc.layout.public_dir(self.id);
        let cid = svc.network.add_directory(&public_dir).await?;
        svc.network
            .publish_name(&key_name(self.id), &cid, svc.settings.publish_lifetime)
            .await?;

        let published_at = Utc::now();
        let mut st = self.state.lock().await;
        let mut site = st.site.clone();
        site.last_published_at = Some(published_at);
        site.last_published_cid = Some(cid.clone());
        store::save_owned_site(&svc.layout, &site).await?;
        st.site = site;
        info!(cid = %cid, "site published");
        Ok(Some(PublishReport {
            cid,
            published_at,
            rebuild,
        }))
    }

    /// Write `{dir}/{name}.planet/`: the public tree, the exported signing
    /// key and a `planet.json` carrying every local field.
    #[instrument(skip_all, fields(site = %self.id))]
    pub async fn export_backup(&self, svc: &Services, dir: &Path) -> Result<PathBuf> {
        let st = self.state.lock().await;
        let target = dir.join(format!("{}.planet", sanitize_name(st.site.name(), self.id)));
        if store::exists(&target).await {
            return Err(PlanetError::FileExists(target));
        }
        let result = async {
            let public_dir = svc.layout.public_dir(self.id);
            if store::exists(&public_dir).await {
                store::copy_dir(&public_dir, &target).await?;
            } else {
                tokio::fs::create_dir_all(&target).await.at(&target)?;
            }
            svc.network
                .export_key(&key_name(self.id), &target.join("planet.key"))
                .await?;
            let manifest = BackupManifest {
                site: st.site.clone(),
                articles: st.articles.clone(),
            };
            store::write_json(&target.join("planet.json"), &manifest).await
        }
        .await;
        if let Err(err) = result {
            let _ = store::remove_dir_if_exists(&target).await;
            return Err(err);
        }
        info!(path = %target.display(), "backup exported");
        Ok(target)
    }

    /// Restore a bundle written by [`OwnedHandle::export_backup`].
    #[instrument(skip_all, fields(path = %dir.display()))]
    pub async fn import_backup(svc: &Services, dir: &Path) -> Result<Self> {
        let manifest: BackupManifest = store::read_json(&dir.join("planet.json")).await?;
        let mut site = manifest.site;
        let id = site.id();
        let owned_dir = svc.layout.owned_dir(id);
        if store::exists(&owned_dir).await {
            return Err(PlanetError::FileExists(owned_dir));
        }
        let key = dir.join("planet.key");
        if store::exists(&key).await {
            site.publish_key = svc.network.import_key(&key_name(id), &key).await?;
        }

        let mut articles = manifest.articles;
        for article in &mut articles {
            article.site_id = id;
        }
        let result = async {
            let public_dir = svc.layout.public_dir(id);
            store::copy_dir(dir, &public_dir).await?;
            store::remove_file_if_exists(&public_dir.join("planet.key")).await?;
            store::remove_file_if_exists(&public_dir.join("planet.json")).await?;
            store::save_owned_site(&svc.layout, &site).await?;
            for article in &articles {
                store::save_owned_article(&svc.layout, article).await?;
            }
            Ok::<_, PlanetError>(())
        }
        .await;
        if let Err(err) = result {
            let _ = store::remove_dir_if_exists(&owned_dir).await;
            let _ = store::remove_dir_if_exists(&svc.layout.public_dir(id)).await;
            return Err(err);
        }
        sort_owned(&mut articles);
        info!(site = %id, articles = articles.len(), "backup imported");
        Ok(Self::from_state(OwnedPlanet {
            site,
            articles,
            drafts: Vec::new(),
            ops: OpsCache::default(),
        }))
    }

    /// Remove the site's local and public trees and, best-effort, its key.
    /// Refused while a publish or aggregation is running.
    #[instrument(skip_all, fields(site = %self.id))]
    pub async fn delete(&self, svc: &Services) -> Result<()> {
        let Some(_publishing) = self.publishing.try_acquire() else {
            return Err(PlanetError::AlreadyInProgress {
                site: self.id,
                operation: "publish",
            });
        };
        let Some(_aggregating) = self.aggregating.try_acquire() else {
            return Err(PlanetError::AlreadyInProgress {
                site: self.id,
                operation: "aggregate",
            });
        };
        let _st = self.state.lock().await;
        store::remove_dir_if_exists(&svc.layout.owned_dir(self.id)).await?;
        store::remove_dir_if_exists(&svc.layout.public_dir(self.id)).await?;
        if let Err(err) = svc.network.remove_key(&key_name(self.id)).await {
            warn!(?err, "failed to remove signing key");
        }
        info!("owned site deleted");
        Ok(())
    }
}
