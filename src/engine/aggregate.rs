//! Aggregation: copy posts from other planets and web feeds into an owned
//! site as first-class articles.

use reqwest::Url;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::owned::{assign_attachments, OwnedHandle, OwnedPlanet};
use super::Services;
use crate::error::{IoContext, PlanetError, Result};
use crate::feed::{og_image, FeedItem};
use crate::model::OwnedArticle;
use crate::reconcile::{self, ListingKind};
use crate::store::{self, paths::id_dir, OpKind};
use crate::wire::{PublicArticle, PublicSite};

const IPNS_KEY_LEN: usize = 62;

/// One configured aggregation source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// `k51...` IPNS key publishing a planet manifest.
    Ipns(String),
    /// ENS name publishing a planet manifest.
    Ens(String),
    /// RSS, Atom or JSON feed URL.
    Http(String),
}

impl SourceRef {
    /// Classify a configuration line. Blank lines and `#` or `//` comments
    /// yield `None`, as do lines of no recognisable shape.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            return None;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("k51") && line.len() == IPNS_KEY_LEN {
            return Some(SourceRef::Ipns(lower));
        }
        if lower.ends_with(".eth") && line.len() > 4 {
            return Some(SourceRef::Ens(lower));
        }
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Some(SourceRef::Http(line.to_string()));
        }
        warn!(source = line, "unrecognised aggregation source");
        None
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceRef::Ipns(s) | SourceRef::Ens(s) | SourceRef::Http(s) => s,
        }
    }
}

pub fn parse_sources(lines: &[String]) -> Vec<SourceRef> {
    lines.iter().filter_map(|l| SourceRef::parse(l)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub new: usize,
    pub updated: usize,
    pub deleted: usize,
    pub attachments_written: usize,
    pub failed_sources: usize,
    /// CID of the publish triggered by new articles.
    pub published: Option<String>,
}

/// Attachment names come from remote manifests; refuse anything that could
/// escape the article directory.
fn safe_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

#[derive(Debug, Default)]
struct Mirrored {
    kept: Vec<String>,
    written: usize,
    /// Names that already existed locally with different bytes.
    replaced: Vec<String>,
}

async fn mirror(svc: &Services, base: &str, names: &[String], dir: &Path) -> Result<Mirrored> {
    tokio::fs::create_dir_all(dir).await.at(dir)?;
    let mut mirrored = Mirrored::default();
    for name in names {
        if !safe_name(name) {
            warn!(attachment = %name, "skipping unsafe attachment name");
            continue;
        }
        let bytes = svc.feeds.fetch_bytes(&format!("{base}/{name}")).await?;
        let target = dir.join(name);
        let existed = store::exists(&target).await;
        if store::write_if_changed(&target, &bytes).await? {
            mirrored.written += 1;
            if existed {
                mirrored.replaced.push(name.clone());
            }
        }
        mirrored.kept.push(name.clone());
    }
    Ok(mirrored)
}

/// Fresh id unless reuse is enabled and the original id is free.
fn pick_id(original: Uuid, reuse: bool, taken: &HashSet<Uuid>) -> Uuid {
    if !reuse {
        return Uuid::new_v4();
    }
    if taken.contains(&original) {
        warn!(original = %original, "original id already in use; assigning a fresh one");
        return Uuid::new_v4();
    }
    original
}

fn youtube_id(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    match host {
        "youtube.com" => url
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty()),
        "youtu.be" => url
            .path_segments()?
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn image_name(url: &str) -> String {
    let last = Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
        .unwrap_or_default();
    let cleaned: String = last
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        "social.jpg".to_string()
    } else if crate::model::is_image(&cleaned) {
        cleaned
    } else {
        format!("{cleaned}.jpg")
    }
}

/// Best-effort preview image for a feed item: its own image, a YouTube
/// thumbnail, or the linked page's Open Graph image.
async fn social_image(svc: &Services, item: &FeedItem) -> Option<(String, Vec<u8>)> {
    let (url, name) = if let Some(url) = &item.image_url {
        (url.clone(), image_name(url))
    } else if let Some(v) = youtube_id(&item.link) {
        (
            format!("https://img.youtube.com/vi/{v}/maxresdefault.jpg"),
            format!("{v}_maxresdefault.jpg"),
        )
    } else {
        let base = Url::parse(&item.link).ok()?;
        let html = match svc.feeds.fetch_text(&item.link).await {
            Ok(html) => html,
            Err(err) => {
                debug!(?err, link = %item.link, "could not fetch page for social image");
                return None;
            }
        };
        let url = og_image(&html, &base)?;
        let name = image_name(&url);
        (url, name)
    };
    match svc.feeds.fetch_bytes(&url).await {
        Ok(bytes) if !bytes.is_empty() => Some((name, bytes)),
        Ok(_) => None,
        Err(err) => {
            debug!(?err, url = %url, "social image unavailable");
            None
        }
    }
}

fn host_of(link: &str) -> Option<String> {
    Url::parse(link).ok()?.host_str().map(str::to_string)
}

impl OwnedHandle {
    /// Pull every configured source into this site. Returns `None` when an
    /// aggregation for this site is already running. A failing source is
    /// logged and counted; the others still run. Publishes only when at
    /// least one new article arrived.
    #[instrument(skip_all, fields(site = %self.id()))]
    pub async fn aggregate(&self, svc: &Services) -> Result<Option<AggregationReport>> {
        let Some(_running) = self.aggregating.try_acquire() else {
            debug!("aggregation already running; skipping");
            return Ok(None);
        };

        let mut report = AggregationReport::default();
        {
            let mut st = self.lock().await;
            let sources = parse_sources(&st.site.aggregation_sources);
            if sources.is_empty() {
                return Ok(Some(report));
            }
            for source in &sources {
                let result = match source {
                    SourceRef::Ipns(name) | SourceRef::Ens(name) => {
                        aggregate_planet(svc, &mut st, name, &mut report).await
                    }
                    SourceRef::Http(url) => aggregate_feed(svc, &mut st, url, &mut report).await,
                };
                if let Err(err) = result {
                    warn!(?err, source = source.as_str(), "aggregation source failed");
                    report.failed_sources += 1;
                }
            }
            st.touch();
            st.save_all(&svc.layout).await?;
            st.rebuild(svc).await?;
        }

        if report.new > 0 {
            report.published = self.publish(svc).await?.map(|p| p.cid);
        }
        info!(
            new = report.new,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed_sources,
            "aggregation finished"
        );
        Ok(Some(report))
    }
}

async fn aggregate_planet(
    svc: &Services,
    st: &mut OwnedPlanet,
    source: &str,
    report: &mut AggregationReport,
) -> Result<()> {
    let url = svc.settings.gateway(&format!("ipns/{source}/planet.json"));
    let bytes = svc.feeds.fetch_bytes(&url).await?;
    let manifest: PublicSite = serde_json::from_slice(&bytes)
        .map_err(|err| PlanetError::RemoteProtocol(format!("manifest at {url}: {err}")))?;

    let scope: Vec<usize> = st
        .articles
        .iter()
        .enumerate()
        .filter(|(_, a)| a.original_site_domain.as_deref() == Some(source))
        .map(|(idx, _)| idx)
        .collect();
    let local: Vec<String> = scope
        .iter()
        .map(|&idx| st.articles[idx].original_post_id.clone().unwrap_or_default())
        .collect();
    let incoming: Vec<String> = manifest.articles.iter().map(|a| id_dir(a.id)).collect();
    let plan = reconcile::plan(&local, &incoming, ListingKind::Manifest);
    let site = st.site.id();

    for &(l, i) in &plan.matched {
        let remote = &manifest.articles[i];
        let idx = scope[l];
        let mut article = st.articles[idx].clone();
        if !refresh_from_remote(&mut article, remote) {
            continue;
        }
        let dir = svc.layout.public_article_dir(site, article.id());
        let base = svc.settings.gateway(&format!("ipns/{source}/{}", incoming[i]));
        let names = remote.effective_attachments();
        let mirrored = mirror(svc, &base, &names, &dir).await?;
        for stale in article.core.attachments.iter().filter(|n| !mirrored.kept.contains(n)) {
            store::remove_file_if_exists(&dir.join(stale)).await?;
        }
        report.attachments_written += mirrored.written;
        if remote.hero_image.is_some() {
            article.core.hero_image_filename = remote.hero_image.clone();
        }
        article.core.forget_cids(&mirrored.replaced);
        if !mirrored.replaced.is_empty() {
            st.ops.forget(article.id(), OpKind::HeroImage);
        }
        assign_attachments(&mut article.core, mirrored.kept);
        store::save_owned_article(&svc.layout, &article).await?;
        st.articles[idx] = article;
        report.updated += 1;
    }

    let mut taken: HashSet<Uuid> = st.articles.iter().map(OwnedArticle::id).collect();
    for &i in &plan.created {
        let remote = &manifest.articles[i];
        let id = pick_id(remote.id, st.site.reuse_original_id, &taken);
        let mut article = OwnedArticle::with_id(id, site, remote.title.clone(), remote.content.clone());
        refresh_from_remote(&mut article, remote);
        article.core.created = remote.created;
        article.original_site_name = Some(manifest.name.clone());
        article.original_site_domain = Some(source.to_string());
        article.original_post_id = Some(incoming[i].clone());
        article.original_post_date = Some(remote.created);

        let dir = svc.layout.public_article_dir(site, id);
        let base = svc.settings.gateway(&format!("ipns/{source}/{}", incoming[i]));
        let mirrored = match mirror(svc, &base, &remote.effective_attachments(), &dir).await {
            Ok(mirrored) => mirrored,
            Err(err) => {
                warn!(?err, post = %incoming[i], "skipping post with unreachable attachments");
                let _ = store::remove_dir_if_exists(&dir).await;
                continue;
            }
        };
        report.attachments_written += mirrored.written;
        if remote.hero_image.is_some() {
            article.core.hero_image_filename = remote.hero_image.clone();
        }
        assign_attachments(&mut article.core, mirrored.kept);
        store::save_owned_article(&svc.layout, &article).await?;
        taken.insert(id);
        st.articles.push(article);
        report.new += 1;
    }

    let doomed: Vec<Uuid> = plan.deleted.iter().map(|&l| st.articles[scope[l]].id()).collect();
    for id in doomed {
        st.remove(&svc.layout, id).await?;
        report.deleted += 1;
    }
    Ok(())
}

/// Copy remote text fields; true when anything differs.
fn refresh_from_remote(article: &mut OwnedArticle, remote: &PublicArticle) -> bool {
    let mut changed = false;
    if article.core.title != remote.title {
        article.core.title = remote.title.clone();
        changed = true;
    }
    if article.core.set_body(&remote.content) {
        changed = true;
    }
    let tags = remote.tags.clone().unwrap_or_default();
    if article.tags != tags {
        article.tags = tags;
        changed = true;
    }
    if article.core.attachments != remote.effective_attachments() {
        changed = true;
    }
    if remote.hero_image.is_some() && article.core.hero_image_filename != remote.hero_image {
        changed = true;
    }
    changed
}

async fn aggregate_feed(
    svc: &Services,
    st: &mut OwnedPlanet,
    url: &str,
    report: &mut AggregationReport,
) -> Result<()> {
    let feed = svc.feeds.fetch_feed(url).await?;
    let fallback_host = host_of(url);
    let scope: Vec<usize> = st
        .articles
        .iter()
        .enumerate()
        .filter(|(_, a)| a.is_aggregated())
        .map(|(idx, _)| idx)
        .collect();
    let local: Vec<String> = scope
        .iter()
        .map(|&idx| st.articles[idx].original_post_id.clone().unwrap_or_default())
        .collect();
    let incoming: Vec<&str> = feed.articles.iter().map(|item| item.link.as_str()).collect();
    let plan = reconcile::plan(&local, &incoming, ListingKind::Feed);
    let site = st.site.id();

    for &(l, i) in &plan.matched {
        let item = &feed.articles[i];
        let idx = scope[l];
        let mut article = st.articles[idx].clone();
        let mut changed = article.core.set_body(&item.content);
        if article.core.title != item.title {
            article.core.title = item.title.clone();
            changed = true;
        }
        if changed {
            store::save_owned_article(&svc.layout, &article).await?;
            st.articles[idx] = article;
            report.updated += 1;
        }
    }

    for &i in &plan.created {
        let item = &feed.articles[i];
        let mut article = OwnedArticle::new(site, item.title.clone(), item.content.clone());
        article.core.created = item.created;
        article.external_link = Some(item.link.clone());
        article.original_site_name = Some(feed.name.clone());
        article.original_site_domain = host_of(&item.link).or_else(|| fallback_host.clone());
        article.original_post_id = Some(item.link.clone());
        article.original_post_date = Some(item.created);

        if let Some((name, bytes)) = social_image(svc, item).await {
            let dir = svc.layout.public_article_dir(site, article.id());
            tokio::fs::create_dir_all(&dir).await.at(&dir)?;
            if store::write_if_changed(&dir.join(&name), &bytes).await? {
                report.attachments_written += 1;
            }
            article.core.hero_image_filename = Some(name.clone());
            assign_attachments(&mut article.core, vec![name]);
        }
        store::save_owned_article(&svc.layout, &article).await?;
        st.articles.push(article);
        report.new += 1;
    }
    Ok(())
}
