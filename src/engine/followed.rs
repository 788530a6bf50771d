//! Followed sites: read-only mirrors of remote planets and feeds.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::Services;
use crate::error::{IoContext, PlanetError, Result};
use crate::feed::Feed;
use crate::guard::SiteGuard;
use crate::model::{ArticleCore, FollowedArticle, FollowedSite, SiteCore, SourceKind};
use crate::reconcile::{self, ListingKind, ReconcileReport};
use crate::render::summarize;
use crate::store;
use crate::wire::PublicSite;

const SCHEME: &str = "planet://";
const IPFS_PREFIX: &str = "/ipfs/";
const CID_V0_LEN: usize = 46;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Content identifier the mirror now tracks, for versioned sources.
    pub cid: Option<String>,
    /// False when the source was unchanged and no article was touched.
    pub changed: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl UpdateReport {
    fn unchanged(cid: Option<String>) -> Self {
        Self {
            cid,
            ..Default::default()
        }
    }
}

/// In-memory state of one followed site.
#[derive(Debug, Clone)]
pub struct FollowedPlanet {
    pub site: FollowedSite,
    pub articles: Vec<FollowedArticle>,
}

#[derive(Debug)]
pub struct FollowedHandle {
    id: Uuid,
    state: Mutex<FollowedPlanet>,
    updating: SiteGuard,
}

/// Decide how to follow `address`, returning its kind and canonical form.
pub fn classify_follow(address: &str) -> Result<(SourceKind, String)> {
    let trimmed = address.trim();
    let trimmed = trimmed.strip_prefix(SCHEME).unwrap_or(trimmed).trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(PlanetError::InvalidAddress(address.to_string()));
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        reqwest::Url::parse(trimmed).map_err(|_| PlanetError::InvalidAddress(address.to_string()))?;
        return Ok((SourceKind::DnsFeed, trimmed.to_string()));
    }
    if lower.starts_with("k51") && lower.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Ok((SourceKind::Native, lower));
    }
    let name_like = lower.contains('.')
        && !lower.starts_with('.')
        && !lower.ends_with('.')
        && lower
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if name_like {
        return Ok((SourceKind::NameService, lower));
    }
    Err(PlanetError::InvalidAddress(address.to_string()))
}

/// Strip the local gateway and a leading `/ipfs/Qm...` from a link so the
/// key survives the source moving to a new CID.
pub fn normalize_link(link: &str, gateway: &str) -> String {
    let mut link = link.trim();
    let gateway = gateway.trim_end_matches('/');
    if !gateway.is_empty() {
        if let Some(rest) = link.strip_prefix(gateway) {
            link = rest;
        }
    }
    if let Some(rest) = link.strip_prefix(IPFS_PREFIX) {
        if rest.starts_with("Qm") && rest.len() >= CID_V0_LEN && rest.is_char_boundary(CID_V0_LEN) {
            link = &rest[CID_V0_LEN..];
        }
    }
    link.to_string()
}

/// One remote article, normalised from a manifest entry or a feed item.
#[derive(Debug, Clone)]
struct Incoming {
    id: Option<Uuid>,
    link: String,
    title: String,
    content: String,
    created: DateTime<Utc>,
    attachments: Vec<String>,
    cids: BTreeMap<String, String>,
    video: Option<String>,
    audio: Option<String>,
    hero: Option<String>,
}

#[derive(Debug)]
struct Listing {
    name: String,
    about: String,
    updated: Option<DateTime<Utc>>,
    avatar: Option<Vec<u8>>,
    kind: ListingKind,
    items: Vec<Incoming>,
}

impl Listing {
    fn from_manifest(manifest: PublicSite, avatar: Option<Vec<u8>>, gateway: &str) -> Self {
        let items = manifest
            .articles
            .into_iter()
            .map(|a| Incoming {
                id: Some(a.id),
                link: normalize_link(&a.link, gateway),
                attachments: a.effective_attachments(),
                title: a.title,
                content: a.content,
                created: a.created,
                cids: a.cids.unwrap_or_default(),
                video: a.video_filename,
                audio: a.audio_filename,
                hero: a.hero_image,
            })
            .collect();
        Self {
            name: manifest.name,
            about: manifest.about,
            updated: manifest.updated,
            avatar,
            kind: ListingKind::Manifest,
            items,
        }
    }

    fn from_feed(feed: Feed, gateway: &str) -> Self {
        let items = feed
            .articles
            .into_iter()
            .map(|item| Incoming {
                id: None,
                link: normalize_link(&item.link, gateway),
                title: item.title,
                content: item.content,
                created: item.created,
                attachments: Vec::new(),
                cids: BTreeMap::new(),
                video: None,
                audio: None,
                hero: None,
            })
            .collect();
        Self {
            name: feed.name,
            about: feed.about,
            updated: None,
            avatar: feed.avatar,
            kind: ListingKind::Feed,
            items,
        }
    }
}

/// Copy an incoming item onto a local article; true when anything changed.
fn apply_item(article: &mut FollowedArticle, item: &Incoming) -> bool {
    let core = &mut article.core;
    let mut changed = false;
    if core.title != item.title {
        core.title = item.title.clone();
        changed = true;
    }
    if core.set_body(&item.content) {
        article.summary = Some(summarize(&item.content));
        changed = true;
    }
    if core.attachments != item.attachments {
        core.set_attachments(item.attachments.clone());
        changed = true;
    }
    if core.attachment_cids != item.cids
        || core.video_filename != item.video
        || core.audio_filename != item.audio
        || core.hero_image_filename != item.hero
    {
        core.attachment_cids = item.cids.clone();
        core.video_filename = item.video.clone();
        core.audio_filename = item.audio.clone();
        core.hero_image_filename = item.hero.clone();
        changed = true;
    }
    changed
}

fn new_article(site: Uuid, item: &Incoming, taken: &HashSet<Uuid>) -> FollowedArticle {
    let mut core = ArticleCore::new(item.title.clone(), item.content.clone());
    if let Some(id) = item.id.filter(|id| !taken.contains(id)) {
        core.id = id;
    }
    core.created = item.created;
    core.set_attachments(item.attachments.clone());
    core.attachment_cids = item.cids.clone();
    core.video_filename = item.video.clone();
    core.audio_filename = item.audio.clone();
    core.hero_image_filename = item.hero.clone();
    FollowedArticle {
        core,
        site_id: site,
        source_link: item.link.clone(),
        read_at: None,
        summary: Some(summarize(&item.content)),
    }
}

struct Applied {
    report: ReconcileReport,
    dirty: Vec<Uuid>,
    removed: Vec<Uuid>,
}

fn apply_listing(planet: &mut FollowedPlanet, items: &[Incoming], kind: ListingKind) -> Applied {
    let site = planet.site.id();
    let local: Vec<&str> = planet.articles.iter().map(|a| a.source_link.as_str()).collect();
    let keys: Vec<&str> = items.iter().map(|i| i.link.as_str()).collect();
    let plan = reconcile::plan(&local, &keys, kind);

    let removed: Vec<Uuid> = plan.deleted.iter().map(|&idx| planet.articles[idx].id()).collect();
    let mut dirty = Vec::new();
    let mut report = ReconcileReport {
        deleted: removed.len(),
        ..Default::default()
    };
    for &(local_idx, incoming_idx) in &plan.matched {
        let article = &mut planet.articles[local_idx];
        if apply_item(article, &items[incoming_idx]) {
            report.updated += 1;
            dirty.push(article.id());
        }
    }

    let mut taken: HashSet<Uuid> = planet.articles.iter().map(FollowedArticle::id).collect();
    for &idx in &plan.created {
        let article = new_article(site, &items[idx], &taken);
        taken.insert(article.id());
        dirty.push(article.id());
        planet.articles.push(article);
        report.created += 1;
    }

    if !removed.is_empty() {
        planet.articles.retain(|a| !removed.contains(&a.id()));
    }
    planet
        .articles
        .sort_by(|a, b| b.core.created.cmp(&a.core.created));
    Applied {
        report,
        dirty,
        removed,
    }
}

async fn fetch_manifest(svc: &Services, cid: &str) -> Result<PublicSite> {
    let url = svc.settings.gateway(&format!("ipfs/{cid}/planet.json"));
    let bytes = svc.feeds.fetch_bytes(&url).await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| PlanetError::RemoteProtocol(format!("manifest at {url}: {err}")))
}

async fn fetch_avatar(svc: &Services, cid: &str) -> Option<Vec<u8>> {
    let url = svc.settings.gateway(&format!("ipfs/{cid}/avatar.png"));
    match svc.feeds.fetch_bytes(&url).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(err) => {
            debug!(?err, "no avatar in manifest directory");
            None
        }
    }
}

impl FollowedHandle {
    fn from_state(state: FollowedPlanet) -> Self {
        Self {
            id: state.site.id(),
            state: Mutex::new(state),
            updating: SiteGuard::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn snapshot(&self) -> (FollowedSite, Vec<FollowedArticle>) {
        let st = self.state.lock().await;
        (st.site.clone(), st.articles.clone())
    }

    pub async fn source_address(&self) -> String {
        self.state.lock().await.site.source_address.clone()
    }

    pub fn is_updating(&self) -> bool {
        self.updating.is_busy()
    }

    pub async fn load(layout: &store::Layout, id: Uuid) -> Result<Self> {
        let (site, articles) = store::load_followed_site(layout, id).await?;
        Ok(Self::from_state(FollowedPlanet { site, articles }))
    }

    /// Follow `address`: classify it, run the first fetch and persist. Nothing
    /// is left on disk when the first fetch fails.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn follow(svc: &Services, address: &str) -> Result<Self> {
        let (kind, canonical) = classify_follow(address)?;
        let now = Utc::now();
        let site = FollowedSite {
            core: SiteCore::new(canonical.clone(), ""),
            source_kind: kind,
            source_address: canonical,
            resolved_cid: None,
            updated: now,
            last_local_update_at: now,
        };
        let id = site.id();
        let handle = Self::from_state(FollowedPlanet {
            site,
            articles: Vec::new(),
        });
        match handle.update(svc).await {
            Ok(_) => {
                info!(site = %id, kind = kind.as_str(), "following");
                Ok(handle)
            }
            Err(err) => {
                let _ = store::remove_dir_if_exists(&svc.layout.followed_dir(id)).await;
                Err(err)
            }
        }
    }

    /// Bring the mirror up to date with its source. Returns `None` when an
    /// update for this site is already running.
    #[instrument(skip_all, fields(site = %self.id))]
    pub async fn update(&self, svc: &Services) -> Result<Option<UpdateReport>> {
        let Some(_running) = self.updating.try_acquire() else {
            debug!("update already running; skipping");
            return Ok(None);
        };
        let mut st = self.state.lock().await;
        let report = refresh(svc, &mut st).await?;
        Ok(Some(report))
    }

    pub async fn mark_read(&self, svc: &Services, article: Uuid, read: bool) -> Result<()> {
        let mut st = self.state.lock().await;
        let idx = st
            .articles
            .iter()
            .position(|a| a.id() == article)
            .ok_or_else(|| PlanetError::NotFound(format!("article {article}")))?;
        let mut updated = st.articles[idx].clone();
        updated.read_at = read.then(Utc::now);
        store::save_followed_article(&svc.layout, &updated).await?;
        st.articles[idx] = updated;
        Ok(())
    }

    pub async fn save(&self, svc: &Services) -> Result<()> {
        let st = self.state.lock().await;
        store::save_followed_site(&svc.layout, &st.site).await?;
        for article in &st.articles {
            store::save_followed_article(&svc.layout, article).await?;
        }
        Ok(())
    }

    /// Drop the local mirror. Unpinning the last CID is best-effort.
    #[instrument(skip_all, fields(site = %self.id))]
    pub async fn unfollow(&self, svc: &Services) -> Result<()> {
        let Some(_running) = self.updating.try_acquire() else {
            return Err(PlanetError::AlreadyInProgress {
                site: self.id,
                operation: "update",
            });
        };
        let st = self.state.lock().await;
        store::remove_dir_if_exists(&svc.layout.followed_dir(self.id)).await?;
        if let Some(cid) = &st.site.resolved_cid {
            if let Err(err) = svc.network.unpin(cid).await {
                warn!(?err, cid = %cid, "failed to unpin");
            }
        }
        info!("unfollowed");
        Ok(())
    }
}

async fn refresh(svc: &Services, st: &mut FollowedPlanet) -> Result<UpdateReport> {
    let gateway = svc.settings.gateway_url.as_str();
    let address = st.site.source_address.clone();
    let kind = st.site.source_kind;
    let previous = st.site.resolved_cid.clone();

    let (listing, cid) = if kind.is_versioned() {
        let cid = svc.network.resolve_name(&address).await?;
        if previous.as_deref() == Some(cid.as_str()) {
            debug!(cid = %cid, "source unchanged");
            return Ok(UpdateReport::unchanged(Some(cid)));
        }
        let listing = match fetch_manifest(svc, &cid).await {
            Ok(manifest) => {
                let avatar = fetch_avatar(svc, &cid).await;
                Listing::from_manifest(manifest, avatar, gateway)
            }
            Err(err) if kind == SourceKind::NameService => {
                debug!(?err, "no manifest behind name; trying feed discovery");
                let url = svc.settings.gateway(&format!("ipfs/{cid}/"));
                Listing::from_feed(svc.feeds.fetch_feed(&url).await?, gateway)
            }
            Err(err) => return Err(err),
        };
        (listing, Some(cid))
    } else {
        (Listing::from_feed(svc.feeds.fetch_feed(&address).await?, gateway), None)
    };

    let mut next = st.clone();
    let now = Utc::now();
    next.site.last_local_update_at = now;
    if let Some(cid) = &cid {
        next.site.resolved_cid = Some(cid.clone());
    }

    let stale = previous.is_some()
        && listing.kind == ListingKind::Manifest
        && listing.updated.is_some_and(|u| u <= st.site.updated);
    let applied = if stale {
        debug!("manifest not newer than local copy");
        None
    } else {
        if !listing.name.trim().is_empty() {
            next.site.core.name = listing.name.clone();
        }
        if !listing.about.trim().is_empty() {
            next.site.core.about = listing.about.clone();
        }
        next.site.updated = listing.updated.unwrap_or(now);
        Some(apply_listing(&mut next, &listing.items, listing.kind))
    };

    let articles_dir = svc.layout.followed_articles_dir(next.site.id());
    tokio::fs::create_dir_all(&articles_dir).await.at(&articles_dir)?;
    if let Some(applied) = &applied {
        for article in next.articles.iter().filter(|a| applied.dirty.contains(&a.id())) {
            store::save_followed_article(&svc.layout, article).await?;
        }
        for id in &applied.removed {
            store::delete_followed_article(&svc.layout, next.site.id(), *id).await?;
        }
        if let Some(avatar) = &listing.avatar {
            store::write_if_changed(&svc.layout.followed_avatar(next.site.id()), avatar).await?;
        }
    }
    store::save_followed_site(&svc.layout, &next.site).await?;
    *st = next;

    if let Some(cid) = &cid {
        if let Err(err) = svc.network.pin(cid).await {
            warn!(?err, cid = %cid, "failed to pin");
        }
        if let Some(old) = previous.as_ref().filter(|old| *old != cid) {
            if let Err(err) = svc.network.unpin(old).await {
                warn!(?err, cid = %old, "failed to unpin previous");
            }
        }
    }

    let report = applied.map(|a| a.report).unwrap_or_default();
    if !report.is_empty() {
        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            "followed site updated"
        );
    }
    Ok(UpdateReport {
        cid,
        changed: !report.is_empty(),
        created: report.created,
        updated: report.updated,
        deleted: report.deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_follow_targets() {
        let ipns = "k51qzi5uqu5dlvj2baxnqndepeb86cbk3ng7n3i46uzyxzyqj2xjonzllnv0v8";
        assert_eq!(
            classify_follow(&format!("planet://{ipns}")).unwrap(),
            (SourceKind::Native, ipns.to_string())
        );
        assert_eq!(
            classify_follow(" vitalik.eth ").unwrap(),
            (SourceKind::NameService, "vitalik.eth".to_string())
        );
        assert_eq!(
            classify_follow("https://example.com/feed.xml").unwrap().0,
            SourceKind::DnsFeed
        );
        assert!(matches!(
            classify_follow("not an address"),
            Err(PlanetError::InvalidAddress(_))
        ));
        assert!(classify_follow("planet://").is_err());
    }

    #[test]
    fn links_lose_gateway_and_cid_prefix() {
        let gw = "http://127.0.0.1:18181";
        let cid = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
        assert_eq!(normalize_link(&format!("{gw}/ipfs/{cid}/post/"), gw), "/post/");
        assert_eq!(normalize_link(" https://blog.example/a#x ", gw), "https://blog.example/a#x");
        assert_eq!(normalize_link("/ipfs/Qmshort/x", gw), "/ipfs/Qmshort/x");
    }

    fn incoming(link: &str, title: &str) -> Incoming {
        Incoming {
            id: None,
            link: link.into(),
            title: title.into(),
            content: format!("{title} body"),
            created: Utc::now(),
            attachments: Vec::new(),
            cids: BTreeMap::new(),
            video: None,
            audio: None,
            hero: None,
        }
    }

    fn planet() -> FollowedPlanet {
        let now = Utc::now();
        FollowedPlanet {
            site: FollowedSite {
                core: SiteCore::new("remote", ""),
                source_kind: SourceKind::DnsFeed,
                source_address: "https://example.com/feed".into(),
                resolved_cid: None,
                updated: now,
                last_local_update_at: now,
            },
            articles: Vec::new(),
        }
    }

    #[test]
    fn unchanged_items_are_not_dirty() {
        let mut p = planet();
        let items = vec![incoming("/a/", "A"), incoming("/b/", "B")];
        let first = apply_listing(&mut p, &items, ListingKind::Feed);
        assert_eq!(first.report.created, 2);
        let second = apply_listing(&mut p, &items, ListingKind::Feed);
        assert!(second.report.is_empty());
        assert!(second.dirty.is_empty());
    }

    #[test]
    fn body_change_refreshes_summary() {
        let mut p = planet();
        apply_listing(&mut p, &[incoming("/a/", "A")], ListingKind::Feed);
        let mut edited = incoming("/a/", "A");
        edited.content = "fresh words".into();
        let applied = apply_listing(&mut p, &[edited], ListingKind::Feed);
        assert_eq!(applied.report.updated, 1);
        assert_eq!(p.articles[0].summary.as_deref(), Some("fresh words"));
        assert!(p.articles[0].core.rendered_html.is_none());
    }

    #[test]
    fn remote_ids_are_reused_unless_taken() {
        let mut p = planet();
        let id = Uuid::new_v4();
        let mut a = incoming("/a/", "A");
        a.id = Some(id);
        apply_listing(&mut p, &[a.clone()], ListingKind::Manifest);
        assert_eq!(p.articles[0].id(), id);

        let mut b = incoming("/b/", "B");
        b.id = Some(id);
        apply_listing(&mut p, &[a, b], ListingKind::Manifest);
        assert_eq!(p.articles.len(), 2);
        assert_ne!(p.articles[0].id(), p.articles[1].id());
    }
}
