//! Domain records for sites and articles.
//!
//! Owned and followed variants share a core record (`SiteCore`, `ArticleCore`)
//! flattened into the variant struct. Articles refer to their site through
//! `site_id`; only the engines mutate a site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

const IMAGE_EXTENSIONS: &[&str] = &[
    ".avif", ".jpeg", ".jpg", ".png", ".webp", ".gif", ".tiff", ".heic",
];
const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".m4v", ".webm"];
const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".m4a", ".aac", ".wav", ".ogg"];
const MEDIA_EXTENSIONS: &[&str] = &[
    ".png", ".apng", ".jpeg", ".jpg", ".tiff", ".webp", ".gif", ".mp4", ".mov", ".pdf",
];

pub const COVER_IMAGE: &str = "_cover.png";
pub const VIDEO_THUMBNAIL: &str = "_videoThumbnail.png";
pub const GRID_PNG: &str = "_grid.png";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// IPNS key publishing a `planet.json` manifest.
    Native,
    /// ENS, .bit or DNSLink name; may carry a manifest or just a feed.
    NameService,
    /// Plain web feed fetched over HTTP(S).
    DnsFeed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Native => "native",
            SourceKind::NameService => "name_service",
            SourceKind::DnsFeed => "dns_feed",
        }
    }

    /// Whether the source publishes a content identifier we can cache.
    pub fn is_versioned(&self) -> bool {
        !matches!(self, SourceKind::DnsFeed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteCore {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub about: String,
    pub created: DateTime<Utc>,
}

impl SiteCore {
    pub fn new(name: impl Into<String>, about: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            about: about.into(),
            created: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnedSite {
    #[serde(flatten)]
    pub core: SiteCore,
    #[serde(rename = "ipns")]
    pub publish_key: String,
    pub updated: DateTime<Utc>,
    #[serde(rename = "templateName")]
    pub template_id: String,
    #[serde(default, rename = "lastPublished", skip_serializing_if = "Option::is_none")]
    pub last_published_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "lastPublishedCID", skip_serializing_if = "Option::is_none")]
    pub last_published_cid: Option<String>,
    #[serde(default, rename = "aggregation")]
    pub aggregation_sources: Vec<String>,
    #[serde(default, rename = "reuseOriginalID")]
    pub reuse_original_id: bool,
    #[serde(default, rename = "tags")]
    pub tag_index: BTreeMap<String, String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl OwnedSite {
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowedSite {
    #[serde(flatten)]
    pub core: SiteCore,
    #[serde(rename = "planetType")]
    pub source_kind: SourceKind,
    #[serde(rename = "link")]
    pub source_address: String,
    #[serde(default, rename = "cid", skip_serializing_if = "Option::is_none")]
    pub resolved_cid: Option<String>,
    /// `updated` as reported by the remote manifest.
    pub updated: DateTime<Utc>,
    #[serde(rename = "lastRetrieved")]
    pub last_local_update_at: DateTime<Utc>,
}

impl FollowedSite {
    pub fn id(&self) -> Uuid {
        self.core.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArticleCore {
    pub id: Uuid,
    pub title: String,
    #[serde(rename = "content")]
    pub body_markdown: String,
    #[serde(default, rename = "contentRendered", skip_serializing_if = "Option::is_none")]
    pub rendered_html: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default, rename = "starred", skip_serializing_if = "Option::is_none")]
    pub starred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default, rename = "cids")]
    pub attachment_cids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_filename: Option<String>,
    #[serde(default, rename = "heroImage", skip_serializing_if = "Option::is_none")]
    pub hero_image_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hero_image_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hero_image_height: Option<u32>,
}

impl ArticleCore {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            body_markdown: body.into(),
            rendered_html: None,
            created: Utc::now(),
            starred_at: None,
            attachments: Vec::new(),
            attachment_cids: BTreeMap::new(),
            video_filename: None,
            audio_filename: None,
            hero_image_filename: None,
            hero_image_width: None,
            hero_image_height: None,
        }
    }

    /// Replace the body; the cached HTML is dropped when the body changes.
    /// Returns whether anything changed.
    pub fn set_body(&mut self, body: &str) -> bool {
        if self.body_markdown == body {
            return false;
        }
        self.body_markdown = body.to_string();
        self.rendered_html = None;
        true
    }

    /// Replace the attachment list, keeping `attachment_cids` limited to the
    /// names still attached.
    pub fn set_attachments(&mut self, attachments: Vec<String>) -> bool {
        if self.attachments == attachments {
            return false;
        }
        self.attachments = attachments;
        self.prune_cids();
        true
    }

    /// Drop cached hashes for attachments whose bytes were replaced.
    pub fn forget_cids(&mut self, replaced: &[String]) {
        self.attachment_cids.retain(|name, _| !replaced.contains(name));
    }

    pub fn prune_cids(&mut self) {
        let attachments = &self.attachments;
        self.attachment_cids
            .retain(|name, _| attachments.iter().any(|a| a == name));
    }

    pub fn has_video(&self) -> bool {
        self.video_filename.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_filename.is_some()
    }

    pub fn image_attachments(&self) -> Vec<&str> {
        self.attachments
            .iter()
            .filter(|name| is_image(name))
            .map(String::as_str)
            .collect()
    }

    /// No image, video or document attachments.
    pub fn is_text_only(&self) -> bool {
        !self
            .attachments
            .iter()
            .any(|name| has_extension(name, MEDIA_EXTENSIONS))
    }
}

fn has_extension(name: &str, extensions: &[&str]) -> bool {
    let lower = name.to_ascii_lowercase();
    extensions.iter().any(|ext| lower.ends_with(ext))
}

pub fn is_image(name: &str) -> bool {
    has_extension(name, IMAGE_EXTENSIONS)
}

pub fn is_video(name: &str) -> bool {
    has_extension(name, VIDEO_EXTENSIONS)
}

pub fn is_audio(name: &str) -> bool {
    has_extension(name, AUDIO_EXTENSIONS)
}

pub fn mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" | "apng" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "heic" => "image/heic",
        "tiff" => "image/tiff",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/mp4",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnedArticle {
    #[serde(flatten)]
    pub core: ArticleCore,
    #[serde(default, rename = "planetID")]
    pub site_id: Uuid,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_link: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub is_included_in_navigation: bool,
    #[serde(default)]
    pub navigation_weight: i64,
    #[serde(default, rename = "pinned", skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_site_domain: Option<String>,
    #[serde(default, rename = "originalPostID", skip_serializing_if = "Option::is_none")]
    pub original_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_post_date: Option<DateTime<Utc>>,
}

impl OwnedArticle {
    pub fn new(site_id: Uuid, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), site_id, title, body)
    }

    pub fn with_id(
        id: Uuid,
        site_id: Uuid,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let mut core = ArticleCore::new(title, body);
        core.id = id;
        Self {
            core,
            site_id,
            link: canonical_link(id),
            slug: None,
            external_link: None,
            tags: BTreeMap::new(),
            is_included_in_navigation: false,
            navigation_weight: 1,
            pinned_at: None,
            original_site_name: None,
            original_site_domain: None,
            original_post_id: None,
            original_post_date: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// The slug when set and non-empty.
    pub fn slug(&self) -> Option<&str> {
        self.slug.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn is_aggregated(&self) -> bool {
        self.original_post_id.is_some()
    }
}

/// `/{id}/`, the id-based path every owned article is reachable under.
pub fn canonical_link(id: Uuid) -> String {
    format!("/{}/", id.to_string().to_uppercase())
}

/// Pinned articles first (most recently pinned on top), then newest first.
pub fn sort_owned(articles: &mut [OwnedArticle]) {
    articles.sort_by(|a, b| match (a.pinned_at, b.pinned_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.core.created.cmp(&a.core.created),
    });
}

/// Union of every article's tag map; later articles in the slice win on
/// conflicting labels.
pub fn consolidate_tags(articles: &[OwnedArticle]) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for article in articles {
        for (key, label) in &article.tags {
            tags.insert(key.clone(), label.clone());
        }
    }
    tags
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowedArticle {
    #[serde(flatten)]
    pub core: ArticleCore,
    #[serde(default, rename = "planetID")]
    pub site_id: Uuid,
    #[serde(rename = "link")]
    pub source_link: String,
    #[serde(default, rename = "read", skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl FollowedArticle {
    pub fn id(&self) -> Uuid {
        self.core.id
    }
}

/// A work-in-progress article kept outside the published set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: Uuid,
    #[serde(rename = "planetID")]
    pub site_id: Uuid,
    /// Set when the draft edits an existing article.
    #[serde(default, rename = "articleID", skip_serializing_if = "Option::is_none")]
    pub article_id: Option<Uuid>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub date: DateTime<Utc>,
}
