//! Serialization-stable projections written into the public tree and read
//! back when following a native site.
//!
//! Readers must accept older manifests: every field beyond the identity of
//! an article (`id`, `link`, `title`, `content`, `created`) is optional.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::model::{OwnedArticle, OwnedSite};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicSite {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub about: String,
    #[serde(default, rename = "ipns", alias = "publishKey")]
    pub publish_key: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub articles: Vec<PublicArticle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicArticle {
    pub id: Uuid,
    pub link: String,
    pub title: String,
    pub content: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_rendered: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_video: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_filename: Option<String>,
    #[serde(
        default,
        rename = "audioDuration",
        alias = "audioDurationSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub audio_duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_byte_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hero_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cids: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_site_domain: Option<String>,
    #[serde(default, rename = "originalPostID", skip_serializing_if = "Option::is_none")]
    pub original_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_post_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<DateTime<Utc>>,
}

impl PublicArticle {
    /// Attachments as listed, or the video alone for manifests written
    /// before attachment lists existed.
    pub fn effective_attachments(&self) -> Vec<String> {
        match &self.attachments {
            Some(list) if !list.is_empty() => list.clone(),
            _ => self.video_filename.iter().cloned().collect(),
        }
    }
}

impl From<&OwnedArticle> for PublicArticle {
    fn from(article: &OwnedArticle) -> Self {
        let core = &article.core;
        let link = match article.slug() {
            Some(slug) => format!("/{slug}/"),
            None => article.link.clone(),
        };
        Self {
            id: core.id,
            link,
            title: core.title.clone(),
            content: core.body_markdown.clone(),
            created: core.created,
            slug: article.slug().map(str::to_string),
            external_link: article.external_link.clone(),
            content_rendered: core.rendered_html.clone(),
            has_video: Some(core.has_video()),
            video_filename: core.video_filename.clone(),
            has_audio: Some(core.has_audio()),
            audio_filename: core.audio_filename.clone(),
            audio_duration_seconds: None,
            audio_byte_length: None,
            attachments: Some(core.attachments.clone()),
            hero_image: core.hero_image_filename.clone(),
            cids: Some(core.attachment_cids.clone()),
            tags: Some(article.tags.clone()),
            original_site_name: article.original_site_name.clone(),
            original_site_domain: article.original_site_domain.clone(),
            original_post_id: article.original_post_id.clone(),
            original_post_date: article.original_post_date,
            pinned: article.pinned_at,
        }
    }
}

impl PublicSite {
    pub fn from_owned(site: &OwnedSite, articles: &[OwnedArticle]) -> Self {
        Self {
            id: site.core.id,
            name: site.core.name.clone(),
            about: site.core.about.clone(),
            publish_key: site.publish_key.clone(),
            created: site.core.created,
            updated: Some(site.updated),
            articles: articles.iter().map(PublicArticle::from).collect(),
            tags: Some(site.tag_index.clone()),
        }
    }
}

/// The richer `planet.json` written into a backup bundle: the full site
/// record plus every article with all of its local fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupManifest {
    #[serde(flatten)]
    pub site: OwnedSite,
    #[serde(default)]
    pub articles: Vec<OwnedArticle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NftAttribute {
    pub trait_type: String,
    pub value: String,
}

/// ERC-721 style metadata written as `nft.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NftMetadata {
    pub name: String,
    pub description: String,
    pub image: String,
    pub external_url: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_url: Option<String>,
    pub attributes: Vec<NftAttribute>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SiteCore;

    #[test]
    fn older_manifest_fills_defaults() {
        let json = r#"{
            "id": "6F1E3C64-6E7A-4C0B-9F6B-2B7C1B0C4C11",
            "name": "Old",
            "created": "2022-01-01T00:00:00Z",
            "articles": [{
                "id": "0B0A5B1E-0D9B-4B07-9F7E-3C1C7F5E9A01",
                "link": "/0B0A5B1E-0D9B-4B07-9F7E-3C1C7F5E9A01/",
                "title": "First",
                "content": "Hi",
                "created": "2022-01-02T00:00:00Z",
                "videoFilename": "clip.mp4"
            }]
        }"#;
        let site: PublicSite = serde_json::from_str(json).unwrap();
        assert_eq!(site.about, "");
        assert_eq!(site.publish_key, "");
        assert!(site.updated.is_none());
        let article = &site.articles[0];
        assert!(article.tags.is_none());
        assert!(article.cids.is_none());
        assert_eq!(article.effective_attachments(), vec!["clip.mp4".to_string()]);
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let json = r#"{
            "id": "6F1E3C64-6E7A-4C0B-9F6B-2B7C1B0C4C11",
            "name": "Legacy",
            "publishKey": "k51abc",
            "created": "2022-01-01T00:00:00Z",
            "articles": [{
                "id": "0B0A5B1E-0D9B-4B07-9F7E-3C1C7F5E9A01",
                "link": "/x/",
                "title": "Pod",
                "content": "",
                "created": "2022-01-02T00:00:00Z",
                "audioDurationSeconds": 93
            }]
        }"#;
        let site: PublicSite = serde_json::from_str(json).unwrap();
        assert_eq!(site.publish_key, "k51abc");
        assert_eq!(site.articles[0].audio_duration_seconds, Some(93));
    }

    #[test]
    fn slug_becomes_public_link() {
        let mut article = OwnedArticle::new(Uuid::new_v4(), "Hello", "World");
        article.slug = Some("hello".into());
        let public = PublicArticle::from(&article);
        assert_eq!(public.link, "/hello/");
        assert_eq!(public.slug.as_deref(), Some("hello"));

        article.slug = Some("  ".into());
        let public = PublicArticle::from(&article);
        assert_eq!(public.link, article.link);
        assert!(public.slug.is_none());
    }

    #[test]
    fn backup_manifest_keeps_local_fields() {
        let site = OwnedSite {
            core: SiteCore::new("Mine", ""),
            publish_key: "k51".into(),
            updated: Utc::now(),
            template_id: "plain".into(),
            last_published_at: None,
            last_published_cid: None,
            aggregation_sources: vec!["k51src".into()],
            reuse_original_id: false,
            tag_index: BTreeMap::new(),
            archived: true,
            archived_at: Some(Utc::now()),
        };
        let mut article = OwnedArticle::new(site.id(), "A", "B");
        article.pinned_at = Some(Utc::now());
        article.original_site_domain = Some("other.eth".into());
        let manifest = BackupManifest {
            site,
            articles: vec![article],
        };
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["archived"], true);
        assert_eq!(value["aggregation"][0], "k51src");
        assert!(value["articles"][0]["pinned"].is_string());
        let back: BackupManifest = serde_json::from_value(value).unwrap();
        assert_eq!(back, manifest);
    }
}
