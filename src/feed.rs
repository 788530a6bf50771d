//! Generic web feed client: fetches URLs and decodes RSS 2.0, Atom and JSON
//! Feed documents into a normalised [`Feed`].
//!
//! XML is read with `quick-xml`'s event reader; HTML pages are searched for
//! a `<link rel="alternate">` feed and for Open Graph images.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config;
use crate::error::{PlanetError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub name: String,
    pub about: String,
    pub avatar: Option<Vec<u8>>,
    pub articles: Vec<FeedItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub link: String,
    pub title: String,
    pub content: String,
    pub created: DateTime<Utc>,
    /// Image advertised by the item itself (enclosure, media thumbnail).
    pub image_url: Option<String>,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let bytes = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fetch and decode the feed at `url`, following one `rel="alternate"`
    /// hop when `url` is an HTML page.
    async fn fetch_feed(&self, url: &str) -> Result<Feed>;
}

#[derive(Clone)]
pub struct HttpFeedClient {
    http: Client,
}

impl fmt::Debug for HttpFeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeedClient").finish_non_exhaustive()
    }
}

impl HttpFeedClient {
    pub fn from_config(cfg: &config::Http) -> Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self { http })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "fetching");
        let res = self.http.get(url).send().await?;
        let status = res.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PlanetError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(PlanetError::Network(format!("GET {url} returned {status}")));
        }
        Ok(res.bytes().await?.to_vec())
    }

    async fn fetch_avatar(&self, url: Option<String>) -> Option<Vec<u8>> {
        let url = url?;
        match self.get(&url).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(err) => {
                debug!(?err, url, "feed avatar unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedClient {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.get(url).await
    }

    async fn fetch_feed(&self, url: &str) -> Result<Feed> {
        let base = Url::parse(url).map_err(|_| PlanetError::InvalidAddress(url.to_string()))?;
        let bytes = self.get(url).await?;
        let (doc, base) = match parse_document(&bytes, &base)? {
            Document::Html(html) => {
                let alternate = discover_feed_url(&html, &base).ok_or_else(|| {
                    PlanetError::RemoteProtocol(format!("no feed advertised at {url}"))
                })?;
                let alt_base = Url::parse(&alternate)
                    .map_err(|_| PlanetError::RemoteProtocol(format!("bad feed link {alternate}")))?;
                let bytes = self.get(&alternate).await?;
                match parse_document(&bytes, &alt_base)? {
                    Document::Feed(doc) => (doc, alt_base),
                    Document::Html(_) => {
                        return Err(PlanetError::RemoteProtocol(format!(
                            "{alternate} is not a feed"
                        )))
                    }
                }
            }
            Document::Feed(doc) => (doc, base),
        };
        let avatar_url = doc.avatar_url.as_deref().and_then(|a| absolutize(&base, a));
        let avatar = self.fetch_avatar(avatar_url).await;
        Ok(Feed {
            name: doc.name,
            about: doc.about,
            avatar,
            articles: doc.items,
        })
    }
}

/// A decoded feed before the avatar is fetched.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedFeed {
    pub name: String,
    pub about: String,
    pub avatar_url: Option<String>,
    pub items: Vec<FeedItem>,
}

#[derive(Debug)]
pub enum Document {
    Feed(ParsedFeed),
    Html(String),
}

/// Sniff and decode a fetched document.
pub fn parse_document(bytes: &[u8], base: &Url) -> Result<Document> {
    let text = String::from_utf8_lossy(bytes);
    let head = text.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with('{') {
        return parse_json_feed(head, base).map(Document::Feed);
    }
    let lower: String = head.chars().take(512).collect::<String>().to_ascii_lowercase();
    if lower.starts_with("<!doctype html") || lower.starts_with("<html") || lower.contains("<head") {
        return Ok(Document::Html(head.to_string()));
    }
    parse_xml_feed(head.as_bytes(), base).map(Document::Feed)
}

#[derive(Debug, Deserialize)]
struct JsonFeed {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    favicon: Option<String>,
    #[serde(default)]
    items: Vec<JsonFeedItem>,
}

#[derive(Debug, Deserialize)]
struct JsonFeedItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content_html: Option<String>,
    #[serde(default)]
    content_text: Option<String>,
    #[serde(default)]
    date_published: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

fn parse_json_feed(text: &str, base: &Url) -> Result<ParsedFeed> {
    let feed: JsonFeed = serde_json::from_str(text)
        .map_err(|err| PlanetError::RemoteProtocol(format!("invalid JSON feed: {err}")))?;
    let items = feed
        .items
        .into_iter()
        .filter_map(|item| {
            let raw = item.url.or(item.id)?;
            let link = absolutize(base, &raw)?;
            Some(FeedItem {
                link,
                title: item.title.unwrap_or_default(),
                content: item.content_html.or(item.content_text).unwrap_or_default(),
                created: item
                    .date_published
                    .as_deref()
                    .and_then(parse_date)
                    .unwrap_or_else(Utc::now),
                image_url: item.image.and_then(|i| absolutize(base, &i)),
            })
        })
        .collect();
    Ok(ParsedFeed {
        name: feed.title,
        about: feed.description,
        avatar_url: feed.icon.or(feed.favicon),
        items,
    })
}

#[derive(Default)]
struct ItemBuilder {
    link: Option<String>,
    guid: Option<String>,
    title: String,
    description: String,
    content: String,
    date: Option<String>,
    image_url: Option<String>,
}

impl ItemBuilder {
    fn finish(self, base: &Url) -> Option<FeedItem> {
        let raw = self.link.or(self.guid)?;
        let link = absolutize(base, &raw)?;
        let content = if self.content.trim().is_empty() {
            self.description
        } else {
            self.content
        };
        Some(FeedItem {
            link,
            title: self.title.trim().to_string(),
            content,
            created: self.date.as_deref().and_then(parse_date).unwrap_or_else(Utc::now),
            image_url: self.image_url.and_then(|u| absolutize(base, &u)),
        })
    }
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

fn attr(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.try_get_attribute(key)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Handle attributes carried on start or empty tags inside an item.
fn item_attributes(item: &mut ItemBuilder, local: &[u8], e: &BytesStart<'_>) {
    match local {
        b"link" => {
            let rel = attr(e, "rel");
            if matches!(rel.as_deref(), None | Some("alternate")) {
                if let Some(href) = attr(e, "href") {
                    item.link.get_or_insert(href);
                }
            }
        }
        b"enclosure" | b"content" | b"thumbnail" => {
            let is_image = attr(e, "type").map_or(local == b"thumbnail", |t| t.starts_with("image/"))
                || attr(e, "medium").as_deref() == Some("image");
            if is_image {
                if let Some(url) = attr(e, "url") {
                    item.image_url.get_or_insert(url);
                }
            }
        }
        _ => {}
    }
}

/// Decode RSS 2.0 or Atom.
pub fn parse_xml_feed(xml: &[u8], base: &Url) -> Result<ParsedFeed> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut feed = ParsedFeed::default();
    let mut saw_root = false;
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut item: Option<ItemBuilder> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| PlanetError::RemoteProtocol(format!("invalid feed XML: {err}")))?;
        match event {
            Event::Start(ref e) => {
                let local = local_name(e.name().as_ref()).to_vec();
                match local.as_slice() {
                    b"rss" | b"feed" | b"RDF" => saw_root = true,
                    b"item" | b"entry" => item = Some(ItemBuilder::default()),
                    _ => {}
                }
                if let Some(item) = item.as_mut() {
                    item_attributes(item, &local, e);
                }
                stack.push(local);
            }
            Event::Empty(ref e) => {
                let local = local_name(e.name().as_ref()).to_vec();
                if let Some(item) = item.as_mut() {
                    item_attributes(item, &local, e);
                }
            }
            Event::End(ref e) => {
                let local = local_name(e.name().as_ref()).to_vec();
                if matches!(local.as_slice(), b"item" | b"entry") {
                    if let Some(done) = item.take().and_then(|i| i.finish(base)) {
                        feed.items.push(done);
                    }
                }
                stack.pop();
            }
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map_err(|err| PlanetError::RemoteProtocol(format!("invalid feed text: {err}")))?
                    .into_owned();
                apply_text(&mut feed, item.as_mut(), &stack, text);
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                apply_text(&mut feed, item.as_mut(), &stack, text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(PlanetError::RemoteProtocol("document is not an RSS or Atom feed".into()));
    }
    Ok(feed)
}

fn apply_text(feed: &mut ParsedFeed, item: Option<&mut ItemBuilder>, stack: &[Vec<u8>], text: String) {
    let Some(current) = stack.last() else {
        return;
    };
    let parent = stack.len().checked_sub(2).and_then(|i| stack.get(i));
    match item {
        Some(item) => match current.as_slice() {
            b"title" => item.title.push_str(&text),
            b"link" => {
                item.link.get_or_insert(text);
            }
            b"guid" | b"id" => {
                if text.starts_with("http://") || text.starts_with("https://") {
                    item.guid.get_or_insert(text);
                }
            }
            b"description" | b"summary" => item.description.push_str(&text),
            b"encoded" | b"content" => item.content.push_str(&text),
            b"pubDate" | b"published" | b"date" => {
                item.date = Some(text);
            }
            b"updated" => {
                item.date.get_or_insert(text);
            }
            _ => {}
        },
        None => match (parent.map(Vec::as_slice), current.as_slice()) {
            (Some(b"channel") | Some(b"feed"), b"title") => feed.name.push_str(&text),
            (Some(b"channel"), b"description") | (Some(b"feed"), b"subtitle") => {
                feed.about.push_str(&text)
            }
            (Some(b"image"), b"url") | (Some(b"feed"), b"icon") => {
                feed.avatar_url.get_or_insert(text);
            }
            (Some(b"feed"), b"logo") => {
                feed.avatar_url.get_or_insert(text);
            }
            _ => {}
        },
    }
}

pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// Resolve `raw` against `base`, trimming whitespace and dropping any
/// fragment. Returns `None` for unusable links.
pub fn absolutize(base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = base.join(raw).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}

static LINK_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<link\b[^>]*>").expect("static regex")
});
static META_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<meta\b[^>]*>").expect("static regex")
});
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z:_-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("static regex")
});

fn tag_attrs(tag: &str) -> Vec<(String, String)> {
    ATTR.captures_iter(tag)
        .map(|c| {
            let key = c[1].to_ascii_lowercase();
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (key, value.to_string())
        })
        .collect()
}

fn find_attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// First `<link rel="alternate">` advertising an RSS, Atom or JSON feed.
pub fn discover_feed_url(html: &str, base: &Url) -> Option<String> {
    const FEED_TYPES: &[&str] = &[
        "application/rss+xml",
        "application/atom+xml",
        "application/feed+json",
        "application/json",
    ];
    LINK_TAG.find_iter(html).find_map(|m| {
        let attrs = tag_attrs(m.as_str());
        let rel = find_attr(&attrs, "rel")?.to_ascii_lowercase();
        let kind = find_attr(&attrs, "type")?.to_ascii_lowercase();
        if !rel.split_whitespace().any(|r| r == "alternate") || !FEED_TYPES.contains(&kind.as_str()) {
            return None;
        }
        absolutize(base, find_attr(&attrs, "href")?)
    })
}

/// `og:image` (or `twitter:image`) of an HTML page.
pub fn og_image(html: &str, base: &Url) -> Option<String> {
    let mut fallback = None;
    for m in META_TAG.find_iter(html) {
        let attrs = tag_attrs(m.as_str());
        let key = find_attr(&attrs, "property")
            .or_else(|| find_attr(&attrs, "name"))
            .map(str::to_ascii_lowercase);
        let Some(content) = find_attr(&attrs, "content") else {
            continue;
        };
        match key.as_deref() {
            Some("og:image") => return absolutize(base, content),
            Some("twitter:image") if fallback.is_none() => fallback = absolutize(base, content),
            _ => {}
        }
    }
    if fallback.is_none() {
        debug!(base = %base, "page has no social image");
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/blog/").unwrap()
    }

    #[test]
    fn parses_rss_channel_and_items() {
        let xml = br#"<?xml version="1.0"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Example Blog</title>
    <description>Notes &amp; essays</description>
    <image><url>https://example.com/logo.png</url></image>
    <item>
      <title>Second</title>
      <link> https://example.com/blog/second#comments </link>
      <description>short</description>
      <content:encoded><![CDATA[<p>Full <b>body</b></p>]]></content:encoded>
      <pubDate>Tue, 02 Jan 2024 10:00:00 +0000</pubDate>
      <enclosure url="/img/second.jpg" type="image/jpeg" length="1"/>
    </item>
    <item>
      <title>First</title>
      <link>/blog/first</link>
      <description>only summary</description>
    </item>
  </channel>
</rss>"#;
        let feed = parse_xml_feed(xml, &base()).unwrap();
        assert_eq!(feed.name, "Example Blog");
        assert_eq!(feed.about, "Notes & essays");
        assert_eq!(feed.avatar_url.as_deref(), Some("https://example.com/logo.png"));
        assert_eq!(feed.items.len(), 2);
        let second = &feed.items[0];
        assert_eq!(second.link, "https://example.com/blog/second");
        assert_eq!(second.content, "<p>Full <b>body</b></p>");
        assert_eq!(second.created.to_rfc3339(), "2024-01-02T10:00:00+00:00");
        assert_eq!(second.image_url.as_deref(), Some("https://example.com/img/second.jpg"));
        assert_eq!(feed.items[1].link, "https://example.com/blog/first");
        assert_eq!(feed.items[1].content, "only summary");
    }

    #[test]
    fn parses_atom_entries() {
        let xml = br#"<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Site</title>
  <subtitle>about</subtitle>
  <icon>/favicon.png</icon>
  <entry>
    <title>Entry</title>
    <link rel="replies" href="https://example.com/entry/comments"/>
    <link href="https://example.com/entry"/>
    <id>urn:uuid:1</id>
    <updated>2024-03-01T00:00:00Z</updated>
    <content type="html">&lt;p&gt;hi&lt;/p&gt;</content>
  </entry>
</feed>"#;
        let feed = parse_xml_feed(xml, &base()).unwrap();
        assert_eq!(feed.name, "Atom Site");
        assert_eq!(feed.about, "about");
        assert_eq!(feed.avatar_url.as_deref(), Some("/favicon.png"));
        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].link, "https://example.com/entry");
        assert_eq!(feed.items[0].content, "<p>hi</p>");
    }

    #[test]
    fn parses_json_feed() {
        let json = br#"{
            "version": "https://jsonfeed.org/version/1.1",
            "title": "JSON Site",
            "icon": "https://example.com/icon.png",
            "items": [
                {"id": "1", "url": "https://example.com/a", "title": "A", "content_html": "<p>a</p>", "date_published": "2024-01-01T00:00:00Z"},
                {"id": "no-url"}
            ]
        }"#;
        let Document::Feed(feed) = parse_document(json, &base()).unwrap() else {
            panic!("expected feed");
        };
        assert_eq!(feed.name, "JSON Site");
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].content, "<p>a</p>");
        assert_eq!(feed.items[1].link, "https://example.com/blog/no-url");
    }

    #[test]
    fn html_is_detected_and_feed_discovered() {
        let html = br#"<!DOCTYPE html><html><head>
<link rel="stylesheet" href="/style.css">
<link rel="alternate" type="application/rss+xml" title="RSS" href="/feed.xml">
</head><body></body></html>"#;
        let doc = parse_document(html, &base()).unwrap();
        let Document::Html(text) = doc else {
            panic!("expected html");
        };
        assert_eq!(
            discover_feed_url(&text, &base()).as_deref(),
            Some("https://example.com/feed.xml")
        );
    }

    #[test]
    fn og_image_prefers_open_graph() {
        let html = r#"<meta name="twitter:image" content="/tw.png">
<meta property="og:image" content="https://cdn.example.com/og.png" />"#;
        assert_eq!(og_image(html, &base()).as_deref(), Some("https://cdn.example.com/og.png"));
        let html = r#"<meta name='twitter:image' content='/tw.png'>"#;
        assert_eq!(og_image(html, &base()).as_deref(), Some("https://example.com/tw.png"));
    }

    #[test]
    fn non_feed_xml_is_rejected() {
        let err = parse_xml_feed(b"<note><to>x</to></note>", &base()).unwrap_err();
        assert!(matches!(err, PlanetError::RemoteProtocol(_)));
    }
}
