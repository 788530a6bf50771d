//! The site's own RSS 2.0 feeds: `rss.xml` for every post and `podcast.xml`
//! for posts with audio.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::{PlanetError, Result};
use crate::model::mime_type;
use crate::wire::{PublicArticle, PublicSite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    All,
    Podcast,
}

impl FeedKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            FeedKind::All => "rss.xml",
            FeedKind::Podcast => "podcast.xml",
        }
    }

    fn includes(&self, article: &PublicArticle) -> bool {
        match self {
            FeedKind::All => true,
            FeedKind::Podcast => article.audio_filename.is_some(),
        }
    }
}

/// Whether any article would appear in the podcast feed.
pub fn has_audio(site: &PublicSite) -> bool {
    site.articles.iter().any(|a| FeedKind::Podcast.includes(a))
}

fn xml_err(err: impl std::fmt::Display) -> PlanetError {
    PlanetError::Internal(format!("feed serialization: {err}"))
}

type XmlWriter = Writer<Vec<u8>>;

fn start(w: &mut XmlWriter, tag: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(tag))).map_err(xml_err)
}

fn end(w: &mut XmlWriter, tag: &str) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new(tag))).map_err(xml_err)
}

fn text_elem(w: &mut XmlWriter, tag: &str, text: &str) -> Result<()> {
    start(w, tag)?;
    w.write_event(Event::Text(BytesText::new(text))).map_err(xml_err)?;
    end(w, tag)
}

/// Absolute URL of a site-relative link under `root`.
fn absolute(root: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    format!("{}/{}", root.trim_end_matches('/'), link.trim_start_matches('/'))
}

/// Render `site` as RSS 2.0. Links are made absolute against `root`, the
/// address the published tree is served from.
pub fn render_feed(site: &PublicSite, root: &str, kind: FeedKind) -> Result<String> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    w.write_event(Event::Start(rss)).map_err(xml_err)?;
    start(&mut w, "channel")?;
    text_elem(&mut w, "title", &site.name)?;
    text_elem(&mut w, "link", &absolute(root, "/"))?;
    text_elem(&mut w, "description", &site.about)?;
    if let Some(updated) = site.updated {
        text_elem(&mut w, "lastBuildDate", &updated.to_rfc2822())?;
    }

    for article in site.articles.iter().filter(|a| kind.includes(a)) {
        let link = absolute(root, &article.link);
        start(&mut w, "item")?;
        text_elem(&mut w, "title", &article.title)?;
        text_elem(&mut w, "link", &link)?;
        text_elem(&mut w, "guid", &link)?;
        text_elem(&mut w, "pubDate", &article.created.to_rfc2822())?;
        let body = article.content_rendered.as_deref().unwrap_or(&article.content);
        text_elem(&mut w, "description", body)?;
        if kind == FeedKind::Podcast {
            if let Some(audio) = &article.audio_filename {
                let url = absolute(&link, audio);
                let length = article.audio_byte_length.unwrap_or(0).to_string();
                let mut enclosure = BytesStart::new("enclosure");
                enclosure.push_attribute(("url", url.as_str()));
                enclosure.push_attribute(("length", length.as_str()));
                enclosure.push_attribute(("type", mime_type(audio)));
                w.write_event(Event::Empty(enclosure)).map_err(xml_err)?;
            }
        }
        end(&mut w, "item")?;
    }

    end(&mut w, "channel")?;
    end(&mut w, "rss")?;
    String::from_utf8(w.into_inner()).map_err(xml_err)
}
