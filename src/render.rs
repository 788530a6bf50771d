//! Markdown and page rendering.

use once_cell::sync::Lazy;
use pulldown_cmark::{html, Event, Options, Parser, Tag, TagEnd};
use regex::Regex;

use crate::error::{PlanetError, Result};
use crate::wire::{PublicArticle, PublicSite};

pub const SUMMARY_LIMIT: usize = 280;

pub trait MarkdownRenderer: Send + Sync {
    fn render(&self, markdown: &str) -> String;
}

/// CommonMark with the GitHub extensions most posts rely on.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommonMarkRenderer;

impl MarkdownRenderer for CommonMarkRenderer {
    fn render(&self, markdown: &str) -> String {
        if markdown.trim().is_empty() {
            return String::new();
        }
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_FOOTNOTES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
        let parser = Parser::new_ext(markdown, options);
        let mut out = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut out, parser);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub name: String,
    /// Text-only posts get a generated `_cover.png`.
    pub requires_cover_image: bool,
    pub generate_nft_metadata: bool,
}

pub trait TemplateRenderer: Send + Sync {
    /// Look up a template by name; unknown names are `MissingTemplate`.
    fn template(&self, name: &str) -> Result<TemplateInfo>;

    fn render_article(&self, template: &str, site: &PublicSite, article: &PublicArticle) -> Result<String>;

    fn render_index(&self, template: &str, site: &PublicSite) -> Result<String>;

    /// Page listing the articles carrying one tag.
    fn render_tag(
        &self,
        template: &str,
        site: &PublicSite,
        label: &str,
        articles: &[&PublicArticle],
    ) -> Result<String>;

    /// `tags.html`: every tag with a link to its page.
    fn render_tags(&self, template: &str, site: &PublicSite, pages: &[(String, String)]) -> Result<String>;

    /// `archive.html`: articles grouped by month.
    fn render_archive(&self, template: &str, site: &PublicSite) -> Result<String>;
}

/// The two templates shipped with the daemon: `plain` and `croptop`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTemplates;

impl BuiltinTemplates {
    fn info(name: &str) -> Option<TemplateInfo> {
        match name {
            "plain" => Some(TemplateInfo {
                name: "plain".into(),
                requires_cover_image: false,
                generate_nft_metadata: false,
            }),
            "croptop" => Some(TemplateInfo {
                name: "croptop".into(),
                requires_cover_image: true,
                generate_nft_metadata: true,
            }),
            _ => None,
        }
    }
}

fn article_list<'a>(articles: impl IntoIterator<Item = &'a PublicArticle>) -> String {
    let mut list = String::from("<ul>\n");
    for article in articles {
        list.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            html_attr_escape(&article.link),
            html_escape(&article.title)
        ));
    }
    list.push_str("</ul>");
    list
}

fn page(site_name: &str, title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n<header><a href=\"/\">{}</a></header>\n{}\n</body>\n</html>\n",
        html_escape(title),
        html_escape(site_name),
        body
    )
}

impl TemplateRenderer for BuiltinTemplates {
    fn template(&self, name: &str) -> Result<TemplateInfo> {
        Self::info(name).ok_or_else(|| PlanetError::MissingTemplate(name.to_string()))
    }

    fn render_article(&self, template: &str, site: &PublicSite, article: &PublicArticle) -> Result<String> {
        let info = self.template(template)?;
        let mut body = format!("<article>\n<h1>{}</h1>\n", html_escape(&article.title));
        if let Some(hero) = &article.hero_image {
            body.push_str(&format!("<img class=\"hero\" src=\"{}\">\n", html_attr_escape(hero)));
        } else if info.requires_cover_image {
            body.push_str("<img class=\"cover\" src=\"_cover.png\">\n");
        }
        match &article.content_rendered {
            Some(rendered) => body.push_str(rendered),
            None => body.push_str(&format!("<p>{}</p>", html_escape(&article.content))),
        }
        if let Some(video) = &article.video_filename {
            body.push_str(&format!("\n<video controls src=\"{}\"></video>", html_attr_escape(video)));
        }
        if let Some(audio) = &article.audio_filename {
            body.push_str(&format!("\n<audio controls src=\"{}\"></audio>", html_attr_escape(audio)));
        }
        body.push_str(&format!(
            "\n<time datetime=\"{}\">{}</time>\n</article>",
            article.created.to_rfc3339(),
            article.created.format("%Y-%m-%d")
        ));
        Ok(page(&site.name, &article.title, &body))
    }

    fn render_index(&self, template: &str, site: &PublicSite) -> Result<String> {
        self.template(template)?;
        let body = format!(
            "<h1>{}</h1>\n<p>{}</p>\n{}",
            html_escape(&site.name),
            html_escape(&site.about),
            article_list(&site.articles)
        );
        Ok(page(&site.name, &site.name, &body))
    }

    fn render_tag(
        &self,
        template: &str,
        site: &PublicSite,
        label: &str,
        articles: &[&PublicArticle],
    ) -> Result<String> {
        self.template(template)?;
        let body = format!(
            "<h1>{}</h1>\n{}",
            html_escape(label),
            article_list(articles.iter().copied())
        );
        Ok(page(&site.name, &format!("{} - {}", site.name, label), &body))
    }

    fn render_tags(&self, template: &str, site: &PublicSite, pages: &[(String, String)]) -> Result<String> {
        self.template(template)?;
        let mut body = String::from("<h1>Tags</h1>\n<ul>\n");
        for (file, label) in pages {
            body.push_str(&format!(
                "<li><a href=\"{}\">{}</a></li>\n",
                html_attr_escape(file),
                html_escape(label)
            ));
        }
        body.push_str("</ul>");
        Ok(page(&site.name, &format!("{} - Tags", site.name), &body))
    }

    fn render_archive(&self, template: &str, site: &PublicSite) -> Result<String> {
        self.template(template)?;
        let mut body = String::from("<h1>Archive</h1>\n");
        let mut current: Option<String> = None;
        let mut section: Vec<&PublicArticle> = Vec::new();
        for article in &site.articles {
            let month = article.created.format("%B %Y").to_string();
            if current.as_deref() != Some(month.as_str()) {
                if let Some(done) = current.take() {
                    body.push_str(&format!("<h2>{}</h2>\n{}\n", done, article_list(section.drain(..))));
                }
                current = Some(month);
            }
            section.push(article);
        }
        if let Some(done) = current {
            body.push_str(&format!("<h2>{}</h2>\n{}\n", done, article_list(section.drain(..))));
        }
        Ok(page(&site.name, &format!("{} - Archive", site.name), &body))
    }
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn html_attr_escape(s: &str) -> String {
    html_escape(s).replace('"', "&quot;")
}

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"));

/// Plain text of a markdown or HTML body.
pub fn plain_text(body: &str) -> String {
    let without_tags = HTML_TAG.replace_all(body, " ");
    let mut buf = String::with_capacity(without_tags.len());
    let mut in_code_block = false;
    for event in Parser::new(&without_tags) {
        match event {
            Event::Text(t) | Event::Code(t) => buf.push_str(&t),
            Event::SoftBreak | Event::HardBreak => buf.push(' '),
            Event::Start(Tag::CodeBlock(_)) => in_code_block = true,
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
                buf.push(' ');
            }
            Event::Start(Tag::Paragraph) if !buf.is_empty() && !in_code_block => buf.push(' '),
            _ => {}
        }
    }
    buf.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain-text summary capped at [`SUMMARY_LIMIT`] characters plus `...`.
pub fn summarize(body: &str) -> String {
    let text = plain_text(body);
    if text.chars().count() <= SUMMARY_LIMIT {
        return text;
    }
    let truncated: String = text.chars().take(SUMMARY_LIMIT).collect();
    format!("{}...", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn site(articles: Vec<PublicArticle>) -> PublicSite {
        PublicSite {
            id: Uuid::new_v4(),
            name: "Mine & Yours".into(),
            about: "about".into(),
            publish_key: "k51".into(),
            created: Utc::now(),
            updated: None,
            articles,
            tags: None,
        }
    }

    fn article(title: &str, rendered: Option<&str>) -> PublicArticle {
        let id = Uuid::new_v4();
        PublicArticle {
            id,
            link: format!("/{id}/"),
            title: title.into(),
            content: "World".into(),
            created: Utc::now(),
            slug: None,
            external_link: None,
            content_rendered: rendered.map(str::to_string),
            has_video: None,
            video_filename: None,
            has_audio: None,
            audio_filename: None,
            audio_duration_seconds: None,
            audio_byte_length: None,
            attachments: None,
            hero_image: None,
            cids: None,
            tags: None,
            original_site_name: None,
            original_site_domain: None,
            original_post_id: None,
            original_post_date: None,
            pinned: None,
        }
    }

    #[test]
    fn markdown_renders_gfm_tables() {
        let html = CommonMarkRenderer.render("# Hi\n\n| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.contains("<h1>Hi</h1>"));
        assert!(html.contains("<table>"));
        assert_eq!(CommonMarkRenderer.render("   "), "");
    }

    #[test]
    fn unknown_template_is_missing() {
        let err = BuiltinTemplates.template("fancy").unwrap_err();
        assert!(matches!(err, PlanetError::MissingTemplate(name) if name == "fancy"));
        assert!(BuiltinTemplates.template("croptop").unwrap().generate_nft_metadata);
        assert!(!BuiltinTemplates.template("plain").unwrap().requires_cover_image);
    }

    #[test]
    fn article_page_contains_rendered_body() {
        let a = article("Hello", Some("<p>World</p>"));
        let html = BuiltinTemplates.render_article("plain", &site(vec![]), &a).unwrap();
        assert!(html.contains("<title>Hello</title>"));
        assert!(html.contains("<p>World</p>"));
        assert!(html.contains("Mine &amp; Yours"));
    }

    #[test]
    fn index_links_every_article() {
        let s = site(vec![article("One", None), article("<Two>", None)]);
        let html = BuiltinTemplates.render_index("croptop", &s).unwrap();
        assert!(html.contains(&s.articles[0].link));
        assert!(html.contains("&lt;Two&gt;"));
    }

    #[test]
    fn tag_and_archive_pages_list_their_articles() {
        let s = site(vec![article("One", None), article("Two", None)]);
        let tagged = [&s.articles[1]];
        let html = BuiltinTemplates.render_tag("plain", &s, "Rust & Co", &tagged).unwrap();
        assert!(html.contains("Rust &amp; Co"));
        assert!(html.contains(&s.articles[1].link));
        assert!(!html.contains(&s.articles[0].link));

        let pages = vec![("rust.html".to_string(), "Rust".to_string())];
        let tags = BuiltinTemplates.render_tags("plain", &s, &pages).unwrap();
        assert!(tags.contains("href=\"rust.html\""));

        let archive = BuiltinTemplates.render_archive("plain", &s).unwrap();
        let month = s.articles[0].created.format("%B %Y").to_string();
        assert_eq!(archive.matches(&format!("<h2>{month}</h2>")).count(), 1);
        assert!(archive.contains(&s.articles[0].link) && archive.contains(&s.articles[1].link));
        assert!(BuiltinTemplates.render_archive("fancy", &s).is_err());
    }

    #[test]
    fn summary_strips_markup_and_truncates() {
        assert_eq!(summarize("# Title\n\nSome **bold** <b>html</b>\ntext"), "Title Some bold html text");
        let long = "word ".repeat(100);
        let summary = summarize(&long);
        assert!(summary.ends_with("..."));
        assert!(summary.chars().count() <= SUMMARY_LIMIT + 3);
    }
}
