mod common;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use uuid::Uuid;

use common::{Harness, GATEWAY};
use planet_sync::engine::{NewArticle, OwnedHandle};
use planet_sync::feed::{Feed, FeedItem};
use planet_sync::ipfs::ContentNetwork;
use planet_sync::store::paths::id_dir;

const KEY: &str = "k51qzi5uqu5dlvj2baxnqndepeb86cbk3ng7n3i46uzyxzyqj2xjonzllnv0v8";

struct Post {
    id: Uuid,
    title: &'static str,
    attachments: Vec<&'static str>,
}

fn manifest(posts: &[Post]) -> serde_json::Value {
    let articles: Vec<_> = posts
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "link": format!("/{}/", id_dir(p.id)),
                "title": p.title,
                "content": format!("{} body", p.title),
                "created": "2024-02-01T10:00:00Z",
                "attachments": p.attachments,
            })
        })
        .collect();
    json!({
        "id": Uuid::new_v4(),
        "name": "Source planet",
        "ipns": KEY,
        "created": "2023-01-01T00:00:00Z",
        "articles": articles,
    })
}

async fn serve(h: &Harness, posts: &[Post]) {
    h.feeds
        .set_json(&format!("{GATEWAY}/ipns/{KEY}/planet.json"), &manifest(posts))
        .await;
    for post in posts {
        for name in &post.attachments {
            let url = format!("{GATEWAY}/ipns/{KEY}/{}/{name}", id_dir(post.id));
            h.feeds.set_bytes(&url, format!("bytes of {name}").into_bytes()).await;
        }
    }
}

async fn aggregating_site(h: &Harness, sources: Vec<String>, reuse: bool) -> OwnedHandle {
    let site = OwnedHandle::create(&h.svc, "Digest", "", "plain").await.unwrap();
    site.configure_aggregation(&h.svc, sources, reuse).await.unwrap();
    site
}

#[tokio::test]
async fn second_run_over_unchanged_source_adds_nothing() {
    let h = Harness::new();
    let posts = vec![
        Post { id: Uuid::new_v4(), title: "One", attachments: vec!["a.png"] },
        Post { id: Uuid::new_v4(), title: "Two", attachments: vec![] },
    ];
    serve(&h, &posts).await;
    let site = aggregating_site(&h, vec!["# planets".into(), KEY.into()], false).await;

    let first = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(first.new, 2);
    assert_eq!(first.attachments_written, 1);
    assert!(first.published.is_some());
    assert_eq!(h.network.count("add").await, 1);

    let (_, articles) = site.snapshot().await;
    let one = articles.iter().find(|a| a.core.title == "One").unwrap();
    assert_ne!(one.id(), posts[0].id);
    assert_eq!(one.original_site_domain.as_deref(), Some(KEY));
    assert_eq!(one.original_site_name.as_deref(), Some("Source planet"));
    assert_eq!(one.original_post_id.as_deref(), Some(id_dir(posts[0].id).as_str()));
    assert!(h.layout().public_article_dir(site.id(), one.id()).join("a.png").exists());

    let second = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(second.new, 0);
    assert_eq!(second.updated, 0);
    assert!(second.published.is_none());
    assert_eq!(h.network.count("add").await, 1);
}

#[tokio::test]
async fn identical_attachment_is_not_rewritten() {
    let h = Harness::new();
    let id = Uuid::new_v4();
    serve(&h, &[Post { id, title: "One", attachments: vec!["a.png"] }]).await;
    let site = aggregating_site(&h, vec![KEY.into()], false).await;
    site.aggregate(&h.svc).await.unwrap();

    serve(&h, &[Post { id, title: "One, revised", attachments: vec!["a.png"] }]).await;
    let report = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.attachments_written, 0);
    assert!(report.published.is_none());
    let (_, articles) = site.snapshot().await;
    assert_eq!(articles[0].core.title, "One, revised");
}

#[tokio::test]
async fn dropped_source_posts_are_deleted_but_own_posts_stay() {
    let h = Harness::new();
    let (keep, drop) = (Uuid::new_v4(), Uuid::new_v4());
    serve(
        &h,
        &[
            Post { id: keep, title: "Keep", attachments: vec![] },
            Post { id: drop, title: "Drop", attachments: vec![] },
        ],
    )
    .await;
    let site = aggregating_site(&h, vec![KEY.into()], false).await;
    let mine = site
        .compose_article(
            &h.svc,
            NewArticle {
                title: "Mine".into(),
                body: "hand written".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    site.aggregate(&h.svc).await.unwrap();
    assert_eq!(site.snapshot().await.1.len(), 3);

    serve(&h, &[Post { id: keep, title: "Keep", attachments: vec![] }]).await;
    let report = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(report.deleted, 1);
    let (_, articles) = site.snapshot().await;
    let titles: Vec<_> = articles.iter().map(|a| a.core.title.as_str()).collect();
    assert!(titles.contains(&"Keep"));
    assert!(!titles.contains(&"Drop"));
    assert!(articles.iter().any(|a| a.id() == mine));

    let removed = site.delete_posts_from_domain(&h.svc, KEY).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(site.snapshot().await.1.len(), 1);
}

#[tokio::test]
async fn reuse_original_id_keeps_remote_ids() {
    let h = Harness::new();
    let id = Uuid::new_v4();
    serve(&h, &[Post { id, title: "Same id", attachments: vec![] }]).await;
    let site = aggregating_site(&h, vec![KEY.into()], true).await;
    site.aggregate(&h.svc).await.unwrap();
    assert_eq!(site.snapshot().await.1[0].id(), id);
}

#[tokio::test]
async fn feed_items_get_social_images_and_failing_sources_are_counted() {
    let h = Harness::new();
    let feed_url = "https://blog.example/feed.xml";
    h.feeds
        .set_feed(
            feed_url,
            Feed {
                name: "Blog".into(),
                about: String::new(),
                avatar: None,
                articles: vec![
                    FeedItem {
                        link: "https://blog.example/post-1".into(),
                        title: "Post 1".into(),
                        content: "<p>hello</p>".into(),
                        created: Utc::now(),
                        image_url: None,
                    },
                    FeedItem {
                        link: "https://www.youtube.com/watch?v=abc123".into(),
                        title: "Video".into(),
                        content: String::new(),
                        created: Utc::now(),
                        image_url: None,
                    },
                ],
            },
        )
        .await;
    h.feeds
        .set_bytes(
            "https://blog.example/post-1",
            r#"<html><head><meta property="og:image" content="/img/cover.png"></head></html>"#,
        )
        .await;
    h.feeds.set_bytes("https://blog.example/img/cover.png", b"png".to_vec()).await;
    h.feeds
        .set_bytes("https://img.youtube.com/vi/abc123/maxresdefault.jpg", b"jpg".to_vec())
        .await;

    let sources = vec![
        feed_url.to_string(),
        "https://gone.example/feed.xml".to_string(),
        "nonsense".to_string(),
    ];
    let site = aggregating_site(&h, sources, false).await;
    let report = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(report.new, 2);
    assert_eq!(report.failed_sources, 1);
    assert_eq!(report.attachments_written, 2);

    let (_, articles) = site.snapshot().await;
    let post = articles.iter().find(|a| a.core.title == "Post 1").unwrap();
    assert_eq!(post.core.hero_image_filename.as_deref(), Some("cover.png"));
    assert_eq!(post.original_site_domain.as_deref(), Some("blog.example"));
    assert_eq!(post.external_link.as_deref(), Some("https://blog.example/post-1"));
    let video = articles.iter().find(|a| a.core.title == "Video").unwrap();
    assert_eq!(video.core.attachments, vec!["abc123_maxresdefault.jpg".to_string()]);

    let again = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(again.new, 0);
}

#[tokio::test]
async fn overlapping_aggregation_is_skipped() {
    let h = Harness::new();
    serve(&h, &[Post { id: Uuid::new_v4(), title: "One", attachments: vec![] }]).await;
    let site = Arc::new(aggregating_site(&h, vec![KEY.into()], false).await);
    let gate = h.network.block_adds().await;

    let first = {
        let site = site.clone();
        let svc = h.svc.clone();
        tokio::spawn(async move { site.aggregate(&svc).await })
    };
    for _ in 0..200 {
        if h.network.count("add").await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(site.aggregate(&h.svc).await.unwrap().is_none());

    gate.notify_one();
    let first = first.await.unwrap().unwrap().unwrap();
    assert_eq!(first.new, 1);
    assert!(first.published.is_some());
    let again = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(again.new, 0);
    assert_eq!(site.snapshot().await.1.len(), 1);
}

#[tokio::test]
async fn changed_remote_attachment_is_remirrored_with_fresh_cid() {
    let h = Harness::new();
    let id = Uuid::new_v4();
    serve(&h, &[Post { id, title: "One", attachments: vec!["a.png"] }]).await;
    let site = aggregating_site(&h, vec![KEY.into()], false).await;
    site.aggregate(&h.svc).await.unwrap();
    let (_, articles) = site.snapshot().await;
    let local = articles[0].id();
    let before = articles[0].core.attachment_cids["a.png"].clone();

    serve(&h, &[Post { id, title: "One, revised", attachments: vec!["a.png"] }]).await;
    let url = format!("{GATEWAY}/ipns/{KEY}/{}/a.png", id_dir(id));
    h.feeds.set_bytes(&url, b"redrawn picture".to_vec()).await;
    let report = site.aggregate(&h.svc).await.unwrap().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.attachments_written, 1);

    let file = h.layout().public_article_dir(site.id(), local).join("a.png");
    assert_eq!(std::fs::read(&file).unwrap(), b"redrawn picture");
    let (_, articles) = site.snapshot().await;
    let after = articles[0].core.attachment_cids["a.png"].clone();
    assert_ne!(after, before);
    assert_eq!(after, h.network.file_hash(&file).await.unwrap());
}
