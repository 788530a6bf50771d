//! Owned-site, followed-site and aggregation engines.
//!
//! Every engine operation takes the shared [`Services`] context, built once
//! at start-up, instead of reaching for process-wide singletons.

pub mod aggregate;
pub mod followed;
pub mod owned;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::feed::{FeedSource, HttpFeedClient};
use crate::ipfs::{ContentNetwork, KuboClient};
use crate::media::{FfmpegMedia, MediaProcessor};
use crate::render::{BuiltinTemplates, CommonMarkRenderer, MarkdownRenderer, TemplateRenderer};
use crate::store::Layout;

pub use aggregate::{AggregationReport, SourceRef};
pub use followed::{FollowedHandle, UpdateReport};
pub use owned::{ArticleEdit, NewArticle, OwnedHandle, PublishReport, RebuildReport};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Local gateway used to read remote manifests and attachments.
    pub gateway_url: String,
    pub publish_lifetime: Duration,
    pub max_concurrency: usize,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            gateway_url: cfg.ipfs.gateway_url.clone(),
            publish_lifetime: cfg.ipfs.publish_lifetime(),
            max_concurrency: cfg.app.max_concurrency,
        }
    }

    /// `{gateway}/{path}` with exactly one slash between the two.
    pub fn gateway(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.gateway_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Clone)]
pub struct Services {
    pub layout: Layout,
    pub network: Arc<dyn ContentNetwork>,
    pub feeds: Arc<dyn FeedSource>,
    pub markdown: Arc<dyn MarkdownRenderer>,
    pub templates: Arc<dyn TemplateRenderer>,
    pub media: Arc<dyn MediaProcessor>,
    pub settings: Settings,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("layout", &self.layout)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Services backed by the given network, feed and media collaborators and
    /// the built-in markdown and template renderers.
    pub fn new(
        layout: Layout,
        network: Arc<dyn ContentNetwork>,
        feeds: Arc<dyn FeedSource>,
        media: Arc<dyn MediaProcessor>,
        settings: Settings,
    ) -> Self {
        Self {
            layout,
            network,
            feeds,
            markdown: Arc::new(CommonMarkRenderer),
            templates: Arc::new(BuiltinTemplates),
            media,
            settings,
        }
    }

    /// Production wiring: Kubo daemon, HTTP feeds and ffmpeg.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let network = KuboClient::from_config(&cfg.ipfs)?;
        let feeds = HttpFeedClient::from_config(&cfg.http)?;
        Ok(Self::new(
            cfg.layout(),
            Arc::new(network),
            Arc::new(feeds),
            Arc::new(FfmpegMedia::default()),
            Settings::from_config(cfg),
        ))
    }
}
