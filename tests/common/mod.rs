#![allow(dead_code)]

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify};

use planet_sync::engine::{Services, Settings};
use planet_sync::error::{PlanetError, Result};
use planet_sync::feed::{Feed, FeedSource};
use planet_sync::ipfs::ContentNetwork;
use planet_sync::media::MediaProcessor;
use planet_sync::store::Layout;

pub const GATEWAY: &str = "http://gw.test";

#[derive(Clone, Default)]
pub struct RecordingNetwork {
    calls: Arc<Mutex<Vec<String>>>,
    resolved: Arc<Mutex<HashMap<String, String>>>,
    add_results: Arc<Mutex<VecDeque<Result<String>>>>,
    publish_results: Arc<Mutex<VecDeque<Result<()>>>>,
    add_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl RecordingNetwork {
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub async fn set_resolved(&self, name: &str, cid: &str) {
        self.resolved.lock().await.insert(name.to_string(), cid.to_string());
    }

    pub async fn push_add_result(&self, result: Result<String>) {
        self.add_results.lock().await.push_back(result);
    }

    pub async fn push_publish_result(&self, result: Result<()>) {
        self.publish_results.lock().await.push_back(result);
    }

    /// Make `add_directory` wait until the returned notifier fires.
    pub async fn block_adds(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.add_gate.lock().await = Some(gate.clone());
        gate
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl ContentNetwork for RecordingNetwork {
    async fn add_directory(&self, path: &Path) -> Result<String> {
        self.record(format!("add {}", path.display())).await;
        let gate = self.add_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let queued = self.add_results.lock().await.pop_front();
        let n = self.count("add ").await;
        queued.unwrap_or_else(|| Ok(format!("bafy{n}")))
    }

    async fn file_hash(&self, path: &Path) -> Result<String> {
        self.record(format!("hash {}", path.display())).await;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PlanetError::persistence(path, e))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(format!("Qm{}", &digest[..44]))
    }

    async fn resolve_name(&self, name: &str) -> Result<String> {
        self.record(format!("resolve {name}")).await;
        self.resolved
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PlanetError::NotFound(name.to_string()))
    }

    async fn publish_name(&self, key: &str, cid: &str, _lifetime: Duration) -> Result<()> {
        self.record(format!("publish {key} {cid}")).await;
        self.publish_results.lock().await.pop_front().unwrap_or(Ok(()))
    }

    async fn pin(&self, cid: &str) -> Result<()> {
        self.record(format!("pin {cid}")).await;
        Ok(())
    }

    async fn unpin(&self, cid: &str) -> Result<()> {
        self.record(format!("unpin {cid}")).await;
        Ok(())
    }

    async fn generate_key(&self, name: &str) -> Result<String> {
        self.record(format!("keygen {name}")).await;
        Ok(format!("k51{}", name.to_lowercase().replace('-', "")))
    }

    async fn remove_key(&self, name: &str) -> Result<()> {
        self.record(format!("keyrm {name}")).await;
        Ok(())
    }

    async fn export_key(&self, name: &str, dest: &Path) -> Result<()> {
        self.record(format!("keyexport {name}")).await;
        tokio::fs::write(dest, name.as_bytes())
            .await
            .map_err(|e| PlanetError::persistence(dest, e))
    }

    async fn import_key(&self, name: &str, _src: &Path) -> Result<String> {
        self.record(format!("keyimport {name}")).await;
        Ok(format!("k51imported{}", name.len()))
    }
}

/// Serves canned bytes and feeds by URL; anything else is `NotFound`.
#[derive(Clone, Default)]
pub struct StaticFeeds {
    bytes: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    feeds: Arc<Mutex<HashMap<String, Feed>>>,
    fetched: Arc<Mutex<Vec<String>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl StaticFeeds {
    pub async fn set_bytes(&self, url: &str, bytes: impl Into<Vec<u8>>) {
        self.bytes.lock().await.insert(url.to_string(), bytes.into());
    }

    pub async fn set_json(&self, url: &str, value: &serde_json::Value) {
        self.set_bytes(url, serde_json::to_vec(value).unwrap()).await;
    }

    pub async fn set_feed(&self, url: &str, feed: Feed) {
        self.feeds.lock().await.insert(url.to_string(), feed);
    }

    pub async fn remove_feed(&self, url: &str) {
        self.feeds.lock().await.remove(url);
    }

    /// Make every feed fetch take `delay` first.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    pub async fn fetch_count(&self, url: &str) -> usize {
        self.fetched.lock().await.iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl FeedSource for StaticFeeds {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.fetched.lock().await.push(url.to_string());
        self.bytes
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| PlanetError::NotFound(url.to_string()))
    }

    async fn fetch_feed(&self, url: &str) -> Result<Feed> {
        self.fetched.lock().await.push(url.to_string());
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.feeds
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| PlanetError::NotFound(url.to_string()))
    }
}

/// Writes placeholder files instead of running ffmpeg.
#[derive(Clone, Default)]
pub struct NoMedia {
    calls: Arc<Mutex<Vec<String>>>,
    fail_grids: Arc<AtomicBool>,
}

impl NoMedia {
    /// Make `square_grid` fail the way a missing ffmpeg does.
    pub fn fail_grids(&self, fail: bool) {
        self.fail_grids.store(fail, Ordering::SeqCst);
    }

    pub async fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    async fn placeholder(&self, call: String, dest: &Path) -> Result<()> {
        self.calls.lock().await.push(call);
        tokio::fs::write(dest, b"png")
            .await
            .map_err(|e| PlanetError::persistence(dest, e))
    }
}

#[async_trait]
impl MediaProcessor for NoMedia {
    async fn dimensions(&self, _path: &Path) -> Result<(u32, u32)> {
        Ok((800, 600))
    }

    async fn square_grid(&self, src: &Path, dest: &Path, size: u32) -> Result<()> {
        if self.fail_grids.load(Ordering::SeqCst) {
            return Err(PlanetError::Media("ffmpeg not found".into()));
        }
        self.placeholder(format!("grid {} {size}", src.display()), dest).await
    }

    async fn video_thumbnail(&self, video: &Path, dest: &Path) -> Result<()> {
        self.placeholder(format!("thumb {}", video.display()), dest).await
    }

    async fn render_cover(&self, title: &str, dest: &Path) -> Result<()> {
        self.placeholder(format!("cover {title}"), dest).await
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub network: RecordingNetwork,
    pub feeds: StaticFeeds,
    pub media: NoMedia,
    pub svc: Arc<Services>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let network = RecordingNetwork::default();
        let feeds = StaticFeeds::default();
        let media = NoMedia::default();
        let svc = Arc::new(Services::new(
            Layout::new(dir.path().join("data")),
            Arc::new(network.clone()),
            Arc::new(feeds.clone()),
            Arc::new(media.clone()),
            Settings {
                gateway_url: GATEWAY.into(),
                publish_lifetime: Duration::from_secs(3600),
                max_concurrency: 2,
            },
        ));
        Self {
            dir,
            network,
            feeds,
            media,
            svc,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.svc.layout
    }

    /// Write a scratch file outside the data directory.
    pub fn scratch(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join("scratch").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }
}
