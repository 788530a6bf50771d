//! Content-addressed network client.
//!
//! Engines talk to the network through [`ContentNetwork`]. [`KuboClient`]
//! drives a local Kubo daemon: name, pin and key calls go over the HTTP RPC
//! API, content adds and key import/export go through the `ipfs` binary.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config;
use crate::error::{PlanetError, Result};

#[async_trait]
pub trait ContentNetwork: Send + Sync {
    /// Add a directory tree recursively and return its root CID.
    async fn add_directory(&self, path: &Path) -> Result<String>;

    /// CIDv0 (`Qm...`) of a single file without storing it.
    async fn file_hash(&self, path: &Path) -> Result<String>;

    /// Resolve an IPNS or DNSLink/ENS name to the CID it currently points at.
    async fn resolve_name(&self, name: &str) -> Result<String>;

    async fn publish_name(&self, key: &str, cid: &str, lifetime: Duration) -> Result<()>;

    async fn pin(&self, cid: &str) -> Result<()>;

    async fn unpin(&self, cid: &str) -> Result<()>;

    /// Create a signing key named `name`; returns its IPNS id (`k51...`).
    async fn generate_key(&self, name: &str) -> Result<String>;

    async fn remove_key(&self, name: &str) -> Result<()>;

    async fn export_key(&self, name: &str, dest: &Path) -> Result<()>;

    /// Import the key at `src` under `name`; returns its IPNS id.
    async fn import_key(&self, name: &str, src: &Path) -> Result<String>;
}

#[derive(Clone)]
pub struct KuboClient {
    http: Client,
    base_url: Url,
    binary: String,
}

impl fmt::Debug for KuboClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KuboClient")
            .field("base_url", &self.base_url)
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(rename = "Path")]
    path: String,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    #[serde(rename = "Id")]
    id: String,
}

impl KuboClient {
    pub fn from_config(cfg: &config::Ipfs) -> Result<Self> {
        let base_url = Url::parse(&cfg.api_url)
            .map_err(|err| PlanetError::Internal(format!("invalid ipfs.api_url: {err}")))?;
        let http = Client::builder()
            .user_agent("planet-sync/0.1")
            .no_proxy()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url,
            binary: cfg.binary.clone(),
        })
    }

    /// `POST {api}/api/v0/{command}?arg=..&key=value..`; Kubo rejects GET.
    pub fn build_request(&self, command: &str, query: &[(&str, &str)]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("api/v0/{command}"))
            .map_err(|err| PlanetError::Internal(format!("invalid ipfs api url: {err}")))?;
        Ok(self.http.post(endpoint).query(query).build()?)
    }

    async fn rpc(&self, command: &str, query: &[(&str, &str)]) -> Result<String> {
        let request = self.build_request(command, query)?;
        debug!(url = %request.url(), "sending ipfs rpc");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::INTERNAL_SERVER_ERROR && is_not_found_message(&body) {
            return Err(PlanetError::NotFound(format!("{command}: {body}")));
        }
        Err(PlanetError::RemoteProtocol(format!(
            "ipfs {command} returned {status}: {body}"
        )))
    }

    /// Multiaddr form of the API URL for `--api`.
    pub fn api_multiaddr(&self) -> Result<String> {
        let host = self
            .base_url
            .host_str()
            .ok_or_else(|| PlanetError::Internal("ipfs.api_url has no host".into()))?;
        let port = self.base_url.port_or_known_default().unwrap_or(5001);
        let proto = match host.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(_)) => "ip4",
            Ok(std::net::IpAddr::V6(_)) => "ip6",
            Err(_) => "dns",
        };
        Ok(format!("/{proto}/{host}/tcp/{port}"))
    }

    async fn run_cli(&self, args: &[&OsStr]) -> Result<String> {
        let api = self.api_multiaddr()?;
        let output = Command::new(&self.binary)
            .arg("--api")
            .arg(&api)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| PlanetError::Internal(format!("failed to spawn {}: {err}", self.binary)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlanetError::Network(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn is_not_found_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("could not resolve") || lower.contains("not found") || lower.contains("no link named")
}

/// Strip `/ipfs/` from a resolved path.
fn cid_from_path(path: &str) -> Result<String> {
    path.strip_prefix("/ipfs/")
        .map(|cid| cid.trim_end_matches('/').to_string())
        .filter(|cid| !cid.is_empty())
        .ok_or_else(|| PlanetError::RemoteProtocol(format!("unexpected resolved path {path}")))
}

fn lifetime_arg(lifetime: Duration) -> String {
    format!("{}h", (lifetime.as_secs() / 3600).max(1))
}

#[async_trait]
impl ContentNetwork for KuboClient {
    async fn add_directory(&self, path: &Path) -> Result<String> {
        let cid = self
            .run_cli(&[
                OsStr::new("add"),
                OsStr::new("-r"),
                OsStr::new("--cid-version=1"),
                OsStr::new("--quieter"),
                path.as_os_str(),
            ])
            .await?;
        if cid.is_empty() {
            return Err(PlanetError::RemoteProtocol("ipfs add returned no cid".into()));
        }
        Ok(cid)
    }

    async fn file_hash(&self, path: &Path) -> Result<String> {
        let cid = self
            .run_cli(&[
                OsStr::new("add"),
                OsStr::new("--only-hash"),
                OsStr::new("--cid-version=0"),
                OsStr::new("--quieter"),
                path.as_os_str(),
            ])
            .await?;
        if !cid.starts_with("Qm") {
            return Err(PlanetError::RemoteProtocol(format!("unexpected file hash {cid}")));
        }
        Ok(cid)
    }

    async fn resolve_name(&self, name: &str) -> Result<String> {
        let arg = format!("/ipns/{name}");
        let body = self.rpc("name/resolve", &[("arg", arg.as_str()), ("recursive", "true")]).await?;
        let res: ResolveResponse = serde_json::from_str(&body)
            .map_err(|err| PlanetError::RemoteProtocol(format!("name/resolve: {err}")))?;
        cid_from_path(&res.path)
    }

    async fn publish_name(&self, key: &str, cid: &str, lifetime: Duration) -> Result<()> {
        let arg = format!("/ipfs/{cid}");
        let lifetime = lifetime_arg(lifetime);
        self.rpc(
            "name/publish",
            &[
                ("arg", arg.as_str()),
                ("key", key),
                ("lifetime", lifetime.as_str()),
                ("allow-offline", "true"),
            ],
        )
        .await?;
        Ok(())
    }

    async fn pin(&self, cid: &str) -> Result<()> {
        self.rpc("pin/add", &[("arg", cid)]).await?;
        Ok(())
    }

    async fn unpin(&self, cid: &str) -> Result<()> {
        self.rpc("pin/rm", &[("arg", cid)]).await?;
        Ok(())
    }

    async fn generate_key(&self, name: &str) -> Result<String> {
        let body = self
            .rpc("key/gen", &[("arg", name), ("type", "ed25519"), ("ipns-base", "base36")])
            .await?;
        let res: KeyResponse = serde_json::from_str(&body)
            .map_err(|err| PlanetError::RemoteProtocol(format!("key/gen: {err}")))?;
        Ok(res.id)
    }

    async fn remove_key(&self, name: &str) -> Result<()> {
        self.rpc("key/rm", &[("arg", name)]).await?;
        Ok(())
    }

    async fn export_key(&self, name: &str, dest: &Path) -> Result<()> {
        let out = format!("--output={}", dest.display());
        self.run_cli(&[OsStr::new("key"), OsStr::new("export"), OsStr::new(name), OsStr::new(&out)])
            .await?;
        Ok(())
    }

    async fn import_key(&self, name: &str, src: &Path) -> Result<String> {
        let id = self
            .run_cli(&[
                OsStr::new("key"),
                OsStr::new("import"),
                OsStr::new("--ipns-base=base36"),
                OsStr::new(name),
                src.as_os_str(),
            ])
            .await?;
        if id.is_empty() {
            return Err(PlanetError::RemoteProtocol("ipfs key import returned no id".into()));
        }
        Ok(id)
    }
}
