//! HTTP remote archive backed by a Zenodo-style deposition API
//!
//! - list:   `GET  {url}/deposit/depositions/{deposit}/files`
//! - fetch:  `GET  {url}/records/{deposit}/files/{name}/content`
//! - upload: `PUT  {bucket}/{name}`, bucket taken from the deposition links
//!
//! ureq is blocking, so every request runs on the blocking thread pool.

use crate::cache::remote::{RemoteArchive, RemoteFile};
use crate::config::schema::RemoteConfig;
use crate::error::{ManuError, ManuResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use ureq::Agent;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Remote archive reached over HTTP
#[derive(Clone)]
pub struct HttpArchive {
    agent: Agent,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepositionFile {
    filename: String,
    #[serde(default)]
    filesize: u64,
}

#[derive(Debug, Deserialize)]
struct Deposition {
    links: DepositionLinks,
}

#[derive(Debug, Deserialize)]
struct DepositionLinks {
    bucket: String,
}

impl HttpArchive {
    /// Build from config, reading the token from `token_env` if set
    pub fn from_config(config: &RemoteConfig) -> Self {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.is_empty());
        if token.is_none() {
            debug!(
                "No token in {}; remote uploads will be rejected",
                config.token_env
            );
        }
        Self::new(&config.url, token)
    }

    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .http_status_as_error(false)
            .build();
        Self {
            agent: Agent::new_with_config(config),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn auth_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {}", t))
    }

    /// GET a URL; `Ok(None)` on 404
    async fn get_bytes(&self, url: String) -> ManuResult<Option<Vec<u8>>> {
        let agent = self.agent.clone();
        let auth = self.auth_header();
        blocking(move || {
            let mut request = agent.get(&url);
            if let Some(auth) = auth {
                request = request.header("Authorization", auth);
            }
            let mut response = request
                .call()
                .map_err(|e| ManuError::unavailable(format!("GET {}: {}", url, e)))?;

            let status = response.status().as_u16();
            if status == 404 {
                return Ok(None);
            }
            if !(200..300).contains(&status) {
                return Err(ManuError::Http(format!("GET {} returned {}", url, status)));
            }

            response
                .body_mut()
                .with_config()
                .limit(u64::MAX)
                .read_to_vec()
                .map(Some)
                .map_err(|e| ManuError::unavailable(format!("reading {}: {}", url, e)))
        })
        .await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: String) -> ManuResult<Option<T>> {
        match self.get_bytes(url).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

async fn blocking<T, F>(f: F) -> ManuResult<T>
where
    F: FnOnce() -> ManuResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ManuError::Internal(format!("HTTP worker panicked: {}", e)))?
}

#[async_trait]
impl RemoteArchive for HttpArchive {
    fn name(&self) -> &str {
        "http"
    }

    async fn list(&self, deposit: &str) -> ManuResult<Vec<RemoteFile>> {
        let url = format!("{}/deposit/depositions/{}/files", self.base_url, deposit);
        let files: Vec<DepositionFile> = self.get_json(url).await?.unwrap_or_default();
        Ok(files
            .into_iter()
            .map(|f| RemoteFile {
                name: f.filename,
                size: f.filesize,
            })
            .collect())
    }

    async fn fetch(&self, deposit: &str, name: &str) -> ManuResult<Option<Vec<u8>>> {
        let url = format!(
            "{}/records/{}/files/{}/content",
            self.base_url, deposit, name
        );
        debug!("Fetching {}", url);
        self.get_bytes(url).await
    }

    async fn upload(&self, deposit: &str, name: &str, data: Vec<u8>) -> ManuResult<()> {
        let auth = self
            .auth_header()
            .ok_or_else(|| ManuError::unavailable("no access token for uploads"))?;

        let url = format!("{}/deposit/depositions/{}", self.base_url, deposit);
        let deposition: Deposition = self
            .get_json(url.clone())
            .await?
            .ok_or_else(|| ManuError::unavailable(format!("deposit {} not found", deposit)))?;

        let target = format!("{}/{}", deposition.links.bucket.trim_end_matches('/'), name);
        let agent = self.agent.clone();
        blocking(move || {
            let response = agent
                .put(&target)
                .header("Authorization", auth)
                .header("Content-Type", "application/octet-stream")
                .send(&data[..])
                .map_err(|e| ManuError::unavailable(format!("PUT {}: {}", target, e)))?;

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(ManuError::Http(format!("PUT {} returned {}", target, status)));
            }
            debug!("Uploaded {}", target);
            Ok(())
        })
        .await
    }
}
