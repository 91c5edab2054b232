// casket-net/src/http.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use casket_common::config::Config;
use casket_common::error::{CasketError, FetchErrorKind, Result};
use casket_common::model::Checksum;
use casket_common::pipeline::PipelineEvent;
use futures::StreamExt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{HeaderMap, ACCEPT, RANGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use tokio::fs::{File as TokioFile, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::validation::{validate_url, verify_checksum};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "casket cask engine (Rust)";

/// What to download for one transaction.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub token: String,
    pub version: String,
    /// Fully rendered URL.
    pub url: String,
    pub checksum: Checksum,
}

#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Served from the download cache without a request.
    pub cached: bool,
}

/// Anything that can produce a local copy of a descriptor's artifact.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedArtifact>;
}

pub struct HttpFetcher {
    client: Client,
    downloads_dir: PathBuf,
    max_retries: u32,
    base_delay: Duration,
    allow_http: bool,
    event_tx: Option<broadcast::Sender<PipelineEvent>>,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            downloads_dir: config.downloads_dir(),
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            allow_http: config.allow_http,
            event_tx: None,
        })
    }

    pub fn with_events(mut self, event_tx: broadcast::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// `<downloads>/<token>--<version>--<file name from url>`
    pub fn cache_path(&self, request: &FetchRequest) -> PathBuf {
        let file_name = Url::parse(&request.url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                debug!("URL has no filename component, using fallback name for cache.");
                "download".to_string()
            });
        self.downloads_dir.join(format!(
            "{}--{}--{}",
            request.token, request.version, file_name
        ))
    }

    fn partial_path(final_path: &Path) -> PathBuf {
        let temp_filename = format!(
            ".{}.download",
            final_path.file_name().unwrap_or_default().to_string_lossy()
        );
        final_path.with_file_name(temp_filename)
    }

    fn send_event(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Returns the cache path if a previously verified copy can be reused.
    fn reusable_cache_entry(&self, cache_path: &Path, checksum: &Checksum) -> Option<u64> {
        if !cache_path.is_file() {
            debug!("File not found in cache.");
            return None;
        }
        match checksum {
            Checksum::Sha256(expected) => match verify_checksum(cache_path, expected) {
                Ok(_) => {
                    debug!("Using valid cached file: {}", cache_path.display());
                    std::fs::metadata(cache_path).ok().map(|m| m.len())
                }
                Err(e) => {
                    debug!(
                        "Cached file failed verification ({}): {}. Redownloading.",
                        cache_path.display(),
                        e
                    );
                    if let Err(remove_err) = std::fs::remove_file(cache_path) {
                        warn!(
                            "Failed to remove corrupted cached file {}: {}",
                            cache_path.display(),
                            remove_err
                        );
                    }
                    None
                }
            },
            // Without a digest there is nothing to prove the cached copy current.
            _ => {
                debug!(
                    "Ignoring unverifiable cached file {}",
                    cache_path.display()
                );
                None
            }
        }
    }

    async fn download_with_retry(
        &self,
        request: &FetchRequest,
        url: &Url,
        final_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let temp_path = Self::partial_path(final_path);
        let mut delay = self.base_delay;
        let mut rng = SmallRng::from_os_rng();

        for attempt in 0..=self.max_retries {
            debug!(
                "Download attempt {}/{} for {} from {}",
                attempt + 1,
                self.max_retries + 1,
                request.token,
                url
            );
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(CasketError::Cancelled(request.token.clone())),
                res = self.download_once(request, url, &temp_path) => res,
            };
            match outcome {
                Ok(size) => {
                    tokio::fs::rename(&temp_path, final_path).await?;
                    debug!(
                        "Moved completed download to final location: {}",
                        final_path.display()
                    );
                    return Ok(size);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let jitter_ms =
                        rng.random_range(0..=(self.base_delay.as_millis() as u64 / 2));
                    let wait = delay + Duration::from_millis(jitter_ms);
                    warn!(
                        "Download of {} failed (attempt {}): {}. Retrying in {:?}",
                        request.token,
                        attempt + 1,
                        e,
                        wait
                    );
                    self.send_event(PipelineEvent::DownloadRetry {
                        token: request.token.clone(),
                        attempt: attempt + 1,
                        delay_ms: wait.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = tokio::fs::remove_file(&temp_path).await;
                            return Err(CasketError::Cancelled(request.token.clone()));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                    delay *= 2;
                }
                Err(e) => {
                    error!("Download of {} from {} failed: {}", request.token, url, e);
                    // A transient failure keeps its partial file for a later resume.
                    if !e.is_transient() {
                        let _ = tokio::fs::remove_file(&temp_path).await;
                    }
                    return Err(e);
                }
            }
        }

        Err(fetch_error(
            request,
            FetchErrorKind::Transient,
            format!("Gave up after {} attempts", self.max_retries + 1),
        ))
    }

    async fn download_once(&self, request: &FetchRequest, url: &Url, temp_path: &Path) -> Result<u64> {
        if url.scheme() == "file" {
            return copy_local(request, url, temp_path).await;
        }

        let existing = tokio::fs::metadata(temp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let mut req = self.client.get(url.clone());
        if existing > 0 {
            debug!(
                "Resuming {} from byte {} ({})",
                request.token,
                existing,
                temp_path.display()
            );
            req = req.header(RANGE, format!("bytes={existing}-"));
        }

        let response = req
            .send()
            .await
            .map_err(|e| fetch_error(request, classify_reqwest(&e), e.to_string()))?;
        let status = response.status();
        debug!("Received HTTP status: {} for {}", status, url);

        let append = match status {
            StatusCode::PARTIAL_CONTENT if existing > 0 => true,
            s if s.is_success() => false,
            StatusCode::RANGE_NOT_SATISFIABLE if existing > 0 => {
                let _ = tokio::fs::remove_file(temp_path).await;
                return Err(fetch_error(
                    request,
                    FetchErrorKind::Transient,
                    "Server rejected resume range; restarting".to_string(),
                ));
            }
            s => {
                return Err(fetch_error(
                    request,
                    classify_status(s),
                    format!("HTTP status {s}"),
                ))
            }
        };

        let mut file = if append {
            OpenOptions::new().append(true).open(temp_path).await?
        } else {
            if let Some(parent) = temp_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            TokioFile::create(temp_path).await?
        };

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                fetch_error(request, FetchErrorKind::Transient, format!("Body read failed: {e}"))
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        Ok(tokio::fs::metadata(temp_path).await?.len())
    }
}

#[async_trait]
impl ArtifactSource for HttpFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedArtifact> {
        let url = validate_url(&request.url, self.allow_http).map_err(|e| {
            fetch_error(request, FetchErrorKind::Permanent, e.to_string())
        })?;
        let cache_path = self.cache_path(request);
        debug!(
            "Preparing to fetch {} {} from URL: {}",
            request.token, request.version, request.url
        );
        debug!("Target cache path: {}", cache_path.display());

        if let Some(size_bytes) = self.reusable_cache_entry(&cache_path, &request.checksum) {
            return Ok(FetchedArtifact {
                path: cache_path,
                size_bytes,
                cached: true,
            });
        }

        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        self.send_event(PipelineEvent::DownloadStarted {
            token: request.token.clone(),
            url: request.url.clone(),
        });
        let size_bytes = self
            .download_with_retry(request, &url, &cache_path, cancel)
            .await?;
        Ok(FetchedArtifact {
            path: cache_path,
            size_bytes,
            cached: false,
        })
    }
}

async fn copy_local(request: &FetchRequest, url: &Url, temp_path: &Path) -> Result<u64> {
    let source = url.to_file_path().map_err(|_| {
        fetch_error(
            request,
            FetchErrorKind::Permanent,
            format!("Not a local file path: {url}"),
        )
    })?;
    if !source.is_file() {
        return Err(fetch_error(
            request,
            FetchErrorKind::Permanent,
            format!("Local artifact {} does not exist", source.display()),
        ));
    }
    if let Some(parent) = temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::copy(&source, temp_path).await?)
}

fn fetch_error(request: &FetchRequest, kind: FetchErrorKind, message: String) -> CasketError {
    CasketError::Fetch {
        token: request.token.clone(),
        url: request.url.clone(),
        kind,
        message,
    }
}

fn classify_status(status: StatusCode) -> FetchErrorKind {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FetchErrorKind::Transient
    } else {
        FetchErrorKind::Permanent
    }
}

fn classify_reqwest(e: &reqwest::Error) -> FetchErrorKind {
    if e.is_builder() || e.is_redirect() {
        FetchErrorKind::Permanent
    } else {
        FetchErrorKind::Transient
    }
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, reqwest::header::HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, reqwest::header::HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| CasketError::Generic(format!("Failed to build HTTP client: {e}")))
}
