use std::path::Path;
use std::time::Duration;

use engine_logging::{engine_debug, engine_info, engine_warn};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::io::{AsyncWriteExt, BufWriter};
use url::Url;

use crate::filename::pdf_filename;
use crate::{FailureKind, FetchError, FetchOutcome, SavedPdf};

/// Write buffer size for streamed bodies.
const CHUNK_SIZE: usize = 32 * 1024;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    /// Applies to each read; large PDFs over slow links need minutes.
    pub read_timeout: Duration,
    /// Optional cap on the whole request, body included.
    pub request_timeout: Option<Duration>,
    /// Total attempts per URL.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Bodies below this size are treated as error pages.
    pub min_bytes: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            request_timeout: None,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            min_bytes: 100,
        }
    }
}

impl FetchSettings {
    /// `min(base * 2^attempt, cap)`, with `attempt` counted from zero.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

/// Downloads one URL into a target directory.
#[async_trait::async_trait]
pub trait PdfFetcher: Send + Sync {
    /// Never fails: every error is folded into the returned outcome.
    async fn fetch(&self, url: &str, index: usize, target_dir: &Path) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct ReqwestPdfFetcher {
    settings: FetchSettings,
    client: reqwest::Client,
}

impl ReqwestPdfFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let client = build_client(&settings)?;
        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    async fn attempt(&self, url: &Url, index: usize, target_dir: &Path) -> Result<SavedPdf, FetchError> {
        let mut request = self.client.get(url.clone());
        if let Some(timeout) = self.settings.request_timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FailureKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if !content_type.contains("pdf") && !has_pdf_extension(url) {
            return Err(FetchError::new(
                FailureKind::NotPdf {
                    content_type: content_type.clone(),
                },
                "response is not a pdf",
            ));
        }

        let filename = pdf_filename(url, index);
        let path = target_dir.join(&filename);
        let written = match write_body(response, &path).await {
            Ok(written) => written,
            Err(err) => {
                discard_partial(&path).await;
                return Err(err);
            }
        };

        if written < self.settings.min_bytes {
            discard_partial(&path).await;
            return Err(FetchError::new(
                FailureKind::TooSmall { bytes: written },
                format!("body below {} bytes", self.settings.min_bytes),
            ));
        }

        Ok(SavedPdf {
            filename,
            path,
            bytes: written,
        })
    }
}

#[async_trait::async_trait]
impl PdfFetcher for ReqwestPdfFetcher {
    async fn fetch(&self, url: &str, index: usize, target_dir: &Path) -> FetchOutcome {
        let max_attempts = self.settings.max_retries.max(1);
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => {
                engine_warn!("Download #{} has an invalid url {:?}: {}", index, url, err);
                return FetchOutcome {
                    url: url.to_string(),
                    index,
                    attempts: 0,
                    result: Err(FetchError::new(FailureKind::InvalidUrl, err.to_string())),
                };
            }
        };

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            engine_debug!(
                "Download #{} attempt {}/{}: {}",
                index,
                attempts,
                max_attempts,
                short_url(url)
            );
            match self.attempt(&parsed, index, target_dir).await {
                Ok(saved) => {
                    engine_info!(
                        "Download #{} succeeded: {} ({} bytes)",
                        index,
                        saved.filename,
                        saved.bytes
                    );
                    break Ok(saved);
                }
                Err(err) if err.kind.is_retryable() && attempts < max_attempts => {
                    let delay = self.settings.backoff_delay(attempts - 1);
                    engine_warn!(
                        "Download #{} failed ({}), retrying in {:?}: {}",
                        index,
                        err,
                        delay,
                        short_url(url)
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    engine_warn!(
                        "Download #{} gave up after {} attempt(s) ({}): {}",
                        index,
                        attempts,
                        err,
                        short_url(url)
                    );
                    break Err(err);
                }
            }
        };

        FetchOutcome {
            url: url.to_string(),
            index,
            attempts,
            result,
        }
    }
}

fn build_client(settings: &FetchSettings) -> Result<reqwest::Client, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/pdf,*/*"));

    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .connect_timeout(settings.connect_timeout)
        .read_timeout(settings.read_timeout)
        .build()
        .map_err(|err| FetchError::new(FailureKind::Network, err.to_string()))
}

/// Streams the body to `path`; the response is consumed and released here.
async fn write_body(response: reqwest::Response, path: &Path) -> Result<u64, FetchError> {
    let file = tokio::fs::File::create(path).await.map_err(map_io_error)?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
    let mut written: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest_error)?;
        writer.write_all(&chunk).await.map_err(map_io_error)?;
        written += chunk.len() as u64;
    }
    writer.flush().await.map_err(map_io_error)?;
    Ok(written)
}

async fn discard_partial(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            engine_warn!("Could not remove partial file {:?}: {}", path, err);
        }
    }
}

fn has_pdf_extension(url: &Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".pdf")
}

fn short_url(url: &str) -> &str {
    match url.char_indices().nth(100) {
        Some((idx, _)) => &url[..idx],
        None => url,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}

fn map_io_error(err: std::io::Error) -> FetchError {
    FetchError::new(FailureKind::Io, err.to_string())
}
