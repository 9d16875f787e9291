use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{self, HeaderMap},
    Client, StatusCode,
};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Response body exceeded the maximum of {0} bytes")]
    TooLarge(u64),

    #[error("Error sending request: {0}")]
    Send(String),

    #[error("Upstream responded with status {0}")]
    Status(u16),

    #[error("Error reading response: {0}")]
    Chunk(String),

    #[error("Error reading local file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported source URL: {0}")]
    Unsupported(String),
}

/// Retrieves source bytes. `head_size` is the cheap probe run before any
/// body is transferred; `Ok(None)` means the size could not be determined.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn head_size(&self, url: &Url) -> Result<Option<u64>, FetchError>;

    async fn fetch(&self, url: &Url, max_bytes: u64) -> Result<Bytes, FetchError>;
}

/// `http(s)` sources through reqwest, `file` sources from disk.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Send(e.to_string()))?;
        Ok(HttpFetcher { client })
    }

    async fn head_size_http(&self, url: &Url) -> Result<Option<u64>, FetchError> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Send(e.to_string()))?;

        size_from_head(response.status(), response.headers())
    }

    async fn fetch_http(&self, url: &Url, max_bytes: u64) -> Result<Bytes, FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Send(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let mut body = Vec::new();
        // stream the response so an under-declared length cannot make us
        // buffer more than the limit
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Chunk(e.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(FetchError::TooLarge(max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body.into())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn head_size(&self, url: &Url) -> Result<Option<u64>, FetchError> {
        match url.scheme() {
            "http" | "https" => self.head_size_http(url).await,
            "file" => {
                let metadata = tokio::fs::metadata(file_path(url)?).await?;
                Ok(Some(metadata.len()))
            }
            other => Err(FetchError::Unsupported(other.to_string())),
        }
    }

    async fn fetch(&self, url: &Url, max_bytes: u64) -> Result<Bytes, FetchError> {
        match url.scheme() {
            "http" | "https" => self.fetch_http(url, max_bytes).await,
            "file" => read_capped(file_path(url)?, max_bytes).await,
            other => Err(FetchError::Unsupported(other.to_string())),
        }
    }
}

/// Reads the declared size off a HEAD response. Servers that do not
/// implement HEAD leave the size undetermined rather than failing the source.
fn size_from_head(status: StatusCode, headers: &HeaderMap) -> Result<Option<u64>, FetchError> {
    match status {
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => return Ok(None),
        status if !status.is_success() => return Err(FetchError::Status(status.as_u16())),
        _ => {}
    }

    // Response::content_length() reports the (empty) HEAD body, not the header.
    Ok(headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok()))
}

fn file_path(url: &Url) -> Result<std::path::PathBuf, FetchError> {
    url.to_file_path()
        .map_err(|_| FetchError::Unsupported(url.to_string()))
}

async fn read_capped(path: std::path::PathBuf, max_bytes: u64) -> Result<Bytes, FetchError> {
    let file = tokio::fs::File::open(path).await?;
    let mut body = Vec::new();
    // one byte past the cap tells us the file grew beyond it
    file.take(max_bytes + 1).read_to_end(&mut body).await?;
    if body.len() as u64 > max_bytes {
        return Err(FetchError::TooLarge(max_bytes));
    }
    Ok(body.into())
}
