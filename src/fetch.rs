/// The stock [`TileFetcher`]: HTTP(S) through reqwest, plus `file://` URLs
/// read from local disk.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::error::FetchError;
use crate::TileFetcher;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<HttpFetcher, FetchError> {
        HttpFetcher::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<HttpFetcher, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(HttpFetcher { client })
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.to_owned(),
            message: e.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(transport)?;

        // Tile servers answer with these for tiles that hold no data.
        if matches!(response.status(), StatusCode::NO_CONTENT | StatusCode::NOT_FOUND) {
            debug!(url, status = %response.status(), "Treating response as an empty tile");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status: response.status().as_u16(),
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        Ok(body.to_vec())
    }
}

async fn fetch_file(url: &Url) -> Result<Vec<u8>, FetchError> {
    let path = url
        .to_file_path()
        .map_err(|_| FetchError::UnsupportedScheme(url.to_string()))?;
    tokio::fs::read(&path).await.map_err(|e| FetchError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl TileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::UnsupportedScheme(url.to_owned()))?;
        match parsed.scheme() {
            "http" | "https" => self.fetch_http(url).await,
            "file" => fetch_file(&parsed).await,
            _ => Err(FetchError::UnsupportedScheme(url.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_file_urls() {
        let path = std::env::temp_dir().join(format!("tile_scryer_fetch_{}.mvt", std::process::id()));
        tokio::fs::write(&path, [1u8, 2, 3]).await.expect("write fixture");
        let url = Url::from_file_path(&path).expect("file url");

        let fetcher = HttpFetcher::new().expect("client");
        let bytes = fetcher.fetch(url.as_str()).await.expect("fetch");
        assert_eq!(vec![1, 2, 3], bytes);

        tokio::fs::remove_file(&path).await.expect("cleanup");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_io_error() {
        let fetcher = HttpFetcher::new().expect("client");
        let result = fetcher.fetch("file:///nonexistent/tile_scryer/0/0/0.mvt").await;
        assert!(matches!(result, Err(FetchError::Io { .. })));
    }

    #[tokio::test]
    async fn test_rejects_unknown_schemes() {
        let fetcher = HttpFetcher::new().expect("client");
        let result = fetcher.fetch("pmtiles://https://ex.com/planet.pmtiles").await;
        assert!(matches!(result, Err(FetchError::UnsupportedScheme(_))));
    }
}
