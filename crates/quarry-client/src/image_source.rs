use std::time::Duration;

use quarry_core::error::AppError;
use quarry_core::traits::{FetchedImage, ImageSource};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;

use crate::net::{USER_AGENT, request_error, validate_url};

/// Downloads assets over HTTP, streaming the body so an oversized
/// payload is abandoned as soon as it crosses the ceiling.
#[derive(Clone)]
pub struct ReqwestImageSource {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestImageSource {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl ImageSource for ReqwestImageSource {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<FetchedImage, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }
        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(AppError::PayloadTooLarge { limit: max_bytes });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| request_error(e, self.timeout_secs))?
        {
            if (bytes.len() + chunk.len()) as u64 > max_bytes {
                tracing::debug!(url, max_bytes, "Download crossed byte ceiling, aborting");
                return Err(AppError::PayloadTooLarge { limit: max_bytes });
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedImage {
            content_type,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::serve;
    use quarry_core::testutil::png_bytes;

    fn source() -> ReqwestImageSource {
        ReqwestImageSource::with_timeout(Duration::from_secs(5))
            .unwrap()
            .allow_private_urls()
    }

    #[tokio::test]
    async fn downloads_body_and_type() {
        let png = png_bytes(60, 60, 1);
        let base = serve(200, "image/png", png.clone()).await;
        let fetched = source().fetch(&format!("{base}/a.png"), 1_000_000).await.unwrap();
        assert_eq!(fetched.bytes, png);
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn ceiling_enforced() {
        let base = serve(200, "image/jpeg", vec![0u8; 4096]).await;
        let err = source().fetch(&base, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn error_status_is_terminal() {
        let base = serve(404, "text/html", b"gone".to_vec()).await;
        let err = source().fetch(&base, 1024).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));
        assert!(!err.is_retryable());
    }
}
