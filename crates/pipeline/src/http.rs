//! JSON-over-HTTP implementations of the collaborator traits.
//!
//! Each service exposes one `POST` endpoint under its base URL:
//! `/prompts`, `/images`, `/assets` and `/publish`. Failures are mapped
//! onto [`ServiceError`] so the retry controller and breakers can classify
//! them.

use std::time::Duration;

use async_trait::async_trait;
use podflow_core::artifacts::{
    AssetMetadata, ImageRef, ProductSpec, Prompt, PublishReceipt, SavedAsset,
};
use podflow_core::error::{ServiceError, TimeoutScope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::collaborators::{AssetStore, ImageGenerator, PlatformPublisher, PromptGenerator};

/// Longest error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// HTTP client bound to one service base URL.
#[derive(Debug, Clone)]
pub struct HttpService {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpService {
    /// Create a client for `base_url`, e.g. `http://images.internal:8080`.
    ///
    /// `timeout` bounds each request at the transport level; the retry
    /// policy applies its own per-call deadline on top.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, timeout)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ServiceError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let mut body = response.text().await.unwrap_or_default();
            truncate(&mut body, MAX_ERROR_BODY);
            return Err(ServiceError::from_status(
                status.as_u16(),
                format!("POST {url} returned {status}: {body}"),
                retry_after,
            ));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ServiceError::permanent(format!("Undecodable response from {url}: {e}")))
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout {
                scope: TimeoutScope::Call,
                after: self.timeout,
            }
        } else if e.is_builder() {
            ServiceError::permanent(format!("Invalid request to {}: {e}", self.base_url))
        } else {
            ServiceError::transient(format!("Request to {} failed: {e}", self.base_url))
        }
    }
}

fn truncate(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PromptsRequest<'a> {
    theme: &'a str,
}

#[derive(Deserialize)]
struct PromptsResponse {
    prompts: Vec<Prompt>,
}

#[derive(Serialize)]
struct ImagesRequest<'a> {
    prompt: &'a Prompt,
}

#[derive(Deserialize)]
struct ImagesResponse {
    images: Vec<ImageRef>,
}

#[derive(Serialize)]
struct SaveAssetRequest<'a> {
    image: &'a ImageRef,
    metadata: &'a AssetMetadata,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    platform: &'a str,
    asset: &'a SavedAsset,
    product: &'a ProductSpec,
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

pub struct HttpPromptGenerator(pub HttpService);

#[async_trait]
impl PromptGenerator for HttpPromptGenerator {
    async fn generate(&self, theme: &str) -> Result<Vec<Prompt>, ServiceError> {
        let res: PromptsResponse = self.0.post("/prompts", &PromptsRequest { theme }).await?;
        Ok(res.prompts)
    }
}

pub struct HttpImageGenerator(pub HttpService);

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, prompt: &Prompt) -> Result<Vec<ImageRef>, ServiceError> {
        let res: ImagesResponse = self.0.post("/images", &ImagesRequest { prompt }).await?;
        Ok(res.images)
    }
}

pub struct HttpAssetStore(pub HttpService);

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn save(
        &self,
        image: &ImageRef,
        metadata: &AssetMetadata,
    ) -> Result<SavedAsset, ServiceError> {
        self.0
            .post("/assets", &SaveAssetRequest { image, metadata })
            .await
    }
}

/// Publishes through a storefront gateway; the platform name travels in the
/// request body.
pub struct HttpPublisher {
    platform: String,
    service: HttpService,
}

impl HttpPublisher {
    pub fn new(platform: impl Into<String>, service: HttpService) -> Self {
        Self {
            platform: platform.into(),
            service,
        }
    }
}

#[async_trait]
impl PlatformPublisher for HttpPublisher {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn publish(
        &self,
        asset: &SavedAsset,
        spec: &ProductSpec,
    ) -> Result<PublishReceipt, ServiceError> {
        let body = PublishRequest {
            platform: &self.platform,
            asset,
            product: spec,
        };
        self.service.post("/publish", &body).await
    }
}
