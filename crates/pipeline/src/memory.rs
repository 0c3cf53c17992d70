//! In-process collaborators with scriptable latency and failures.
//!
//! Used by tests and by the server when no external service URLs are
//! configured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use podflow_core::artifacts::{
    AssetMetadata, ImageRef, ProductSpec, Prompt, PublishReceipt, SavedAsset,
};
use podflow_core::error::ServiceError;
use podflow_core::hashing::sha256_hex;

use crate::collaborators::{AssetStore, ImageGenerator, PlatformPublisher, PromptGenerator};

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Latency and failure script shared by every in-memory collaborator.
#[derive(Default)]
pub struct Faults {
    latency: Mutex<Duration>,
    queued: Mutex<VecDeque<ServiceError>>,
    persistent: Mutex<Option<ServiceError>>,
    calls: AtomicU32,
}

impl Faults {
    /// Fail the next call with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, err: ServiceError) {
        lock(&self.queued).push_back(err);
    }

    /// Fail the next `n` calls with `err`.
    pub fn fail_times(&self, n: usize, err: ServiceError) {
        let mut queued = lock(&self.queued);
        for _ in 0..n {
            queued.push_back(err.clone());
        }
    }

    /// Fail every call with `err` until [`Faults::heal`].
    pub fn fail_always(&self, err: ServiceError) {
        *lock(&self.persistent) = Some(err);
    }

    /// Clear every scripted failure.
    pub fn heal(&self) {
        lock(&self.queued).clear();
        *lock(&self.persistent) = None;
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Calls received so far, including failed ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Count the call, wait out the latency, then apply the script.
    async fn enter(&self) -> Result<u32, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = lock(&self.queued).pop_front() {
            return Err(err);
        }
        if let Some(err) = lock(&self.persistent).clone() {
            return Err(err);
        }
        Ok(n)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPromptGenerator {
    faults: Faults,
}

impl MemoryPromptGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl PromptGenerator for MemoryPromptGenerator {
    async fn generate(&self, theme: &str) -> Result<Vec<Prompt>, ServiceError> {
        self.faults.enter().await?;
        let theme = theme.trim();
        let mut prompt = Prompt::from_text(format!(
            "{theme}, bold vector illustration, centered composition, high contrast"
        ));
        prompt.negative_prompt = "blurry, watermark, text".to_string();
        prompt.title = format!("{theme} design");
        prompt.description = format!("Original artwork inspired by {theme}.");
        prompt.tags = theme
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        Ok(vec![prompt])
    }
}

#[derive(Default)]
pub struct MemoryImageGenerator {
    faults: Faults,
}

impl MemoryImageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl ImageGenerator for MemoryImageGenerator {
    async fn generate(&self, prompt: &Prompt) -> Result<Vec<ImageRef>, ServiceError> {
        let n = self.faults.enter().await?;
        let id = format!("img-{}-{n}", prompt.generation_key());
        Ok(vec![ImageRef {
            url: format!("memory://images/{id}.png"),
            id,
            width: prompt.params.width,
            height: prompt.params.height,
            seed: prompt.params.seed,
        }])
    }
}

#[derive(Default)]
pub struct MemoryAssetStore {
    faults: Faults,
    saved: Mutex<Vec<SavedAsset>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub fn saved(&self) -> Vec<SavedAsset> {
        lock(&self.saved).clone()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn save(
        &self,
        image: &ImageRef,
        metadata: &AssetMetadata,
    ) -> Result<SavedAsset, ServiceError> {
        let n = self.faults.enter().await?;
        let id = format!("asset-{n}");
        let asset = SavedAsset {
            url: format!("memory://assets/{}/{id}.png", metadata.job_id),
            id,
            image_id: image.id.clone(),
            checksum: Some(sha256_hex(image.url.as_bytes())),
        };
        lock(&self.saved).push(asset.clone());
        Ok(asset)
    }
}

pub struct MemoryPublisher {
    platform: String,
    faults: Faults,
    published: Mutex<Vec<ProductSpec>>,
}

impl MemoryPublisher {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            faults: Faults::default(),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Products created so far.
    pub fn published(&self) -> Vec<ProductSpec> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl PlatformPublisher for MemoryPublisher {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn publish(
        &self,
        _asset: &SavedAsset,
        spec: &ProductSpec,
    ) -> Result<PublishReceipt, ServiceError> {
        let n = self.faults.enter().await?;
        lock(&self.published).push(spec.clone());
        let product_id = format!("{}-{n}", self.platform);
        Ok(PublishReceipt {
            url: Some(format!("memory://{}/products/{product_id}", self.platform)),
            product_id,
        })
    }
}
