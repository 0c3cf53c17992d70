//! Interfaces the pipeline consumes from external services.
//!
//! Every trait is object safe so implementations can be swapped at startup
//! (HTTP connectors in production, [`crate::memory`] fakes in tests).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use podflow_core::artifacts::{
    AssetMetadata, ImageRef, ProductSpec, Prompt, PublishReceipt, SavedAsset,
};
use podflow_core::error::ServiceError;

/// Breaker name of the prompt generation service.
pub const PROMPT_GENERATOR: &str = "prompt-generator";
/// Breaker name of the image generation service.
pub const IMAGE_GENERATOR: &str = "image-generator";
/// Breaker name of the asset store.
pub const ASSET_STORE: &str = "asset-store";

/// Breaker name of a storefront, e.g. `platform:printify`.
pub fn platform_dependency(platform: &str) -> String {
    format!("platform:{platform}")
}

#[async_trait]
pub trait PromptGenerator: Send + Sync {
    /// Produce one or more design prompts for a theme.
    async fn generate(&self, theme: &str) -> Result<Vec<Prompt>, ServiceError>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Render a prompt. Implementations that poll a remote job internally
    /// still appear as one call here.
    async fn generate(&self, prompt: &Prompt) -> Result<Vec<ImageRef>, ServiceError>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn save(
        &self,
        image: &ImageRef,
        metadata: &AssetMetadata,
    ) -> Result<SavedAsset, ServiceError>;
}

#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    /// Platform name used in requests and results.
    fn platform(&self) -> &str;

    async fn publish(
        &self,
        asset: &SavedAsset,
        spec: &ProductSpec,
    ) -> Result<PublishReceipt, ServiceError>;
}

/// The set of services one engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub prompts: Arc<dyn PromptGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub assets: Arc<dyn AssetStore>,
    publishers: BTreeMap<String, Arc<dyn PlatformPublisher>>,
}

impl Collaborators {
    pub fn new(
        prompts: Arc<dyn PromptGenerator>,
        images: Arc<dyn ImageGenerator>,
        assets: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            prompts,
            images,
            assets,
            publishers: BTreeMap::new(),
        }
    }

    /// Register a publisher under its own platform name, replacing any
    /// previous one for the same platform.
    pub fn with_publisher(mut self, publisher: Arc<dyn PlatformPublisher>) -> Self {
        self.publishers
            .insert(publisher.platform().to_string(), publisher);
        self
    }

    pub fn publisher(&self, platform: &str) -> Option<&Arc<dyn PlatformPublisher>> {
        self.publishers.get(platform)
    }

    pub fn has_platform(&self, platform: &str) -> bool {
        self.publishers.contains_key(platform)
    }

    /// Registered platform names, sorted.
    pub fn platforms(&self) -> Vec<String> {
        self.publishers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("platforms", &self.platforms())
            .finish_non_exhaustive()
    }
}
