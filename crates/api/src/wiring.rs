//! Builds the collaborator bundle from [`CollaboratorConfig`].
//!
//! Every service with a configured URL gets the JSON-over-HTTP connector;
//! the rest fall back to the in-memory implementations with a warning.

use std::sync::Arc;
use std::time::Duration;

use podflow_pipeline::collaborators::{AssetStore, Collaborators, ImageGenerator, PromptGenerator};
use podflow_pipeline::http::{
    HttpAssetStore, HttpImageGenerator, HttpPromptGenerator, HttpPublisher, HttpService,
};
use podflow_pipeline::memory::{
    MemoryAssetStore, MemoryImageGenerator, MemoryPromptGenerator, MemoryPublisher,
};

use crate::config::CollaboratorConfig;

/// Platform registered when no publisher URLs are configured.
pub const SANDBOX_PLATFORM: &str = "sandbox";

pub fn build_collaborators(config: &CollaboratorConfig, call_timeout: Duration) -> Collaborators {
    let prompts: Arc<dyn PromptGenerator> = match &config.prompt_service_url {
        Some(url) => Arc::new(HttpPromptGenerator(HttpService::new(url, call_timeout))),
        None => {
            tracing::warn!("PROMPT_SERVICE_URL not set; using in-memory prompt generator");
            Arc::new(MemoryPromptGenerator::new())
        }
    };
    let images: Arc<dyn ImageGenerator> = match &config.image_service_url {
        Some(url) => Arc::new(HttpImageGenerator(HttpService::new(url, call_timeout))),
        None => {
            tracing::warn!("IMAGE_SERVICE_URL not set; using in-memory image generator");
            Arc::new(MemoryImageGenerator::new())
        }
    };
    let assets: Arc<dyn AssetStore> = match &config.asset_service_url {
        Some(url) => Arc::new(HttpAssetStore(HttpService::new(url, call_timeout))),
        None => {
            tracing::warn!("ASSET_SERVICE_URL not set; using in-memory asset store");
            Arc::new(MemoryAssetStore::new())
        }
    };

    let mut collaborators = Collaborators::new(prompts, images, assets);
    if config.publishers.is_empty() {
        tracing::warn!(
            platform = SANDBOX_PLATFORM,
            "PUBLISHER_URLS not set; registering in-memory publisher",
        );
        collaborators = collaborators.with_publisher(Arc::new(MemoryPublisher::new(SANDBOX_PLATFORM)));
    }
    for (platform, url) in &config.publishers {
        tracing::info!(platform = %platform, url = %url, "Registering publisher");
        collaborators = collaborators.with_publisher(Arc::new(HttpPublisher::new(
            platform.clone(),
            HttpService::new(url, call_timeout),
        )));
    }
    collaborators
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_registers_sandbox_publisher() {
        let collaborators = build_collaborators(&CollaboratorConfig::default(), Duration::from_secs(5));
        assert_eq!(collaborators.platforms(), vec![SANDBOX_PLATFORM.to_string()]);
    }

    #[test]
    fn configured_publishers_replace_sandbox() {
        let config = CollaboratorConfig {
            publishers: vec![
                ("printify".into(), "http://localhost:9001".into()),
                ("etsy".into(), "http://localhost:9002".into()),
            ],
            ..CollaboratorConfig::default()
        };
        let collaborators = build_collaborators(&config, Duration::from_secs(5));
        assert_eq!(collaborators.platforms(), vec!["etsy".to_string(), "printify".to_string()]);
    }
}
