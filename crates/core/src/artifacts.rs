//! Values exchanged with the external collaborators.

use serde::{Deserialize, Serialize};

use crate::hashing::{normalize_text, short_digest};
use crate::request::ProductType;
use crate::types::JobId;

/// Rendering parameters attached to a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            width: 4500,
            height: 5400,
            steps: 30,
            cfg_scale: 7.0,
            seed: None,
        }
    }
}

/// A design prompt plus the listing copy generated alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub params: GenerationParams,
}

impl Prompt {
    /// A bare prompt with default parameters and the text doubling as title.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            title: text.chars().take(80).collect(),
            text,
            negative_prompt: String::new(),
            description: String::new(),
            tags: Vec::new(),
            params: GenerationParams::default(),
        }
    }

    /// Key under which identical image generation requests collapse.
    ///
    /// Prompt text is normalised, the cfg scale is rounded to two decimals
    /// and the digest is truncated to 16 hex characters.
    pub fn generation_key(&self) -> String {
        let p = &self.params;
        let seed = p.seed.map(|s| s.to_string()).unwrap_or_default();
        let canonical = format!(
            "{}|{}|{}|{}|{}|{:.2}|{}",
            normalize_text(&self.text),
            normalize_text(&self.negative_prompt),
            p.width,
            p.height,
            p.steps,
            p.cfg_scale,
            seed,
        );
        short_digest(canonical.as_bytes())
    }
}

/// Key under which prompt generation for equivalent themes collapses.
pub fn theme_key(theme: &str) -> String {
    short_digest(normalize_text(theme).as_bytes())
}

/// A rendered image held by the image backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Metadata stored next to an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub job_id: JobId,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub prompt: String,
}

/// An image persisted by the asset store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedAsset {
    pub id: String,
    pub url: String,
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// What to create on a storefront.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSpec {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub product_types: Vec<ProductType>,
    /// `false` creates the product as a draft.
    pub publish: bool,
    /// Platform-specific options passed through untouched.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// What a storefront returned for a created product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
