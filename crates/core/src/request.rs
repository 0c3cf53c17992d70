//! Pipeline request sum type and its validation.
//!
//! Structural bounds are declared with `validator` derives; rules that need
//! context (registered publishers, duplicates) are checked by
//! [`PipelineRequest::validate_with`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

use crate::error::CoreError;

pub const MAX_PLATFORM_NAME_LEN: usize = 64;
pub const MAX_BATCH_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Product types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Tshirt,
    Hoodie,
    Sweatshirt,
    Poster,
    Canvas,
    Mug,
    Sticker,
    PhoneCase,
    ToteBag,
}

fn default_product_types() -> Vec<ProductType> {
    vec![ProductType::Tshirt]
}

// ---------------------------------------------------------------------------
// Request variants
// ---------------------------------------------------------------------------

/// Options shared by every request variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PipelineOptions {
    #[serde(default = "default_product_types")]
    #[validate(length(min = 1, max = 10))]
    pub product_types: Vec<ProductType>,

    /// Storefronts to publish to. Empty means generate and store only.
    #[serde(default)]
    #[validate(length(max = 16))]
    pub platforms: Vec<String>,

    /// When false, products are created as drafts.
    #[serde(default)]
    pub auto_publish: bool,

    /// Per-platform pass-through options keyed by platform name.
    #[serde(default)]
    pub platform_options: HashMap<String, serde_json::Value>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            product_types: default_product_types(),
            platforms: Vec::new(),
            auto_publish: false,
            platform_options: HashMap::new(),
        }
    }
}

/// Generate a prompt from a theme, then run the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ThemeRequest {
    #[validate(length(min = 1, max = 500))]
    pub theme: String,
    #[serde(default)]
    #[validate(nested)]
    pub options: PipelineOptions,
}

/// Run the pipeline with a caller-supplied prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PromptRequest {
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub options: PipelineOptions,
}

/// A job payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineRequest {
    Theme(ThemeRequest),
    Prompt(PromptRequest),
}

impl PipelineRequest {
    pub fn theme(theme: impl Into<String>, options: PipelineOptions) -> Self {
        PipelineRequest::Theme(ThemeRequest {
            theme: theme.into(),
            options,
        })
    }

    pub fn prompt(prompt: impl Into<String>, options: PipelineOptions) -> Self {
        PipelineRequest::Prompt(PromptRequest {
            prompt: prompt.into(),
            negative_prompt: None,
            options,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        match self {
            PipelineRequest::Theme(r) => &r.options,
            PipelineRequest::Prompt(r) => &r.options,
        }
    }

    /// Short human label for logs.
    pub fn label(&self) -> &str {
        match self {
            PipelineRequest::Theme(r) => &r.theme,
            PipelineRequest::Prompt(r) => &r.prompt,
        }
    }

    /// Validate the request shape and that every platform is known.
    pub fn validate_with(&self, is_known_platform: impl Fn(&str) -> bool) -> Result<(), CoreError> {
        let structural = match self {
            PipelineRequest::Theme(r) => r.validate(),
            PipelineRequest::Prompt(r) => r.validate(),
        };
        structural.map_err(|e| CoreError::Validation(describe(&e)))?;

        if self.label().trim().is_empty() {
            return Err(CoreError::Validation(
                "Request text must not be blank".to_string(),
            ));
        }

        let options = self.options();
        let mut seen = HashSet::new();
        for platform in &options.platforms {
            if !is_valid_platform_name(platform) {
                return Err(CoreError::Validation(format!(
                    "Invalid platform name '{platform}'"
                )));
            }
            if !seen.insert(platform.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate platform '{platform}'"
                )));
            }
            if !is_known_platform(platform) {
                return Err(CoreError::Validation(format!(
                    "No publisher registered for platform '{platform}'"
                )));
            }
        }

        let mut types = HashSet::new();
        if let Some(dup) = options.product_types.iter().find(|t| !types.insert(**t)) {
            return Err(CoreError::Validation(format!(
                "Duplicate product type '{}'",
                serde_json::to_value(dup)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default()
            )));
        }

        Ok(())
    }
}

/// Platform names are 1-64 characters of `a-z`, `0-9`, `_` or `-`.
pub fn is_valid_platform_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_PLATFORM_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Flatten `validator` errors into one message, sorted for stable output.
fn describe(errors: &ValidationErrors) -> String {
    let mut parts: Vec<String> = Vec::new();
    collect(errors, "", &mut parts);
    parts.sort();
    parts.join("; ")
}

fn collect(errors: &ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    use validator::ValidationErrorsKind;

    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(errs) => {
                for err in errs {
                    out.push(format!("{path}: {}", err.code));
                }
            }
            ValidationErrorsKind::Struct(inner) => collect(inner, &path, out),
            ValidationErrorsKind::List(items) => {
                for (idx, inner) in items {
                    collect(inner, &format!("{path}[{idx}]"), out);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
