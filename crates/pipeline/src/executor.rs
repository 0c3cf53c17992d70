//! Runs one job through prompt → image → storage → publish.
//!
//! Every external call goes through the [`RetryPolicy`] and the breaker of
//! its dependency. Prompt, image and storage failures abort the run. Publish
//! targets are independent: a failing platform is recorded and the others
//! continue, and the run only fails when every platform failed.
//!
//! Cancellation is checked at every stage boundary and before each call
//! attempt; a call already in flight is never interrupted.

use std::sync::Arc;

use futures::future::join_all;
use podflow_core::artifacts::{AssetMetadata, Prompt, ProductSpec, SavedAsset};
use podflow_core::error::ServiceError;
use podflow_core::job::{JobResult, PublishOutcome, Stage, StageReport};
use podflow_core::request::PipelineRequest;
use podflow_core::types::JobId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::GenerationCache;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::collaborators::{
    platform_dependency, Collaborators, ASSET_STORE, IMAGE_GENERATOR, PROMPT_GENERATOR,
};
use crate::retry::RetryPolicy;

/// Receives stage transitions while a job runs.
pub trait StageObserver: Send + Sync {
    fn stage_started(&self, stage: Stage);
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn stage_started(&self, _stage: Stage) {}
}

/// Why a run stopped, with whatever was produced before it did.
#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub error: ServiceError,
    pub stage: Option<Stage>,
    pub partial: JobResult,
}

impl PipelineFailure {
    fn at(stage: Stage, error: ServiceError, partial: JobResult) -> Self {
        Self {
            error,
            stage: Some(stage),
            partial,
        }
    }
}

/// Per-run inputs threaded through the stages.
struct Run<'a> {
    job_id: JobId,
    request: &'a PipelineRequest,
    cancel: &'a CancellationToken,
    observer: &'a dyn StageObserver,
}

impl Run<'_> {
    fn enter(&self, stage: Stage) -> Result<Instant, ServiceError> {
        if self.cancel.is_cancelled() {
            tracing::info!(job_id = %self.job_id, stage = %stage, "Cancellation observed at stage boundary");
            return Err(ServiceError::Cancelled);
        }
        tracing::debug!(job_id = %self.job_id, stage = %stage, "Stage started");
        self.observer.stage_started(stage);
        Ok(Instant::now())
    }
}

fn report(stage: Stage, started: Instant, attempts: u32, cache_hit: bool) -> StageReport {
    StageReport {
        stage,
        attempts,
        duration_ms: started.elapsed().as_millis() as u64,
        cache_hit,
    }
}

/// Record the report of a stage that stopped early and hand back its error.
fn stage_failed(
    result: &mut JobResult,
    stage: Stage,
    started: Instant,
    attempts: u32,
    error: ServiceError,
) -> ServiceError {
    result.stages.push(report(stage, started, attempts, false));
    error
}

pub struct PipelineExecutor {
    collaborators: Collaborators,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<GenerationCache>,
    retry: RetryPolicy,
}

impl PipelineExecutor {
    pub fn new(
        collaborators: Collaborators,
        breakers: Arc<CircuitBreakerRegistry>,
        cache: Arc<GenerationCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            collaborators,
            breakers,
            cache,
            retry,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Execute every stage for `request`.
    pub async fn run(
        &self,
        job_id: JobId,
        request: &PipelineRequest,
        cancel: &CancellationToken,
        observer: &dyn StageObserver,
    ) -> Result<JobResult, PipelineFailure> {
        let run = Run {
            job_id,
            request,
            cancel,
            observer,
        };
        let mut result = JobResult::default();

        let prompt = match self.prompt_stage(&run, &mut result).await {
            Ok(prompt) => prompt,
            Err(e) => return Err(PipelineFailure::at(Stage::Prompt, e, result)),
        };
        if let Err(e) = self.image_stage(&run, &prompt, &mut result).await {
            return Err(PipelineFailure::at(Stage::Image, e, result));
        }
        if let Err(e) = self.storage_stage(&run, &prompt, &mut result).await {
            return Err(PipelineFailure::at(Stage::Storage, e, result));
        }
        if let Err(e) = self.publish_stage(&run, &prompt, &mut result).await {
            return Err(PipelineFailure::at(Stage::Publish, e, result));
        }

        if cancel.is_cancelled() {
            return Err(PipelineFailure {
                error: ServiceError::Cancelled,
                stage: None,
                partial: result,
            });
        }
        Ok(result)
    }

    async fn prompt_stage(
        &self,
        run: &Run<'_>,
        result: &mut JobResult,
    ) -> Result<Prompt, ServiceError> {
        let started = run.enter(Stage::Prompt)?;

        let (prompt, attempts, cache_hit) = match run.request {
            PipelineRequest::Prompt(req) => {
                let mut prompt = Prompt::from_text(req.prompt.trim());
                if let Some(negative) = &req.negative_prompt {
                    prompt.negative_prompt = negative.clone();
                }
                (prompt, 0, false)
            }
            PipelineRequest::Theme(req) => {
                let (prompts, attempts, cache_hit) = match self.cache.prompts_for(&req.theme) {
                    Some(prompts) => (prompts, 0, true),
                    None => {
                        let breaker = self.breakers.get(PROMPT_GENERATOR).await;
                        let generator = self.collaborators.prompts.as_ref();
                        let theme = req.theme.as_str();
                        let (prompts, attempts) = match self
                            .retry
                            .execute(&breaker, run.cancel, move || generator.generate(theme))
                            .await
                        {
                            Ok(done) => done,
                            Err(f) => {
                                return Err(stage_failed(
                                    result,
                                    Stage::Prompt,
                                    started,
                                    f.attempts,
                                    f.error,
                                ));
                            }
                        };
                        if !prompts.is_empty() {
                            self.cache.store_prompts(theme, prompts.clone());
                        }
                        (prompts, attempts, false)
                    }
                };
                let Some(prompt) = prompts.into_iter().next() else {
                    let err = ServiceError::permanent("Prompt generator returned no prompts");
                    return Err(stage_failed(result, Stage::Prompt, started, attempts, err));
                };
                (prompt, attempts, cache_hit)
            }
        };

        result.prompt = Some(prompt.clone());
        result
            .stages
            .push(report(Stage::Prompt, started, attempts, cache_hit));
        Ok(prompt)
    }

    async fn image_stage(
        &self,
        run: &Run<'_>,
        prompt: &Prompt,
        result: &mut JobResult,
    ) -> Result<(), ServiceError> {
        let started = run.enter(Stage::Image)?;

        let (images, attempts, cache_hit) = match self.cache.images_for(prompt) {
            Some(images) => (images, 0, true),
            None => {
                let breaker = self.breakers.get(IMAGE_GENERATOR).await;
                let generator = self.collaborators.images.as_ref();
                let (images, attempts) = match self
                    .retry
                    .execute(&breaker, run.cancel, move || generator.generate(prompt))
                    .await
                {
                    Ok(done) => done,
                    Err(f) => {
                        return Err(stage_failed(
                            result,
                            Stage::Image,
                            started,
                            f.attempts,
                            f.error,
                        ));
                    }
                };
                if images.is_empty() {
                    let err = ServiceError::permanent("Image generator returned no images");
                    return Err(stage_failed(result, Stage::Image, started, attempts, err));
                }
                self.cache.store_images(prompt, images.clone());
                (images, attempts, false)
            }
        };

        tracing::debug!(job_id = %run.job_id, images = images.len(), cache_hit, "Images ready");
        result.images = images;
        result
            .stages
            .push(report(Stage::Image, started, attempts, cache_hit));
        Ok(())
    }

    async fn storage_stage(
        &self,
        run: &Run<'_>,
        prompt: &Prompt,
        result: &mut JobResult,
    ) -> Result<(), ServiceError> {
        let started = run.enter(Stage::Storage)?;
        let breaker = self.breakers.get(ASSET_STORE).await;
        let store = self.collaborators.assets.as_ref();
        let metadata = AssetMetadata {
            job_id: run.job_id,
            title: prompt.title.clone(),
            description: prompt.description.clone(),
            tags: prompt.tags.clone(),
            prompt: prompt.text.clone(),
        };

        let mut attempts = 0;
        let mut assets = Vec::with_capacity(result.images.len());
        let mut failure = None;
        for image in &result.images {
            let metadata = &metadata;
            let saved = self
                .retry
                .execute(&breaker, run.cancel, move || store.save(image, metadata))
                .await;
            match saved {
                Ok((asset, used)) => {
                    attempts += used;
                    assets.push(asset);
                }
                Err(f) => {
                    failure = Some(f);
                    break;
                }
            }
        }
        result.assets = assets;
        if let Some(f) = failure {
            let attempts = attempts + f.attempts;
            return Err(stage_failed(result, Stage::Storage, started, attempts, f.error));
        }

        result
            .stages
            .push(report(Stage::Storage, started, attempts, false));
        Ok(())
    }

    async fn publish_stage(
        &self,
        run: &Run<'_>,
        prompt: &Prompt,
        result: &mut JobResult,
    ) -> Result<(), ServiceError> {
        let options = run.request.options();
        if options.platforms.is_empty() {
            return Ok(());
        }
        let started = run.enter(Stage::Publish)?;
        let Some(asset) = result.assets.first().cloned() else {
            let err = ServiceError::Internal("No stored asset to publish".to_string());
            return Err(stage_failed(result, Stage::Publish, started, 0, err));
        };

        let calls = options.platforms.iter().map(|platform| {
            let spec = ProductSpec {
                title: prompt.title.clone(),
                description: prompt.description.clone(),
                tags: prompt.tags.clone(),
                product_types: options.product_types.clone(),
                publish: options.auto_publish,
                options: options
                    .platform_options
                    .get(platform)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            };
            self.publish_one(run, platform, &asset, spec)
        });
        let settled = join_all(calls).await;

        let mut attempts = 0;
        let mut first_error = None;
        for (outcome, used, error) in settled {
            attempts += used;
            if let Some(e) = error {
                let cancelled = matches!(e, ServiceError::Cancelled);
                if first_error.is_none() || cancelled {
                    first_error = Some(e);
                }
            }
            result.publish.push(outcome);
        }
        result
            .stages
            .push(report(Stage::Publish, started, attempts, false));

        if result.all_platforms_failed() {
            return Err(first_error
                .unwrap_or_else(|| ServiceError::Internal("All platforms failed".to_string())));
        }
        if result.is_partial() {
            tracing::warn!(
                job_id = %run.job_id,
                published = result.published_count(),
                requested = result.publish.len(),
                "Partial publish",
            );
        }
        Ok(())
    }

    /// Publish to one platform; never fails, the outcome carries the error.
    async fn publish_one(
        &self,
        run: &Run<'_>,
        platform: &str,
        asset: &SavedAsset,
        spec: ProductSpec,
    ) -> (PublishOutcome, u32, Option<ServiceError>) {
        let Some(publisher) = self.collaborators.publisher(platform) else {
            let err = ServiceError::Validation(format!("No publisher registered for '{platform}'"));
            return (PublishOutcome::failed(platform, &err), 0, Some(err));
        };
        let publisher = publisher.as_ref();
        let breaker = self.breakers.get(&platform_dependency(platform)).await;
        let spec = &spec;

        match self
            .retry
            .execute(&breaker, run.cancel, move || publisher.publish(asset, spec))
            .await
        {
            Ok((receipt, attempts)) => {
                tracing::info!(job_id = %run.job_id, platform, product_id = %receipt.product_id, "Published");
                (
                    PublishOutcome::published(platform, receipt.product_id, receipt.url),
                    attempts,
                    None,
                )
            }
            Err(f) => {
                tracing::warn!(
                    job_id = %run.job_id,
                    platform,
                    attempts = f.attempts,
                    error = %f.error,
                    "Publish failed",
                );
                (PublishOutcome::failed(platform, &f.error), f.attempts, Some(f.error))
            }
        }
    }
}
