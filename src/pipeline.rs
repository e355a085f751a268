//! Cutout pipeline orchestration
//!
//! [`CutoutPipeline`] runs the five stages of one invocation in order:
//! resolve the input, segment it, select candidates, composite, and deliver.
//! It owns no per-request state, so one instance serves concurrent requests;
//! the only shared mutable state is the segmenter's lazily loaded model.

use crate::composite::Compositor;
use crate::config::{CutoutScope, NoDetectionPolicy, PipelineConfig, TuningOverrides};
use crate::error::Result;
use crate::input::{ImageSource, InputResolver};
use crate::inference::{BackendFactory, DefaultBackendFactory};
use crate::models::ModelManager;
use crate::segmenter::{build_segmenter, Segmenter};
use crate::select;
use crate::sink::{ObjectTarget, Sink};
use crate::store::BlobStore;
use crate::types::{
    ConfigUsed, Cutout, CutoutOutcome, Diagnostics, ProcessingTimings, SourceImage,
};
use instant::Instant;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info as trace_info, instrument, span, Instrument, Level};

/// One unit of work: where the image comes from, where the result goes, and
/// per-request tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CutoutRequest {
    pub source: ImageSource,
    pub target: ObjectTarget,
    pub overrides: TuningOverrides,
}

impl CutoutRequest {
    #[must_use]
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            target: ObjectTarget::default(),
            overrides: TuningOverrides::default(),
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: ObjectTarget) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: TuningOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Resolver → segmenter → selector → compositor → sink
#[derive(Debug, Clone)]
pub struct CutoutPipeline {
    config: PipelineConfig,
    segmenter: Arc<dyn Segmenter>,
    resolver: InputResolver,
    sink: Sink,
    model_load_ms: Arc<OnceCell<u64>>,
}

impl CutoutPipeline {
    /// Pipeline around an existing segmenter
    ///
    /// `store` serves both object inputs and outputs.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - HTTP client construction failure
    pub fn new(
        config: PipelineConfig,
        segmenter: Arc<dyn Segmenter>,
        store: Option<Arc<dyn BlobStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut resolver = InputResolver::from_config(&config)?;
        if let Some(store) = &store {
            resolver = resolver.with_store(Arc::clone(store));
        }
        Ok(Self {
            config,
            segmenter,
            resolver,
            sink: Sink::new(store),
            model_load_ms: Arc::new(OnceCell::new()),
        })
    }

    /// Pipeline with the model-backed segmenter named in `config`
    ///
    /// # Errors
    /// - Invalid configuration or segmenter setup
    pub fn from_config(config: PipelineConfig, store: Option<Arc<dyn BlobStore>>) -> Result<Self> {
        Self::with_factory(config, store, Arc::new(DefaultBackendFactory))
    }

    /// Like [`from_config`](Self::from_config) with a custom backend factory
    ///
    /// # Errors
    /// - Invalid configuration or segmenter setup
    pub fn with_factory(
        config: PipelineConfig,
        store: Option<Arc<dyn BlobStore>>,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self> {
        let segmenter = build_segmenter(&config, factory, ModelManager::new(&config.model_dir))?;
        Self::new(config, segmenter, store)
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn segmenter(&self) -> &Arc<dyn Segmenter> {
        &self.segmenter
    }

    #[must_use]
    pub fn is_warm(&self) -> bool {
        self.model_load_ms.initialized()
    }

    /// Load model weights now instead of on the first request
    ///
    /// Returns the load time in milliseconds (the original one on later calls).
    ///
    /// # Errors
    /// - Model load failures; a later call retries
    pub async fn warm_up(&self) -> Result<u64> {
        let segmenter = Arc::clone(&self.segmenter);
        self.model_load_ms
            .get_or_try_init(|| async move {
                let loaded = segmenter.warm_up().await?;
                let ms = loaded.map_or(0, |d| d.as_millis() as u64);
                info!("Segmenter {} ready (model load {ms}ms)", segmenter.kind());
                Ok(ms)
            })
            .await
            .copied()
    }

    /// Run one request end to end
    ///
    /// A missing detection is an outcome, not an error.
    ///
    /// # Errors
    /// - `Input` for invalid overrides or oversized input
    /// - `Fetch` / `Decode` from the input resolver
    /// - `Inference` / `Model` from the segmenter
    /// - `Storage` / `InvalidConfig` from the sink
    #[instrument(
        skip(self, request),
        fields(segmenter = %self.segmenter.kind(), overrides = !request.overrides.is_empty())
    )]
    pub async fn run(&self, request: &CutoutRequest) -> Result<CutoutOutcome> {
        let total_start = Instant::now();
        let config = self.config.with_overrides(&request.overrides)?;

        let resolved = self
            .resolver
            .resolve(&request.source)
            .instrument(span!(Level::DEBUG, "resolve"))
            .await?;

        let mut timings = ProcessingTimings {
            fetch_ms: resolved.fetch_ms,
            decode_ms: resolved.decode_ms,
            ..ProcessingTimings::default()
        };
        let outcome = self
            .process_with(&resolved.image, &config, &request.target, &mut timings)
            .await?;
        Ok(finish(outcome, timings, total_start))
    }

    /// Run the stages after input resolution on an already decoded image
    ///
    /// # Errors
    /// - As [`run`](Self::run), minus input errors
    pub async fn process(
        &self,
        image: &SourceImage,
        target: &ObjectTarget,
        overrides: &TuningOverrides,
    ) -> Result<CutoutOutcome> {
        let total_start = Instant::now();
        let config = self.config.with_overrides(overrides)?;
        let mut timings = ProcessingTimings::default();
        let outcome = self.process_with(image, &config, target, &mut timings).await?;
        Ok(finish(outcome, timings, total_start))
    }

    async fn process_with(
        &self,
        image: &SourceImage,
        config: &PipelineConfig,
        target: &ObjectTarget,
        timings: &mut ProcessingTimings,
    ) -> Result<CutoutOutcome> {
        let was_warm = self.is_warm();
        let load_ms = self.warm_up().await?;
        if !was_warm {
            timings.model_load_ms = load_ms;
        }

        trace_info!(
            width = image.width(),
            height = image.height(),
            segmenter = %config.segmenter,
            "Segmenting image"
        );
        let inference_start = Instant::now();
        let masks = self
            .segmenter
            .segment(image, config)
            .instrument(span!(
                Level::INFO,
                "segment",
                kind = %self.segmenter.kind(),
                width = image.width(),
                height = image.height()
            ))
            .await?;
        timings.inference_ms = inference_start.elapsed().as_millis() as u64;
        let detected_count = masks.len();

        let policy = config.effective_policy();
        let selection_start = Instant::now();
        let order: Vec<usize> = {
            let _span = span!(Level::DEBUG, "select", policy = policy.name()).entered();
            match config.scope {
                CutoutScope::Best => select::select(&masks, policy).into_iter().collect(),
                CutoutScope::All => select::rank(&masks, policy),
            }
        };
        timings.selection_ms = selection_start.elapsed().as_millis() as u64;
        debug!(
            "{detected_count} candidates, {} selected by {}",
            order.len(),
            policy.name()
        );

        let compositing_start = Instant::now();
        let mut passed_through = false;
        let cutouts: Vec<Cutout> = if order.is_empty() {
            match config.no_detection {
                NoDetectionPolicy::Reject => {
                    info!("No detection; rejecting");
                    return Ok(CutoutOutcome::NoDetection {
                        detected_count,
                        diagnostics: diagnostics(config, timings.clone(), false),
                    });
                },
                NoDetectionPolicy::Empty => Vec::new(),
                NoDetectionPolicy::PassThrough => {
                    passed_through = true;
                    vec![Compositor::opaque(image)]
                },
            }
        } else {
            let _span = span!(Level::DEBUG, "composite", count = order.len()).entered();
            let compositor = Compositor::from_config(config);
            order
                .iter()
                .filter_map(|&index| masks.get(index))
                .map(|mask| compositor.composite(image, mask))
                .collect()
        };
        timings.compositing_ms = compositing_start.elapsed().as_millis() as u64;

        let mut references = Vec::with_capacity(cutouts.len());
        for (index, cutout) in cutouts.into_iter().enumerate() {
            let delivered = self
                .sink
                .deliver(cutout, image, target, &config.storage, index)
                .instrument(span!(Level::DEBUG, "deliver", index))
                .await?;
            timings.encode_ms += delivered.encode_ms;
            timings.store_ms += delivered.store_ms;
            references.push(delivered.reference);
        }

        Ok(CutoutOutcome::Stored {
            references,
            detected_count,
            diagnostics: diagnostics(config, timings.clone(), passed_through),
        })
    }
}

fn diagnostics(
    config: &PipelineConfig,
    timings: ProcessingTimings,
    passed_through: bool,
) -> Diagnostics {
    Diagnostics {
        config_used: ConfigUsed::from_config(config),
        timings,
        passed_through,
    }
}

/// Stamp the final timings onto an outcome
fn finish(outcome: CutoutOutcome, mut timings: ProcessingTimings, start: Instant) -> CutoutOutcome {
    timings.total_ms = start.elapsed().as_millis() as u64;
    info!(
        "Cutout finished in {}ms (fetch {}ms, inference {}ms, store {}ms)",
        timings.total_ms, timings.fetch_ms, timings.inference_ms, timings.store_ms
    );
    match outcome {
        CutoutOutcome::Stored {
            references,
            detected_count,
            diagnostics,
        } => CutoutOutcome::Stored {
            references,
            detected_count,
            diagnostics: Diagnostics {
                timings,
                ..diagnostics
            },
        },
        CutoutOutcome::NoDetection {
            detected_count,
            diagnostics,
        } => CutoutOutcome::NoDetection {
            detected_count,
            diagnostics: Diagnostics {
                timings,
                ..diagnostics
            },
        },
    }
}
