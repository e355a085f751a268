//! museum-cutout command-line tool
//!
//! Runs the cutout pipeline on a local file, URL, `s3://` reference or stdin,
//! or feeds a recorded invocation event through the invocation boundary.

use super::config::{CliConfigBuilder, StoreSpec};
use crate::config::{
    AlphaMode, CutoutScope, NoDetectionPolicy, PipelineConfig, ResampleFilter, ReturnMode,
    SegmenterKind, SelectionPolicy,
};
use crate::input::{ImageSource, InputResolver};
use crate::invocation::{self, InvocationResponse};
use crate::models::ModelManager;
use crate::pipeline::{CutoutPipeline, CutoutRequest};
use crate::sink::{indexed_key, ObjectTarget};
use crate::store::BlobStore;
use crate::tracing_config::{init_cli_tracing, spans};
use crate::types::{CutoutOutcome, Provenance, Reference};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Cut the main subject out of an image and store it as a transparent PNG
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "museum-cutout")]
pub struct Cli {
    /// Image to process: local path, http(s):// URL, s3://bucket/key or "-" for stdin
    #[arg(value_name = "INPUT", required_unless_present_any = ["event", "only_download"])]
    pub input: Option<String>,

    /// Invocation event JSON to run through the event boundary ("-" for stdin)
    #[arg(long, value_name = "FILE", conflicts_with = "input")]
    pub event: Option<String>,

    /// Also write the cutout PNG here
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Segmenter: foreground, prompted, automatic or detection
    #[arg(short, long)]
    pub segmenter: Option<SegmenterKind>,

    /// Execution provider as backend:provider (onnx:auto, onnx:cuda, tract:cpu)
    #[arg(short, long)]
    pub execution_provider: Option<String>,

    /// Inference threads (0 = runtime default)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Model file name, path or URL (encoder for prompted/automatic)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Mask decoder file name, path or URL (prompted/automatic)
    #[arg(long)]
    pub decoder: Option<String>,

    /// Directory that named models are resolved against
    #[arg(long, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// Candidate ranking: salience, area or confidence
    #[arg(long)]
    pub policy: Option<SelectionPolicy>,

    /// best or all
    #[arg(long)]
    pub scope: Option<CutoutScope>,

    /// When nothing is found: reject, pass-through or empty
    #[arg(long)]
    pub no_detection: Option<NoDetectionPolicy>,

    /// Mask resampling: nearest or bilinear
    #[arg(long)]
    pub filter: Option<ResampleFilter>,

    /// Alpha: binary or soft
    #[arg(long)]
    pub alpha: Option<AlphaMode>,

    /// Detection confidence threshold
    #[arg(long)]
    pub conf: Option<f32>,

    /// Detection NMS IoU threshold
    #[arg(long)]
    pub iou: Option<f32>,

    /// Maximum detections kept
    #[arg(long)]
    pub max_det: Option<usize>,

    /// Detector input size (multiple of 32)
    #[arg(long)]
    pub imgsz: Option<u32>,

    /// Full-resolution instance masks
    #[arg(long)]
    pub retina_masks: Option<bool>,

    /// Prompt point "x,y" in pixels for the prompted segmenter
    #[arg(long, value_name = "X,Y")]
    pub point: Option<String>,

    /// Blob store: none, memory, fs:DIR or s3
    #[arg(long, default_value = "memory")]
    pub store: String,

    /// Output bucket
    #[arg(long)]
    pub bucket: Option<String>,

    /// Exact output key instead of a generated one
    #[arg(long)]
    pub key: Option<String>,

    /// Prefix for generated keys
    #[arg(long)]
    pub prefix: Option<String>,

    /// CDN base for public URLs
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// presigned, s3-uri, public-url or inline-binary
    #[arg(short, long)]
    pub return_mode: Option<ReturnMode>,

    /// Presigned URL validity in seconds
    #[arg(long)]
    pub presign_expires: Option<u64>,

    /// Download remote models and exit
    #[arg(long)]
    pub only_download: bool,

    /// Verbosity (-v debug, -vv trace for this crate, -vvv everything)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let session_id = uuid::Uuid::new_v4().to_string();
    let _tracing = init_cli_tracing(cli.verbose, &session_id)
        .context("Failed to initialize tracing")?;

    let config = CliConfigBuilder::from_cli(&cli)?;
    let store = StoreSpec::parse(&cli.store)?.build()?;

    ensure_models(&config).await?;
    if cli.only_download {
        println!("Models ready in {}", config.model_dir.display());
        return Ok(());
    }

    let pipeline = CutoutPipeline::from_config(config.clone(), store.clone())
        .context("Failed to set up the cutout pipeline")?;
    let span = spans::invocation(
        &session_id,
        config.segmenter.as_str(),
        cli.event.as_deref().or(cli.input.as_deref()).unwrap_or("-"),
    );

    if let Some(event) = &cli.event {
        return run_event(&cli, &pipeline, event).instrument(span).await;
    }
    let input = cli.input.as_deref().context("An input is required")?;
    run_input(&cli, &pipeline, store.as_ref(), input)
        .instrument(span)
        .await
}

/// Fetch remote model files up front so the first request does not pay for it
async fn ensure_models(config: &PipelineConfig) -> Result<()> {
    let span = spans::model_loading(
        config.segmenter.as_str(),
        &format!("{:?}", config.backend_type),
    );
    ModelManager::new(config.model_dir.clone())
        .ensure_available(&config.effective_model_spec(), true)
        .instrument(span)
        .await
        .context("Model files are not available")
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    io::stdin()
        .read_to_end(&mut bytes)
        .context("Failed to read stdin")?;
    Ok(bytes)
}

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg} ({elapsed})") {
        bar.set_style(style);
    }
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

async fn run_event(cli: &Cli, pipeline: &CutoutPipeline, path: &str) -> Result<()> {
    let raw = if path == "-" {
        read_stdin()?
    } else {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read event file {path}"))?
    };
    let event: serde_json::Value =
        serde_json::from_slice(&raw).context("Event file is not valid JSON")?;

    let response = invocation::handle(pipeline, &event).await;
    if let Some(output) = &cli.output {
        write_inline_body(&response, output).await?;
    }
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response.status_code >= 400 {
        bail!("Invocation finished with status {}", response.status_code);
    }
    Ok(())
}

async fn write_inline_body(response: &InvocationResponse, output: &Path) -> Result<()> {
    if !response.is_base64_encoded {
        warn!("--output ignored: the response carries no inline image");
        return Ok(());
    }
    let png = general_purpose::STANDARD
        .decode(&response.body)
        .context("Response body is not valid base64")?;
    tokio::fs::write(output, png)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))
}

async fn run_input(
    cli: &Cli,
    pipeline: &CutoutPipeline,
    store: Option<&Arc<dyn BlobStore>>,
    input: &str,
) -> Result<()> {
    let target = ObjectTarget {
        bucket: None,
        key: cli.key.clone(),
    };
    let start = Instant::now();
    let bar = spinner(format!("Cutting out {input}"));

    let outcome = if input == "-" {
        let request = CutoutRequest::new(ImageSource::Bytes(read_stdin()?)).with_target(target);
        pipeline.run(&request).await
    } else if input.contains("://") {
        let request = CutoutRequest::new(ImageSource::from_reference(input)?).with_target(target);
        pipeline.run(&request).await
    } else {
        // local files keep their name for key generation
        let path = Path::new(input);
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let provenance = Provenance::Url {
            url: format!("file://{}", absolute.display()),
        };
        let image = InputResolver::decode(&bytes, provenance)?;
        pipeline
            .process(&image, &target, &Default::default())
            .await
    };
    bar.finish_and_clear();
    let outcome = outcome.with_context(|| format!("Failed to cut out {input}"))?;

    report(&outcome, start.elapsed());
    if outcome.is_no_detection() {
        bail!("No subject detected in {input}");
    }
    if let Some(output) = &cli.output {
        save_outputs(&outcome, store, output).await?;
    }
    Ok(())
}

fn report(outcome: &CutoutOutcome, elapsed: Duration) {
    let diagnostics = outcome.diagnostics();
    let timings = &diagnostics.timings;
    info!(
        "{} candidate(s), model load {}ms, inference {}ms, store {}ms, total {:.2}s",
        outcome.detected_count(),
        timings.model_load_ms,
        timings.inference_ms,
        timings.store_ms,
        elapsed.as_secs_f64()
    );
    if diagnostics.passed_through {
        warn!("Nothing detected; stored the source unchanged");
    }
    for reference in outcome.references() {
        match reference {
            Reference::Stored { url, .. } => println!("{url}"),
            Reference::Inline { png, copy } => match copy {
                Some(location) => println!("inline ({} bytes), copy at {location}", png.len()),
                None => println!("inline ({} bytes)", png.len()),
            },
        }
    }
}

/// Write every cutout locally; the n-th gets `-n` before the extension
async fn save_outputs(
    outcome: &CutoutOutcome,
    store: Option<&Arc<dyn BlobStore>>,
    output: &Path,
) -> Result<()> {
    let output_str = output.to_string_lossy();
    for (index, reference) in outcome.references().iter().enumerate() {
        let png = match reference {
            Reference::Inline { png, .. } => png.clone(),
            Reference::Stored { location, .. } => {
                let store = store.context("No store to read the stored cutout back from")?;
                store
                    .get_object(location)
                    .await?
                    .with_context(|| format!("{location} vanished from the store"))?
            },
        };
        let path = PathBuf::from(indexed_key(&output_str, index));
        tokio::fs::write(&path, png)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}
