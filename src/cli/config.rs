//! Turning CLI arguments into pipeline configuration and a blob store

use crate::cli::main_impl::Cli;
use crate::config::{BackendType, ExecutionProvider, PipelineConfig};
use crate::models::{ModelSource, ModelSpec};
use crate::store::{BlobStore, FsStore, MemoryStore, S3Config, S3Store};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Bucket used by local stores when nothing else names one
pub(crate) const LOCAL_BUCKET: &str = "cutouts";

/// Blob store named on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreSpec {
    None,
    Memory,
    Fs(PathBuf),
    S3,
}

impl StoreSpec {
    pub(crate) fn parse(spec: &str) -> Result<Self> {
        match spec.trim() {
            "none" => Ok(Self::None),
            "memory" | "mem" => Ok(Self::Memory),
            "s3" => Ok(Self::S3),
            other => match other.strip_prefix("fs:") {
                Some(dir) if !dir.is_empty() => Ok(Self::Fs(PathBuf::from(dir))),
                _ => bail!("Unknown store '{other}' (expected none, memory, fs:DIR or s3)"),
            },
        }
    }

    pub(crate) fn is_local(&self) -> bool {
        matches!(self, Self::Memory | Self::Fs(_))
    }

    pub(crate) fn build(&self) -> Result<Option<Arc<dyn BlobStore>>> {
        let store: Arc<dyn BlobStore> = match self {
            Self::None => return Ok(None),
            Self::Memory => Arc::new(MemoryStore::new()),
            Self::Fs(dir) => Arc::new(FsStore::new(dir)),
            Self::S3 => {
                let config = S3Config::from_env().context("S3 store needs AWS credentials")?;
                Arc::new(S3Store::new(config)?)
            },
        };
        Ok(Some(store))
    }
}

/// `backend:provider`, `backend` or `provider`
pub(crate) fn parse_provider(value: &str) -> Result<(BackendType, ExecutionProvider)> {
    match value.split_once(':') {
        Some((backend, provider)) => Ok((backend.parse()?, provider.parse()?)),
        None => match value.parse::<BackendType>() {
            Ok(backend) => Ok((backend, ExecutionProvider::Auto)),
            Err(_) => Ok((BackendType::default(), value.parse()?)),
        },
    }
}

/// `x,y` in pixels
pub(crate) fn parse_point(value: &str) -> Result<(f32, f32)> {
    let (x, y) = value
        .split_once(',')
        .with_context(|| format!("Point '{value}' must be 'x,y'"))?;
    Ok((
        x.trim().parse().with_context(|| format!("Bad x in '{value}'"))?,
        y.trim().parse().with_context(|| format!("Bad y in '{value}'"))?,
    ))
}

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Environment defaults with command-line flags layered on top
    pub(crate) fn from_cli(cli: &Cli) -> Result<PipelineConfig> {
        let config = PipelineConfig::from_env().context("Invalid environment configuration")?;
        Self::apply(cli, config)
    }

    pub(crate) fn apply(cli: &Cli, mut config: PipelineConfig) -> Result<PipelineConfig> {
        if let Some(kind) = cli.segmenter {
            config.segmenter = kind;
        }
        if let Some(provider) = &cli.execution_provider {
            let (backend, provider) =
                parse_provider(provider).context("Invalid execution provider")?;
            config.backend_type = backend;
            config.execution_provider = provider;
        }
        if cli.threads > 0 {
            config.intra_threads = cli.threads;
            config.inter_threads = cli.threads;
        }
        if let Some(dir) = &cli.model_dir {
            config.model_dir = dir.clone();
        }
        if let Some(model) = &cli.model {
            let mut spec = ModelSpec::new(ModelSource::parse(model));
            if let Some(decoder) = &cli.decoder {
                spec = spec.with_decoder(ModelSource::parse(decoder));
            }
            config.model_spec = Some(spec);
        } else if cli.decoder.is_some() {
            bail!("--decoder requires --model");
        }

        if let Some(policy) = cli.policy {
            config.selection_policy = Some(policy);
        }
        if let Some(scope) = cli.scope {
            config.scope = scope;
        }
        if let Some(policy) = cli.no_detection {
            config.no_detection = policy;
        }
        if let Some(filter) = cli.filter {
            config.resample_filter = filter;
        }
        if let Some(alpha) = cli.alpha {
            config.alpha_mode = alpha;
        }
        if let Some(conf) = cli.conf {
            config.detection.conf = conf;
        }
        if let Some(iou) = cli.iou {
            config.detection.iou = iou;
        }
        if let Some(max_det) = cli.max_det {
            config.detection.max_det = max_det;
        }
        if let Some(imgsz) = cli.imgsz {
            config.detection.imgsz = imgsz;
        }
        if let Some(retina) = cli.retina_masks {
            config.detection.retina_masks = retina;
        }
        if let Some(point) = &cli.point {
            config.prompt.point = Some(parse_point(point)?);
        }

        let store = StoreSpec::parse(&cli.store)?;
        if let Some(bucket) = &cli.bucket {
            config.storage.bucket = Some(bucket.clone());
        } else if store.is_local() && config.storage.bucket.is_none() {
            config.storage.bucket = Some(LOCAL_BUCKET.to_string());
        }
        if let Some(prefix) = &cli.prefix {
            config.storage.prefix = prefix.clone();
        }
        if let Some(base) = &cli.public_base_url {
            config.storage.public_base_url = Some(base.clone());
        }
        if let Some(mode) = cli.return_mode {
            config.storage.return_mode = mode;
        }
        if let Some(expires) = cli.presign_expires {
            config.storage.presign_expires = expires;
        }
        config.debug = cli.verbose >= 2;

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}
