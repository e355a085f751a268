//! Inference backend abstraction and factory

use crate::config::{BackendType, ExecutionProvider, PipelineConfig};
use crate::error::{CutoutError, Result};
use ndarray::ArrayD;
use std::path::{Path, PathBuf};

// Use instant crate for cross-platform time compatibility
use instant::Duration;

/// Session settings shared by every backend
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackendSettings {
    pub execution_provider: ExecutionProvider,
    /// Intra-op threads (0 = auto)
    pub intra_threads: usize,
    /// Inter-op threads (0 = auto)
    pub inter_threads: usize,
    /// Fixed input shapes, when the caller knows them up front
    ///
    /// Backends that compile a plan ahead of time (Tract) use these to
    /// concretize symbolic dimensions.
    pub input_shapes: Option<Vec<Vec<usize>>>,
}

impl BackendSettings {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            execution_provider: config.execution_provider,
            intra_threads: config.intra_threads,
            inter_threads: config.inter_threads,
            input_shapes: None,
        }
    }

    #[must_use]
    pub fn with_input_shapes(mut self, shapes: Vec<Vec<usize>>) -> Self {
        self.input_shapes = Some(shapes);
        self
    }
}

/// One loaded ONNX graph
///
/// Inputs and outputs are positional and follow the graph's declared order;
/// [`input_names`](InferenceBackend::input_names) and
/// [`output_names`](InferenceBackend::output_names) let callers match tensors
/// by name when a graph family varies its ordering.
pub trait InferenceBackend: Send {
    /// Load the model; a no-op returning `None` once initialized
    ///
    /// # Errors
    /// - Model file unreadable or not a valid ONNX graph
    /// - Execution provider setup failures
    fn initialize(&mut self) -> Result<Option<Duration>>;

    /// Run the graph on `inputs`, returning every output as `f32`
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Input count or shape rejected by the graph
    /// - Output tensors that are not `f32`
    fn run(&mut self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>>;

    /// Declared input names, empty before initialization
    fn input_names(&self) -> &[String];

    /// Declared output names, empty before initialization
    fn output_names(&self) -> &[String];

    fn is_initialized(&self) -> bool;

    /// Short engine name for logs
    fn name(&self) -> &'static str;
}

/// Position of a named tensor, falling back to `fallback` when names are unknown
#[must_use]
pub fn position_of(names: &[String], candidates: &[&str], fallback: usize) -> usize {
    names
        .iter()
        .position(|name| candidates.iter().any(|c| name == c))
        .unwrap_or(fallback)
}

/// Factory trait for creating inference backends
///
/// Segmenters receive a factory instead of constructing engines themselves,
/// so tests can substitute scripted backends.
pub trait BackendFactory: Send + Sync {
    /// Create a backend instance of the specified type for `model_path`
    ///
    /// # Errors
    /// - Backend type not compiled in
    fn create_backend(
        &self,
        backend_type: BackendType,
        model_path: &Path,
        settings: &BackendSettings,
    ) -> Result<Box<dyn InferenceBackend>>;

    /// List available backend types
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Factory for the engines compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(
        &self,
        backend_type: BackendType,
        model_path: &Path,
        settings: &BackendSettings,
    ) -> Result<Box<dyn InferenceBackend>> {
        let model_path: PathBuf = model_path.to_path_buf();
        match backend_type {
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::new(
                model_path,
                settings.clone(),
            ))),
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::new(
                model_path,
                settings.clone(),
            ))),
            #[allow(unreachable_patterns)]
            other => {
                let _ = (model_path, settings);
                Err(CutoutError::invalid_config(format!(
                    "{other:?} backend is not compiled into this build"
                )))
            },
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        backends
    }
}
