//! ONNX Runtime backend
//!
//! Runs segmentation graphs through ONNX Runtime with support for multiple
//! execution providers (CPU, CUDA, `CoreML`).

use crate::config::ExecutionProvider;
use crate::error::{CutoutError, Result};
use crate::inference::{BackendSettings, InferenceBackend};
use ndarray::ArrayD;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionInputValue};
use ort::value::Tensor;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// ONNX Runtime backend for one model file
#[derive(Debug)]
pub struct OnnxBackend {
    model_path: PathBuf,
    settings: BackendSettings,
    session: Option<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxBackend {
    #[must_use]
    pub fn new(model_path: PathBuf, settings: BackendSettings) -> Self {
        Self {
            model_path,
            settings,
            session: None,
            input_names: Vec::new(),
            output_names: Vec::new(),
        }
    }

    /// List all ONNX Runtime execution providers with availability status
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool)> {
        vec![
            ("CPU".to_string(), true),
            (
                "CUDA".to_string(),
                OrtExecutionProvider::is_available(&CUDAExecutionProvider::default())
                    .unwrap_or(false),
            ),
            (
                "CoreML".to_string(),
                OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                    .unwrap_or(false),
            ),
        ]
    }

    /// Execution providers to register, in priority order
    fn execution_providers(provider: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
        let cuda = || {
            let cuda_provider = CUDAExecutionProvider::default();
            if OrtExecutionProvider::is_available(&cuda_provider).unwrap_or(false) {
                Some(cuda_provider.build())
            } else {
                None
            }
        };
        let coreml = || {
            let coreml_provider = CoreMLExecutionProvider::default();
            if OrtExecutionProvider::is_available(&coreml_provider).unwrap_or(false) {
                Some(CoreMLExecutionProvider::default().with_subgraphs(true).build())
            } else {
                None
            }
        };

        match provider {
            ExecutionProvider::Auto => {
                let providers: Vec<_> = [cuda(), coreml()].into_iter().flatten().collect();
                if providers.is_empty() {
                    log::warn!("No hardware acceleration available, falling back to CPU");
                } else {
                    log::info!(
                        "Hardware acceleration enabled with {count} provider(s)",
                        count = providers.len()
                    );
                }
                providers
            },
            ExecutionProvider::Cpu => {
                log::info!("Using CPU execution provider");
                Vec::new()
            },
            ExecutionProvider::Cuda => cuda().map_or_else(
                || {
                    log::warn!(
                        "CUDA execution provider requested but not available, falling back to CPU"
                    );
                    Vec::new()
                },
                |p| vec![p],
            ),
            ExecutionProvider::CoreMl => coreml().map_or_else(
                || {
                    log::warn!(
                        "CoreML execution provider requested but not available, falling back to CPU"
                    );
                    Vec::new()
                },
                |p| vec![p],
            ),
        }
    }

    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();

        let model_data = std::fs::read(&self.model_path)
            .map_err(|e| CutoutError::file_io_error("read model", &self.model_path, &e))?;

        let mut session_builder = Session::builder()
            .map_err(|e| CutoutError::model(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| CutoutError::model(format!("Failed to set optimization level: {e}")))?;

        let providers = Self::execution_providers(self.settings.execution_provider);
        if !providers.is_empty() {
            session_builder = session_builder
                .with_execution_providers(providers)
                .map_err(|e| {
                    CutoutError::model(format!("Failed to set execution providers: {e}"))
                })?;
        }

        let cores = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(8);
        let intra_threads = if self.settings.intra_threads > 0 {
            self.settings.intra_threads
        } else {
            cores
        };
        let inter_threads = if self.settings.inter_threads > 0 {
            self.settings.inter_threads
        } else {
            (cores / 4).max(1)
        };

        let session = session_builder
            .with_parallel_execution(true)
            .map_err(|e| CutoutError::model(format!("Failed to enable parallel execution: {e}")))?
            .with_intra_threads(intra_threads)
            .map_err(|e| CutoutError::model(format!("Failed to set intra threads: {e}")))?
            .with_inter_threads(inter_threads)
            .map_err(|e| CutoutError::model(format!("Failed to set inter threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                CutoutError::model(format!(
                    "Failed to create session from '{}': {e}",
                    self.model_path.display()
                ))
            })?;

        self.input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        self.output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        log::debug!("ONNX Runtime session created for {}", self.model_path.display());
        log::debug!("  - Requested provider: {}", self.settings.execution_provider);
        log::debug!("  - Threading: {intra_threads} intra-op, {inter_threads} inter-op");
        log::debug!("  - Inputs: {:?}", self.input_names);
        log::debug!("  - Outputs: {:?}", self.output_names);
        let size_mb = model_data.len() as f64 / (1024.0 * 1024.0);
        log::debug!("  - Model size: {size_mb:.2} MB");

        self.session = Some(session);

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Model loading complete: {:.0}ms",
            model_load_time.as_secs_f64() * 1000.0
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self) -> Result<Option<instant::Duration>> {
        if self.session.is_some() {
            return Ok(None);
        }
        self.load_model().map(Some)
    }

    fn run(&mut self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CutoutError::internal("ONNX session not initialized"))?;

        if inputs.len() != self.input_names.len() {
            return Err(CutoutError::inference(format!(
                "Graph expects {} inputs, got {}",
                self.input_names.len(),
                inputs.len()
            )));
        }

        let inference_start = Instant::now();
        let mut named_inputs: Vec<(String, SessionInputValue<'_>)> =
            Vec::with_capacity(inputs.len());
        for (name, array) in self.input_names.iter().zip(inputs) {
            log::trace!("  - input {name}: {:?}", array.shape());
            let tensor = Tensor::from_array(array).map_err(|e| {
                CutoutError::inference(format!("Failed to convert input tensor '{name}': {e}"))
            })?;
            named_inputs.push((name.clone(), tensor.into()));
        }

        let outputs = session
            .run(named_inputs)
            .map_err(|e| CutoutError::inference(format!("ONNX inference failed: {e}")))?;

        let mut results = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                CutoutError::inference(format!("Output tensor '{name}' not found"))
            })?;
            let array = value.try_extract_array::<f32>().map_err(|e| {
                CutoutError::inference(format!("Failed to extract output tensor '{name}': {e}"))
            })?;
            results.push(array.to_owned());
        }

        log::debug!(
            "ONNX inference complete: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(results)
    }

    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_starts_uninitialized() {
        let backend = OnnxBackend::new(PathBuf::from("missing.onnx"), BackendSettings::default());
        assert!(!backend.is_initialized());
        assert!(backend.input_names().is_empty());
        assert_eq!(backend.name(), "onnx");
    }

    #[test]
    fn test_run_before_initialize_fails() {
        let mut backend =
            OnnxBackend::new(PathBuf::from("missing.onnx"), BackendSettings::default());
        let input = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 3, 4, 4]));
        assert!(backend.run(vec![input]).is_err());
    }

    #[test]
    fn test_missing_model_file_is_reported() {
        let mut backend = OnnxBackend::new(
            PathBuf::from("/nonexistent/model.onnx"),
            BackendSettings::default(),
        );
        let err = backend.initialize().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/model.onnx"));
    }

    #[test]
    fn test_list_providers_always_has_cpu() {
        let providers = OnnxBackend::list_providers();
        assert!(providers.iter().any(|(name, available)| name == "CPU" && *available));
    }
}
