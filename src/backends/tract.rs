//! Tract backend
//!
//! Pure Rust inference through Tract, with no native runtime to ship. Slower
//! than ONNX Runtime but portable to any target Rust compiles for.

use crate::error::{CutoutError, Result};
use crate::inference::{BackendSettings, InferenceBackend};
use ndarray::{ArrayD, IxDyn};
use std::path::PathBuf;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

// Use instant crate for cross-platform time compatibility
use instant::{Duration, Instant};

/// Tract backend for one model file
#[derive(Debug)]
pub struct TractBackend {
    model_path: PathBuf,
    settings: BackendSettings,
    model: Option<TractModel>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl TractBackend {
    #[must_use]
    pub fn new(model_path: PathBuf, settings: BackendSettings) -> Self {
        Self {
            model_path,
            settings,
            model: None,
            input_names: Vec::new(),
            output_names: Vec::new(),
        }
    }

    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();
        log::info!("Initializing Tract backend for {}", self.model_path.display());

        let mut inference_model = onnx()
            .model_for_path(&self.model_path)
            .map_err(|e| {
                CutoutError::model(format!(
                    "Failed to load ONNX model '{}': {e}",
                    self.model_path.display()
                ))
            })?;

        if let Some(shapes) = &self.settings.input_shapes {
            for (index, shape) in shapes.iter().enumerate() {
                inference_model = inference_model
                    .with_input_fact(index, f32::fact(shape.clone()).into())
                    .map_err(|e| {
                        CutoutError::model(format!("Failed to set input {index} shape: {e}"))
                    })?;
            }
        }

        let typed = if self.settings.input_shapes.is_some() {
            inference_model.into_optimized()
        } else {
            inference_model
                .into_typed()
                .and_then(tract_onnx::prelude::TypedModel::into_decluttered)
        }
        .map_err(|e| CutoutError::model(format!("Failed to optimize model: {e}")))?;

        let input_names = typed
            .input_outlets()
            .map_err(|e| CutoutError::model(format!("Failed to read model inputs: {e}")))?
            .iter()
            .map(|outlet| typed.node(outlet.node).name.clone())
            .collect();
        let output_names = typed
            .output_outlets()
            .map_err(|e| CutoutError::model(format!("Failed to read model outputs: {e}")))?
            .iter()
            .map(|outlet| {
                typed
                    .outlet_label(*outlet)
                    .map_or_else(|| typed.node(outlet.node).name.clone(), ToString::to_string)
            })
            .collect();

        let model = typed
            .into_runnable()
            .map_err(|e| CutoutError::model(format!("Failed to create runnable model: {e}")))?;

        self.input_names = input_names;
        self.output_names = output_names;
        self.model = Some(model);

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Tract backend initialized in {:.2}ms",
            model_load_time.as_secs_f64() * 1000.0
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self) -> Result<Option<Duration>> {
        if self.model.is_some() {
            return Ok(None);
        }
        self.load_model().map(Some)
    }

    fn run(&mut self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| CutoutError::inference("Tract model not initialized"))?;

        let inference_start = Instant::now();
        let mut tensors: TVec<TValue> = TVec::new();
        for array in inputs {
            let shape = array.shape().to_vec();
            let data: Vec<f32> = array.into_iter().collect();
            let tensor = Tensor::from_shape(&shape, &data).map_err(|e| {
                CutoutError::inference(format!("Failed to convert input tensor: {e}"))
            })?;
            tensors.push(tensor.into());
        }

        let outputs = model
            .run(tensors)
            .map_err(|e| CutoutError::inference(format!("Tract inference failed: {e}")))?;

        let mut results = Vec::with_capacity(outputs.len());
        for output in outputs {
            let tensor = output.into_tensor();
            let data = tensor.as_slice::<f32>().map_err(|e| {
                CutoutError::inference(format!("Failed to convert output tensor: {e}"))
            })?;
            let array = ArrayD::from_shape_vec(IxDyn(tensor.shape()), data.to_vec()).map_err(
                |e| CutoutError::inference(format!("Failed to reshape output tensor: {e}")),
            )?;
            results.push(array);
        }

        log::debug!(
            "Tract inference completed in {:.2}ms",
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
        self.model.is_some()
    }

    fn name(&self) -> &'static str {
        "tract"
    }
}

#[cfg(all(test, feature = "tract"))]
mod tests {
    use super::*;

    #[test]
    fn test_tract_backend_creation() {
        let backend = TractBackend::new(PathBuf::from("model.onnx"), BackendSettings::default());
        assert!(!backend.is_initialized());
        assert!(backend.output_names().is_empty());
    }

    #[test]
    fn test_run_before_initialize_fails() {
        let mut backend =
            TractBackend::new(PathBuf::from("model.onnx"), BackendSettings::default());
        let input = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 8, 8]));
        let err = backend.run(vec![input]).unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn test_missing_model_fails_to_initialize() {
        let mut backend = TractBackend::new(
            PathBuf::from("/nonexistent/model.onnx"),
            BackendSettings::default().with_input_shapes(vec![vec![1, 3, 320, 320]]),
        );
        assert!(backend.initialize().is_err());
        assert!(!backend.is_initialized());
    }
}
