//! Scripted backends for exercising segmenters without model files
//!
//! A [`ScriptedBackend`] declares input/output names like a real graph and
//! answers every `run` with a closure over the supplied tensors.
//! [`ScriptedFactory`] hands out scripted backends by model file name.

use crate::{
    config::BackendType,
    error::{CutoutError, Result},
    inference::{BackendFactory, BackendSettings, InferenceBackend},
};
use instant::Duration;
use ndarray::ArrayD;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Response function of a scripted graph
pub type Responder = Arc<dyn Fn(&[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>> + Send + Sync>;

/// Backend answering from a closure
#[derive(Clone)]
pub struct ScriptedBackend {
    inputs: Vec<String>,
    outputs: Vec<String>,
    responder: Responder,
    initialized: bool,
    fail_init: bool,
    runs: Arc<AtomicUsize>,
    input_shapes: Arc<Mutex<Vec<Vec<Vec<usize>>>>>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    pub fn new<F>(inputs: &[&str], outputs: &[&str], responder: F) -> Self
    where
        F: Fn(&[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>> + Send + Sync + 'static,
    {
        Self {
            inputs: inputs.iter().map(ToString::to_string).collect(),
            outputs: outputs.iter().map(ToString::to_string).collect(),
            responder: Arc::new(responder),
            initialized: false,
            fail_init: false,
            runs: Arc::new(AtomicUsize::new(0)),
            input_shapes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Backend that always returns the same tensors
    pub fn fixed(inputs: &[&str], outputs: &[&str], tensors: Vec<ArrayD<f32>>) -> Self {
        Self::new(inputs, outputs, move |_| Ok(tensors.clone()))
    }

    /// Backend whose `initialize` fails
    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Number of `run` calls across every clone
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Input shapes of every `run` call, in order
    pub fn recorded_shapes(&self) -> Vec<Vec<Vec<usize>>> {
        self.input_shapes
            .lock()
            .map(|shapes| shapes.clone())
            .unwrap_or_default()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn initialize(&mut self) -> Result<Option<Duration>> {
        if self.fail_init {
            return Err(CutoutError::model("scripted initialization failure"));
        }
        if self.initialized {
            return Ok(None);
        }
        self.initialized = true;
        Ok(Some(Duration::from_millis(1)))
    }

    fn run(&mut self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
        if !self.initialized {
            return Err(CutoutError::inference("Backend not initialized"));
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut shapes) = self.input_shapes.lock() {
            shapes.push(inputs.iter().map(|t| t.shape().to_vec()).collect());
        }
        (self.responder)(&inputs)
    }

    fn input_names(&self) -> &[String] {
        if self.initialized {
            &self.inputs
        } else {
            &[]
        }
    }

    fn output_names(&self) -> &[String] {
        if self.initialized {
            &self.outputs
        } else {
            &[]
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Factory returning scripted backends keyed by model file name
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    backends: HashMap<String, ScriptedBackend>,
    created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `backend` for any model whose file name is `file_name`
    #[must_use]
    pub fn with(mut self, file_name: &str, backend: ScriptedBackend) -> Self {
        self.backends.insert(file_name.to_string(), backend);
        self
    }

    /// Number of backends created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl BackendFactory for ScriptedFactory {
    fn create_backend(
        &self,
        _backend_type: BackendType,
        model_path: &Path,
        _settings: &BackendSettings,
    ) -> Result<Box<dyn InferenceBackend>> {
        let file_name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let backend = self.backends.get(&file_name).cloned().ok_or_else(|| {
            CutoutError::model(format!("No scripted backend for '{file_name}'"))
        })?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(backend))
    }

    fn available_backends(&self) -> Vec<BackendType> {
        vec![BackendType::default()]
    }
}

/// Model directory containing empty placeholder files, so path resolution succeeds
pub fn model_dir_with(files: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::TempDir::new().unwrap();
    for file in files {
        std::fs::write(dir.path().join(file), b"").unwrap();
    }
    dir
}
