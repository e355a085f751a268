//! A lazily loaded inference backend shared by one segmenter

use super::lazy::LazyModel;
use crate::config::BackendType;
use crate::error::{CutoutError, Result};
use crate::inference::{position_of, BackendFactory, BackendSettings, InferenceBackend};
use crate::models::{ModelManager, ModelSource};
use instant::Duration;
use log::info;
use ndarray::ArrayD;
use std::sync::{Arc, Mutex};

/// Initialized backend plus the names it declared
pub struct Engine {
    backend: Mutex<Box<dyn InferenceBackend>>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    engine_name: &'static str,
    load_time: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("engine", &self.engine_name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    #[must_use]
    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    #[must_use]
    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    /// Run the graph; blocks, call from a blocking task
    ///
    /// # Errors
    /// - Backend failures
    pub fn run(&self, inputs: Vec<ArrayD<f32>>) -> Result<Outputs> {
        let mut backend = self
            .backend
            .lock()
            .map_err(|_| CutoutError::internal("Inference session lock poisoned"))?;
        let tensors = backend.run(inputs)?;
        Ok(Outputs {
            names: self.outputs.clone(),
            tensors,
        })
    }
}

/// Output tensors of one run, addressable by name
#[derive(Debug, Clone)]
pub struct Outputs {
    names: Vec<String>,
    tensors: Vec<ArrayD<f32>>,
}

impl Outputs {
    /// Output matching one of `candidates`, else the one at `fallback`
    ///
    /// # Errors
    /// - No tensor at the resolved position
    pub fn get(&self, candidates: &[&str], fallback: usize) -> Result<&ArrayD<f32>> {
        let index = position_of(&self.names, candidates, fallback);
        self.tensors.get(index).ok_or_else(|| {
            CutoutError::inference(format!(
                "Model produced {} outputs, expected one of {candidates:?}",
                self.tensors.len()
            ))
        })
    }

    /// First output of the given rank
    #[must_use]
    pub fn by_rank(&self, rank: usize) -> Option<&ArrayD<f32>> {
        self.tensors.iter().find(|t| t.ndim() == rank)
    }

    #[must_use]
    pub fn tensors(&self) -> &[ArrayD<f32>] {
        &self.tensors
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, Vec<ArrayD<f32>>) {
        (self.names, self.tensors)
    }
}

/// Everything needed to load one graph on first use
pub struct EngineSlot {
    role: &'static str,
    source: ModelSource,
    backend_type: BackendType,
    settings: BackendSettings,
    factory: Arc<dyn BackendFactory>,
    models: ModelManager,
    engine: LazyModel<Engine>,
}

impl std::fmt::Debug for EngineSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSlot")
            .field("role", &self.role)
            .field("source", &self.source)
            .field("backend_type", &self.backend_type)
            .field("loaded", &self.engine.is_loaded())
            .finish_non_exhaustive()
    }
}

impl EngineSlot {
    pub fn new(
        role: &'static str,
        source: ModelSource,
        backend_type: BackendType,
        settings: BackendSettings,
        factory: Arc<dyn BackendFactory>,
        models: ModelManager,
    ) -> Self {
        Self {
            role,
            source,
            backend_type,
            settings,
            factory,
            models,
            engine: LazyModel::new(),
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.engine.is_loaded()
    }

    /// Load the graph if needed; blocks
    ///
    /// # Errors
    /// - Model file missing
    /// - Backend creation or initialization failures
    pub fn engine(&self) -> Result<Arc<Engine>> {
        self.engine.get_or_try_init(|| {
            let path = self.models.resolve(&self.source)?;
            let mut backend =
                self.factory
                    .create_backend(self.backend_type, &path, &self.settings)?;
            let load_time = backend.initialize()?.unwrap_or_default();
            info!(
                "Loaded {} model {} with {} in {:.0}ms",
                self.role,
                self.source.display_name(),
                backend.name(),
                load_time.as_secs_f64() * 1000.0
            );
            Ok(Engine {
                inputs: backend.input_names().to_vec(),
                outputs: backend.output_names().to_vec(),
                engine_name: backend.name(),
                backend: Mutex::new(backend),
                load_time,
            })
        })
    }

    /// Load on a blocking thread; `Some(load time)` when this call did the loading
    ///
    /// # Errors
    /// - Load failures
    pub async fn warm_up(self: &Arc<Self>) -> Result<Option<Duration>> {
        let was_loaded = self.is_loaded();
        self.with_engine(|_| Ok(())).await?;
        if was_loaded {
            return Ok(None);
        }
        Ok(self.engine.get().map(|e| e.load_time()))
    }

    /// Run `f` against the loaded engine on a blocking thread
    ///
    /// Remote sources are downloaded into the model cache before the first load.
    ///
    /// # Errors
    /// - Download or load failures, errors from `f`, or a panicked task
    pub async fn with_engine<F, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(&Engine) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_loaded() {
            self.models.fetch(&self.source, false).await?;
        }
        let slot = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let engine = slot.engine()?;
            f(&engine)
        })
        .await
        .map_err(|e| CutoutError::internal(format!("Inference task failed: {e}")))?
    }

    /// Run the graph once on a blocking thread
    ///
    /// # Errors
    /// - Load or backend failures
    pub async fn run(self: &Arc<Self>, inputs: Vec<ArrayD<f32>>) -> Result<Outputs> {
        self.with_engine(move |engine| engine.run(inputs)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{model_dir_with, ScriptedBackend, ScriptedFactory};
    use crate::models::ModelCache;
    use ndarray::{ArrayD, IxDyn};

    fn slot(factory: Arc<ScriptedFactory>, dir: &std::path::Path) -> Arc<EngineSlot> {
        Arc::new(EngineSlot::new(
            "test",
            ModelSource::Named("m.onnx".into()),
            BackendType::default(),
            BackendSettings::default(),
            factory,
            ModelManager::new(dir),
        ))
    }

    #[tokio::test]
    async fn test_run_loads_once_and_names_outputs() {
        let dir = model_dir_with(&["m.onnx"]);
        let backend = ScriptedBackend::new(&["images"], &["scores", "masks"], |inputs| {
            let sum: f32 = inputs[0].iter().sum();
            Ok(vec![
                ArrayD::from_elem(IxDyn(&[1]), sum),
                ArrayD::zeros(IxDyn(&[1, 1, 2, 2])),
            ])
        });
        let factory = Arc::new(ScriptedFactory::new().with("m.onnx", backend.clone()));
        let slot = slot(Arc::clone(&factory), dir.path());

        let input = ArrayD::from_elem(IxDyn(&[1, 3]), 2.0);
        let first = slot.run(vec![input.clone()]).await.unwrap();
        let second = slot.run(vec![input]).await.unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(backend.run_count(), 2);
        assert_eq!(first.get(&["scores"], 9).unwrap()[[0]], 6.0);
        assert_eq!(second.get(&["masks"], 9).unwrap().ndim(), 4);
        assert_eq!(second.by_rank(4).unwrap().shape(), &[1, 1, 2, 2]);
    }

    #[tokio::test]
    async fn test_warm_up_reports_only_first_load() {
        let dir = model_dir_with(&["m.onnx"]);
        let factory = Arc::new(
            ScriptedFactory::new().with("m.onnx", ScriptedBackend::fixed(&["x"], &["y"], vec![])),
        );
        let slot = slot(factory, dir.path());

        assert!(slot.warm_up().await.unwrap().is_some());
        assert!(slot.warm_up().await.unwrap().is_none());
        assert!(slot.is_loaded());
    }

    #[tokio::test]
    async fn test_missing_model_file_is_model_error() {
        let dir = model_dir_with(&[]);
        let factory = Arc::new(ScriptedFactory::new());
        let slot = slot(factory, dir.path());

        let result = slot.run(vec![]).await;
        assert!(matches!(result, Err(CutoutError::Model(_))));
        assert!(!slot.is_loaded());
    }

    #[tokio::test]
    async fn test_failed_init_can_retry() {
        let dir = model_dir_with(&["m.onnx"]);
        let factory = Arc::new(ScriptedFactory::new().with(
            "m.onnx",
            ScriptedBackend::fixed(&["x"], &["y"], vec![]).failing_init(),
        ));
        let slot = slot(Arc::clone(&factory), dir.path());

        assert!(slot.warm_up().await.is_err());
        assert!(slot.warm_up().await.is_err());
        assert_eq!(factory.created(), 2);
    }

    async fn serve_model(body: &'static [u8]) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_remote_model_is_downloaded_on_warm_up() {
        let addr = serve_model(b"onnx-bytes").await;
        let url = format!("http://{addr}/weights/remote.onnx");
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::with_custom_cache_dir(&dir.path().join("cache")).unwrap();

        let factory = Arc::new(ScriptedFactory::new().with(
            &ModelCache::url_to_file_name(&url),
            ScriptedBackend::fixed(&["x"], &["y"], vec![]),
        ));
        let slot = Arc::new(EngineSlot::new(
            "test",
            ModelSource::Remote(url.clone()),
            BackendType::default(),
            BackendSettings::default(),
            factory,
            ModelManager::new(dir.path()).with_cache_dir(cache.cache_dir()),
        ));

        assert!(slot.warm_up().await.unwrap().is_some());
        assert_eq!(std::fs::read(cache.cached_path(&url)).unwrap(), b"onnx-bytes");
    }

    #[tokio::test]
    async fn test_unreachable_remote_model_is_model_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let dir = tempfile::tempdir().unwrap();

        let slot = Arc::new(EngineSlot::new(
            "test",
            ModelSource::Remote(format!("http://{addr}/m.onnx")),
            BackendType::default(),
            BackendSettings::default(),
            Arc::new(ScriptedFactory::new()),
            ModelManager::new(dir.path()).with_cache_dir(dir.path().join("cache")),
        ));

        let result = slot.warm_up().await;
        assert!(matches!(result, Err(CutoutError::Model(_))), "{result:?}");
        assert!(!slot.is_loaded());
    }
}
