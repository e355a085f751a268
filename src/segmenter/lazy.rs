//! Load-once model handles

use crate::error::{CutoutError, Result};
use std::sync::{Arc, Mutex, OnceLock};

/// Value created on first use and shared for the rest of the process
///
/// Concurrent first calls serialize on an init lock and only one of them runs
/// the initializer. A failed initialization leaves the cell empty, so the next
/// call tries again.
#[derive(Debug)]
pub struct LazyModel<T> {
    cell: OnceLock<Arc<T>>,
    init: Mutex<()>,
}

impl<T> Default for LazyModel<T> {
    fn default() -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(()),
        }
    }
}

impl<T> LazyModel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The loaded value, if any
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Return the loaded value, running `init` if nothing is loaded yet
    ///
    /// Blocks while another thread is initializing.
    ///
    /// # Errors
    /// - Whatever `init` returns; the cell stays empty
    pub fn get_or_try_init<F>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.cell.get() {
            return Ok(Arc::clone(value));
        }

        let _guard = self
            .init
            .lock()
            .map_err(|_| CutoutError::internal("Model init lock poisoned"))?;
        // Another caller may have finished while we waited
        if let Some(value) = self.cell.get() {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(init()?);
        let _ = self.cell.set(Arc::clone(&value));
        Ok(value)
    }
}
