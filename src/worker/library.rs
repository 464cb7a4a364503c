//! In-process worker backed by a dynamically loaded library.
//!
//! Starting loads the artifact and validates its entry point against
//! [`crate::contract`]. The loaded entry is shared behind an `Arc`: a swap only
//! replaces the route target, and the old library stays mapped until the last
//! request that picked it up has finished.
use super::{Backend, RouteTarget, Worker};
use crate::contract::{self, ABI_VERSION, ENTRYPOINT_SYMBOL, Entrypoint, PluginRequest, PluginResponse};
use crate::errors::WorkerError;
use crate::signal::ControlHandle;
use async_trait::async_trait;
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Loads artifacts as shared libraries.
#[derive(Debug, Clone, Default)]
pub struct LibraryBackend;

#[async_trait]
impl Backend for LibraryBackend {
    fn name(&self) -> &'static str {
        "library"
    }

    fn exclusive(&self) -> bool {
        false
    }

    fn needs_executable(&self) -> bool {
        false
    }

    fn build(&self, artifact: &Path, generation: u64, _control: ControlHandle) -> Box<dyn Worker> {
        Box::new(LibraryWorker {
            artifact: artifact.to_path_buf(),
            generation,
            current: None,
        })
    }
}

/// A validated entry point and the library keeping it mapped.
pub struct LoadedEntry {
    path: PathBuf,
    entry: Entrypoint,
    // Declared last so it is dropped after everything derived from it.
    _library: Option<Library>,
}

impl std::fmt::Debug for LoadedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedEntry")
            .field("path", &self.path)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

impl LoadedEntry {
    /// Loads `path` and resolves the entry point. Blocking.
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let library = unsafe { Library::new(path) }.map_err(|e| WorkerError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let contract_error = |reason: String| WorkerError::Contract {
            path: path.to_path_buf(),
            reason,
        };
        let symbol_name = String::from_utf8_lossy(&ENTRYPOINT_SYMBOL[..ENTRYPOINT_SYMBOL.len() - 1]);

        let entry = {
            let symbol: Symbol<*const Entrypoint> = unsafe { library.get(ENTRYPOINT_SYMBOL) }
                .map_err(|e| contract_error(format!("missing symbol {symbol_name}: {e}")))?;
            let ptr: *const Entrypoint = *symbol;
            if ptr.is_null() {
                return Err(contract_error(format!("symbol {symbol_name} is null")));
            }
            // `abi_version` is the first field in every version of the layout.
            let version = unsafe { std::ptr::read(ptr as *const u32) };
            if version != ABI_VERSION {
                return Err(contract_error(format!(
                    "abi version {version}, expected {ABI_VERSION}"
                )));
            }
            unsafe { *ptr }
        };

        Ok(Self {
            path: path.to_path_buf(),
            entry,
            _library: Some(library),
        })
    }

    /// Wraps an entry point linked into the host binary.
    pub fn from_static(path: impl Into<PathBuf>, entry: Entrypoint) -> Self {
        Self {
            path: path.into(),
            entry,
            _library: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Calls the entry point. Blocking for as long as the handler runs.
    pub fn call(&self, req: &PluginRequest<'_>) -> PluginResponse {
        // The entry was validated at load and `self` keeps its library mapped.
        unsafe { contract::invoke(&self.entry, req) }
    }
}

/// One loaded artifact.
#[derive(Debug)]
pub struct LibraryWorker {
    artifact: PathBuf,
    generation: u64,
    current: Option<Arc<LoadedEntry>>,
}

#[async_trait]
impl Worker for LibraryWorker {
    async fn start(&mut self) -> Result<RouteTarget, WorkerError> {
        if self.current.is_none() {
            let path = self.artifact.clone();
            let loaded = tokio::task::spawn_blocking(move || LoadedEntry::load(&path))
                .await
                .map_err(|e| WorkerError::Load {
                    path: self.artifact.clone(),
                    reason: format!("loader task failed: {e}"),
                })??;
            info!(
                generation = self.generation,
                artifact = %self.artifact.display(),
                "Loaded library entry point"
            );
            self.current = Some(Arc::new(loaded));
        }
        Ok(self.route_target())
    }

    async fn stop(&mut self, _graceful: bool) -> Result<(), WorkerError> {
        // Requests already holding the entry keep it alive until they finish.
        self.current = None;
        Ok(())
    }

    fn route_target(&self) -> RouteTarget {
        match &self.current {
            Some(entry) => RouteTarget::Library {
                entry: Arc::clone(entry),
                generation: self.generation,
            },
            None => RouteTarget::Unavailable,
        }
    }
}
