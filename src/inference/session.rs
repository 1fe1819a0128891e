use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{read_manifest, ModelSpec};

use super::engine::{
    default_backend, default_cpu_config, Backend, BackendConfig, EngineFactory, EngineInit,
    VlmEngine,
};

const NPU_LIB_DIR_ENV: &str = "LIFELENS_NPU_LIB_DIR";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("required model file missing or empty: {0}")]
    MissingFile(PathBuf),
    #[error("engine init failed on {backend:?} after trying {attempted:?}: {cause}")]
    InitFailed {
        backend: Backend,
        attempted: Vec<Backend>,
        cause: anyhow::Error,
    },
    #[error("no active session")]
    NoActiveSession,
}

/// Snapshot of the live session handed to the frontend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub model_name: String,
    pub backend: Backend,
    pub entry_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmproj_path: Option<PathBuf>,
}

struct ActiveSession {
    info: SessionInfo,
    engine: Arc<dyn VlmEngine>,
}

/// Owns the single active inference session. Creating a new session always
/// destroys the previous one first; callers treat the brief no-session
/// window as a retryable precondition, not a failure.
pub struct SessionManager {
    factory: EngineFactory,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(factory: EngineFactory) -> Self {
        Self {
            factory,
            active: Mutex::new(None),
        }
    }

    /// Loads `spec` from `model_dir`. Backend precedence: the artifact
    /// manifest's declared backend wins over `requested`, which wins over
    /// the hardware default. Other backends are only tried when the caller
    /// passes an explicit ordered `fallback` list.
    pub fn create_session(
        &self,
        spec: &ModelSpec,
        model_dir: &Path,
        requested: Option<Backend>,
        fallback: &[Backend],
    ) -> Result<SessionInfo, SessionError> {
        let entry_path = model_dir.join(&spec.entry_file);
        require_nonempty(&entry_path)?;
        let mmproj_path = match &spec.mmproj_file {
            Some(file) => {
                let path = model_dir.join(file);
                require_nonempty(&path)?;
                Some(path)
            }
            None => None,
        };

        let manifest = spec
            .manifest_file()
            .and_then(|file| read_manifest(&model_dir.join(file)));
        let manifest_backend = manifest
            .as_ref()
            .and_then(|manifest| manifest.preferred_backend.as_deref())
            .and_then(Backend::parse);
        let model_name = manifest
            .as_ref()
            .and_then(|manifest| manifest.model_name.clone())
            .unwrap_or_else(|| spec.display_name.clone());

        let primary = manifest_backend
            .or(requested)
            .unwrap_or_else(default_backend);
        let mut candidates = vec![primary];
        for backend in fallback {
            if !candidates.contains(backend) {
                candidates.push(*backend);
            }
        }

        self.destroy_session();

        let mut last_error = None;
        for backend in &candidates {
            let init = EngineInit {
                model_name: model_name.clone(),
                entry_path: entry_path.clone(),
                mmproj_path: mmproj_path.clone(),
                config: backend_config(*backend, model_dir),
            };
            match (self.factory)(&init) {
                Ok(engine) => {
                    let info = SessionInfo {
                        model_name: model_name.clone(),
                        backend: *backend,
                        entry_path: entry_path.clone(),
                        mmproj_path: mmproj_path.clone(),
                    };
                    info!(model = %info.model_name, backend = backend.as_str(), "session ready");
                    let mut guard = self.active.lock();
                    *guard = Some(ActiveSession {
                        info: info.clone(),
                        engine,
                    });
                    return Ok(info);
                }
                Err(error) => {
                    warn!(
                        backend = backend.as_str(),
                        "engine init failed: {error:#}"
                    );
                    last_error = Some((*backend, error));
                }
            }
        }

        let (backend, cause) = last_error.expect("at least one backend candidate");
        Err(SessionError::InitFailed {
            backend,
            attempted: candidates,
            cause,
        })
    }

    /// Best-effort stop and release; never fails, since it runs from cleanup
    /// paths including app exit.
    pub fn destroy_session(&self) {
        let previous = self.active.lock().take();
        if let Some(session) = previous {
            info!(model = %session.info.model_name, "destroying session");
            session.engine.stop();
            session.engine.shutdown();
        }
    }

    pub fn engine(&self) -> Result<Arc<dyn VlmEngine>, SessionError> {
        self.active
            .lock()
            .as_ref()
            .map(|session| session.engine.clone())
            .ok_or(SessionError::NoActiveSession)
    }

    pub fn active_info(&self) -> Option<SessionInfo> {
        self.active.lock().as_ref().map(|session| session.info.clone())
    }

    /// Interrupts any in-flight native generation without tearing the
    /// session down. No-op when no session is active.
    pub fn stop_generation(&self) {
        if let Some(session) = self.active.lock().as_ref() {
            session.engine.stop();
        }
    }
}

fn require_nonempty(path: &Path) -> Result<(), SessionError> {
    let valid = std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(SessionError::MissingFile(path.to_path_buf()))
    }
}

fn backend_config(backend: Backend, model_dir: &Path) -> BackendConfig {
    match backend {
        Backend::Npu => {
            let lib_dir = std::env::var_os(NPU_LIB_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| model_dir.to_path_buf());
            BackendConfig::Npu {
                lib_dir,
                model_dir: model_dir.to_path_buf(),
            }
        }
        Backend::CpuGpu => default_cpu_config(),
    }
}
