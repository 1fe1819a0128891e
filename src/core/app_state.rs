use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tauri::{AppHandle, Manager};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::events::{self, EngineStatusPayload};
use crate::core::logs;
use crate::core::settings::SettingsManager;
use crate::inference::{
    Backend, EngineFactory, QueryPipeline, RequestState, SessionInfo, SessionManager,
    SimulatedEngine, TokenStreamEvent, VlmEngine,
};
use crate::models::{
    find_spec, DownloadJob, DownloadService, ModelState, ModelStatus, ModelStatusPayload,
    StoragePaths,
};

pub struct AppState {
    settings: Arc<SettingsManager>,
    paths: Mutex<StoragePaths>,
    downloads: Mutex<Option<DownloadService>>,
    sessions: Arc<SessionManager>,
    queries: Arc<QueryPipeline>,
}

impl AppState {
    pub fn new() -> Result<Self> {
        let factory: EngineFactory =
            Arc::new(|init| Ok(Arc::new(SimulatedEngine::new(init)) as Arc<dyn VlmEngine>));
        Self::with_factory(factory)
    }

    pub fn with_factory(factory: EngineFactory) -> Result<Self> {
        let sessions = Arc::new(SessionManager::new(factory));
        Ok(Self {
            settings: Arc::new(SettingsManager::new()?),
            paths: Mutex::new(StoragePaths::resolve_default()?),
            downloads: Mutex::new(None),
            sessions: sessions.clone(),
            queries: Arc::new(QueryPipeline::new(sessions)),
        })
    }

    pub fn settings_manager(&self) -> Arc<SettingsManager> {
        self.settings.clone()
    }

    /// One-time startup wiring: bundled artifacts under the app resource
    /// directory become a resolve source, and the download worker starts.
    pub fn initialize(&self, app: &AppHandle) -> Result<()> {
        if let Ok(resource_dir) = app.path().resource_dir() {
            self.paths.lock().set_bundled_root(resource_dir);
        }
        self.ensure_download_service(app)?;
        logs::push_log("Model services initialized");
        Ok(())
    }

    pub fn list_models(&self, app: &AppHandle) -> Result<Vec<ModelState>> {
        self.ensure_download_service(app)?;
        let service = self.download_service()?;
        Ok(crate::models::default_specs()
            .iter()
            .map(|spec| service.state_of(spec))
            .collect())
    }

    pub fn model_state(&self, app: &AppHandle, model_id: &str) -> Result<ModelState> {
        let spec = find_spec(model_id).ok_or_else(|| anyhow!("unknown model: {model_id}"))?;
        self.ensure_download_service(app)?;
        Ok(self.download_service()?.state_of(&spec))
    }

    pub fn install_model(&self, app: &AppHandle, model_id: &str) -> Result<()> {
        let spec = find_spec(model_id).ok_or_else(|| anyhow!("unknown model: {model_id}"))?;
        self.ensure_download_service(app)?;
        self.download_service()?.queue(DownloadJob { spec })
    }

    pub fn uninstall_model(&self, app: &AppHandle, model_id: &str) -> Result<()> {
        let spec = find_spec(model_id).ok_or_else(|| anyhow!("unknown model: {model_id}"))?;

        // A model backing the live session cannot be removed out from
        // under the engine.
        if let Some(info) = self.sessions.active_info() {
            let model_dir = self.paths.lock().model_dir(&spec.id);
            if info.entry_path.starts_with(&model_dir) {
                self.release_engine(app);
            }
        }

        let model_dir = self.paths.lock().model_dir(&spec.id);
        if model_dir.exists() {
            std::fs::remove_dir_all(&model_dir)
                .with_context(|| format!("remove {model_dir:?}"))?;
        }
        if let Some(service) = self.downloads.lock().as_ref() {
            service.forget(&spec.id);
        }
        info!(model = %spec.id, "model uninstalled");
        logs::push_log(format!("Uninstalled model {}", spec.id));
        events::emit_model_status(
            app,
            ModelStatusPayload {
                model_id: spec.id.clone(),
                status: ModelStatus::NotInstalled,
            },
        );
        Ok(())
    }

    /// Loads the configured (or requested) model into a fresh session,
    /// replacing any previous one. Alternate backends are only attempted
    /// when the caller pinned a backend explicitly.
    pub fn init_engine(
        &self,
        app: &AppHandle,
        model_id: Option<&str>,
        backend: Option<&str>,
    ) -> Result<SessionInfo> {
        // An answer still streaming against the old engine must end
        // Cancelled, not watch its session vanish mid-generation.
        self.queries.cancel_active();

        let settings = self.settings.read();
        let model_id = model_id.unwrap_or(&settings.model_id);
        let spec = find_spec(model_id).ok_or_else(|| anyhow!("unknown model: {model_id}"))?;
        let model_dir = self.paths.lock().model_dir(&spec.id);

        let requested = match backend {
            Some(value) => Some(
                Backend::parse(value).ok_or_else(|| anyhow!("unknown backend: {value}"))?,
            ),
            None => Backend::parse(&settings.preferred_backend),
        };
        let fallback: Vec<Backend> = match requested {
            Some(Backend::Npu) => vec![Backend::CpuGpu],
            Some(Backend::CpuGpu) => vec![Backend::Npu],
            None => Vec::new(),
        };

        emit_engine_state(app, "loading", None, None, None);
        match self
            .sessions
            .create_session(&spec, &model_dir, requested, &fallback)
        {
            Ok(info) => {
                logs::push_log(format!(
                    "Engine ready: {} on {}",
                    info.model_name,
                    info.backend.as_str()
                ));
                emit_engine_state(
                    app,
                    "ready",
                    Some(info.model_name.clone()),
                    Some(info.backend),
                    None,
                );
                Ok(info)
            }
            Err(error) => {
                warn!("engine init failed: {error:#}");
                logs::push_log(format!("Engine init failed: {error}"));
                emit_engine_state(app, "error", None, None, Some(error.to_string()));
                Err(error.into())
            }
        }
    }

    pub fn release_engine(&self, app: &AppHandle) {
        self.queries.cancel_active();
        self.sessions.destroy_session();
        emit_engine_state(app, "released", None, None, None);
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.sessions.active_info()
    }

    /// Submits one (image, question) request and streams the answer back
    /// through events tagged with the returned request id. A newer ask
    /// supersedes the previous one.
    pub fn ask_question(&self, app: &AppHandle, image_path: &str, prompt: &str) -> Result<Uuid> {
        let image = PathBuf::from(image_path);
        let max_tokens = self.settings.read().max_answer_tokens;
        let mut stream = self.queries.submit(&image, prompt, max_tokens)?;
        let request_id = stream.id();
        info!(request = %request_id, "question submitted");

        let handle = app.clone();
        std::thread::spawn(move || {
            for event in stream.by_ref() {
                match event {
                    TokenStreamEvent::Token(token) => {
                        events::emit_answer_token(&handle, request_id, &token);
                    }
                    TokenStreamEvent::Completed => {
                        events::emit_answer_completed(&handle, request_id);
                    }
                    TokenStreamEvent::Error(cause) => {
                        events::emit_answer_error(&handle, request_id, &cause);
                    }
                }
            }
            if stream.state() == RequestState::Cancelled {
                events::emit_answer_cancelled(&handle, request_id);
            }
        });

        Ok(request_id)
    }

    pub fn stop_answer(&self) {
        self.queries.cancel_active();
    }

    pub fn shutdown(&self) {
        self.queries.cancel_active();
        self.sessions.destroy_session();
    }

    fn ensure_download_service(&self, app: &AppHandle) -> Result<()> {
        let mut guard = self.downloads.lock();
        if guard.is_none() {
            let paths = self.paths.lock().clone();
            let service = DownloadService::new(app.clone(), paths)?;
            *guard = Some(service);
        }
        Ok(())
    }

    fn download_service(&self) -> Result<DownloadService> {
        self.downloads
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("download service unavailable"))
    }
}

fn emit_engine_state(
    app: &AppHandle,
    state: &str,
    model_name: Option<String>,
    backend: Option<Backend>,
    error: Option<String>,
) {
    events::emit_engine_status(
        app,
        EngineStatusPayload {
            state: state.to_string(),
            model_name,
            backend,
            error,
        },
    );
}
