use std::{collections::HashMap, sync::Arc, thread};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tauri::AppHandle;
use tracing::{info, warn};

use crate::core::events;

use super::{
    download::ModelDownloader,
    resolver::{self, ResolvedSource, StoragePaths},
    spec::ModelSpec,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ModelStatus {
    NotInstalled,
    Downloading { progress: f32 },
    Installed,
    Error(String),
}

/// Snapshot of one model for the frontend model picker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    pub id: String,
    pub display_name: String,
    pub status: ModelStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatusPayload {
    pub model_id: String,
    pub status: ModelStatus,
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub spec: ModelSpec,
}

/// Long-lived worker that acquires model artifacts off the interactive path.
/// Jobs run one at a time; progress and terminal status go out as events.
#[derive(Debug)]
pub struct DownloadService {
    sender: Sender<DownloadJob>,
    statuses: Arc<Mutex<HashMap<String, ModelStatus>>>,
    paths: StoragePaths,
}

impl Clone for DownloadService {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            statuses: self.statuses.clone(),
            paths: self.paths.clone(),
        }
    }
}

impl DownloadService {
    pub fn new(app: AppHandle, paths: StoragePaths) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let statuses: Arc<Mutex<HashMap<String, ModelStatus>>> = Arc::new(Mutex::new(HashMap::new()));
        let downloader = ModelDownloader::new(paths.clone())?;
        let worker_statuses = statuses.clone();
        thread::spawn(move || worker_loop(receiver, downloader, worker_statuses, app));
        Ok(Self {
            sender,
            statuses,
            paths,
        })
    }

    pub fn queue(&self, job: DownloadJob) -> Result<()> {
        {
            let mut statuses = self.statuses.lock();
            statuses.insert(job.spec.id.clone(), ModelStatus::Downloading { progress: 0.0 });
        }
        self.sender
            .send(job)
            .context("send model download job to worker")
    }

    /// Current status of a model: an in-flight or failed job wins, otherwise
    /// the filesystem decides (resolution state is never cached, since files
    /// can vanish or appear between checks).
    pub fn status_of(&self, spec: &ModelSpec) -> ModelStatus {
        let cached = self.statuses.lock().get(&spec.id).cloned();
        effective_status(cached, spec, &self.paths)
    }

    pub fn state_of(&self, spec: &ModelSpec) -> ModelState {
        ModelState {
            id: spec.id.clone(),
            display_name: spec.display_name.clone(),
            status: self.status_of(spec),
        }
    }

    pub fn forget(&self, model_id: &str) {
        self.statuses.lock().remove(model_id);
    }
}

fn worker_loop(
    receiver: Receiver<DownloadJob>,
    downloader: ModelDownloader,
    statuses: Arc<Mutex<HashMap<String, ModelStatus>>>,
    app: AppHandle,
) {
    for job in receiver.iter() {
        let model_id = job.spec.id.clone();
        set_status(
            &statuses,
            &app,
            &model_id,
            ModelStatus::Downloading { progress: 0.0 },
        );

        let result = downloader.download(&job.spec, |progress| {
            {
                let mut statuses = statuses.lock();
                statuses.insert(
                    progress.model_id.clone(),
                    ModelStatus::Downloading {
                        progress: progress.overall_percent,
                    },
                );
            }
            events::emit_download_progress(&app, &progress);
        });

        match result {
            Ok(outcome) => {
                info!(
                    model = %outcome.model_id,
                    source = ?outcome.source,
                    digest = outcome.entry_sha256.as_deref().unwrap_or("unknown"),
                    "model installed"
                );
                // Terminal success drops the in-flight entry so later status
                // checks re-resolve from disk instead of a stale cache.
                statuses.lock().remove(&model_id);
                events::emit_model_status(
                    &app,
                    ModelStatusPayload {
                        model_id: model_id.clone(),
                        status: ModelStatus::Installed,
                    },
                );
            }
            Err(error) => {
                warn!(model = %model_id, "model download failed: {error:#}");
                set_status(
                    &statuses,
                    &app,
                    &model_id,
                    ModelStatus::Error(format!("{error:#}")),
                );
            }
        }
    }
}

fn effective_status(
    cached: Option<ModelStatus>,
    spec: &ModelSpec,
    paths: &StoragePaths,
) -> ModelStatus {
    match cached {
        Some(status @ (ModelStatus::Downloading { .. } | ModelStatus::Error(_))) => status,
        _ => match resolver::resolve(spec, paths) {
            ResolvedSource::AlreadyLocal => ModelStatus::Installed,
            _ => ModelStatus::NotInstalled,
        },
    }
}

fn set_status(
    statuses: &Arc<Mutex<HashMap<String, ModelStatus>>>,
    app: &AppHandle,
    model_id: &str,
    status: ModelStatus,
) {
    {
        let mut statuses = statuses.lock();
        statuses.insert(model_id.to_string(), status.clone());
    }
    events::emit_model_status(
        app,
        ModelStatusPayload {
            model_id: model_id.to_string(),
            status,
        },
    );
}
