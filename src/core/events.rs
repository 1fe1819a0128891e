use serde::Serialize;
use tauri::{AppHandle, Emitter};
use uuid::Uuid;

use crate::inference::Backend;
use crate::models::DownloadProgress;

pub const EVENT_MODEL_STATUS: &str = "model-status";
pub const EVENT_DOWNLOAD_PROGRESS: &str = "download-progress";
pub const EVENT_ENGINE_STATUS: &str = "engine-status";
pub const EVENT_ANSWER_TOKEN: &str = "answer-token";
pub const EVENT_ANSWER_COMPLETED: &str = "answer-completed";
pub const EVENT_ANSWER_ERROR: &str = "answer-error";
pub const EVENT_ANSWER_CANCELLED: &str = "answer-cancelled";
pub const EVENT_LOGS_UPDATED: &str = "logs-updated";

pub fn emit_model_status<T: Serialize + Clone>(app: &AppHandle, payload: T) {
    let _ = app.emit(EVENT_MODEL_STATUS, payload);
}

pub fn emit_download_progress(app: &AppHandle, progress: &DownloadProgress) {
    let _ = app.emit(EVENT_DOWNLOAD_PROGRESS, progress.clone());
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusPayload {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn emit_engine_status(app: &AppHandle, payload: EngineStatusPayload) {
    let _ = app.emit(EVENT_ENGINE_STATUS, payload);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerTokenPayload {
    pub request_id: Uuid,
    pub token: String,
}

pub fn emit_answer_token(app: &AppHandle, request_id: Uuid, token: &str) {
    let payload = AnswerTokenPayload {
        request_id,
        token: token.to_string(),
    };
    let _ = app.emit(EVENT_ANSWER_TOKEN, payload);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerTerminalPayload {
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn emit_answer_completed(app: &AppHandle, request_id: Uuid) {
    let payload = AnswerTerminalPayload {
        request_id,
        error: None,
    };
    let _ = app.emit(EVENT_ANSWER_COMPLETED, payload);
}

pub fn emit_answer_error(app: &AppHandle, request_id: Uuid, error: &str) {
    let payload = AnswerTerminalPayload {
        request_id,
        error: Some(error.to_string()),
    };
    let _ = app.emit(EVENT_ANSWER_ERROR, payload);
}

pub fn emit_answer_cancelled(app: &AppHandle, request_id: Uuid) {
    let payload = AnswerTerminalPayload {
        request_id,
        error: None,
    };
    let _ = app.emit(EVENT_ANSWER_CANCELLED, payload);
}
