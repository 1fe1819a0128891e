use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Hardware execution target for inference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Npu,
    CpuGpu,
}

impl Backend {
    /// Accepts the identifiers seen in manifests and settings files; older
    /// artifacts used underscores.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "npu" => Some(Backend::Npu),
            "cpu_gpu" | "cpu-gpu" | "cpu" | "gpu" => Some(Backend::CpuGpu),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Npu => "npu",
            Backend::CpuGpu => "cpu-gpu",
        }
    }
}

/// Backend-specific engine tuning. The NPU path needs to know where its
/// native libraries and the model directory live; the general path takes
/// thread and batch tuning instead.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Npu { lib_dir: PathBuf, model_dir: PathBuf },
    CpuGpu { n_threads: usize, n_batch: usize },
}

impl BackendConfig {
    #[must_use]
    pub fn backend(&self) -> Backend {
        match self {
            BackendConfig::Npu { .. } => Backend::Npu,
            BackendConfig::CpuGpu { .. } => Backend::CpuGpu,
        }
    }
}

/// Everything the native engine needs to load one model.
#[derive(Debug, Clone)]
pub struct EngineInit {
    pub model_name: String,
    pub entry_path: PathBuf,
    pub mmproj_path: Option<PathBuf>,
    pub config: BackendConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of a multimodal conversation; image paths are interleaved with
/// the text by the engine's own template when the prompt is rendered.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
    pub images: Vec<PathBuf>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>, images: Vec<PathBuf>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
            images,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image_paths: Vec<PathBuf>,
    pub max_tokens: usize,
}

/// The three outcome kinds the engine reports during generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Token(String),
    Completed,
    Error(String),
}

/// Boundary to the native inference engine. The engine is an opaque
/// capability; this trait only pins down how the core drives it. `generate`
/// blocks the calling thread and reports incrementally through `on_event`;
/// `stop` may be called from another thread and must interrupt an in-flight
/// generation promptly.
pub trait VlmEngine: Send + Sync {
    fn backend(&self) -> Backend;

    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String>;

    fn generate(
        &self,
        request: &GenerationRequest,
        on_event: &mut dyn FnMut(EngineEvent),
    ) -> Result<()>;

    fn stop(&self);

    /// Releases native resources. Runs from cleanup paths, so it must not
    /// fail or block indefinitely.
    fn shutdown(&self);
}

/// Constructor seam the session manager calls per backend attempt.
pub type EngineFactory = Arc<dyn Fn(&EngineInit) -> Result<Arc<dyn VlmEngine>> + Send + Sync>;

/// Hard default when neither the artifact manifest nor the caller picks a
/// backend: NPU only looks plausible on high-memory arm64 devices, the
/// general path everywhere else.
pub fn default_backend() -> Backend {
    if cfg!(target_arch = "aarch64") {
        let mut system = System::new();
        system.refresh_memory();
        const MIN_NPU_MEMORY: u64 = 6 * 1024 * 1024 * 1024;
        if system.total_memory() >= MIN_NPU_MEMORY {
            return Backend::Npu;
        }
    }
    Backend::CpuGpu
}

pub fn default_cpu_config() -> BackendConfig {
    let n_threads = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4);
    BackendConfig::CpuGpu {
        n_threads,
        n_batch: 32,
    }
}
