use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::engine::{
    Backend, ChatMessage, ChatRole, EngineEvent, EngineInit, GenerationRequest, VlmEngine,
};

const TOKEN_PACING: Duration = Duration::from_millis(15);

/// Stand-in engine used until a native binding is wired up, and by the dev
/// harness. Emits a paced canned answer so the streaming path, preemption,
/// and event plumbing behave as they would against real hardware.
pub struct SimulatedEngine {
    model_name: String,
    backend: Backend,
    stopped: AtomicBool,
}

impl SimulatedEngine {
    pub fn new(init: &EngineInit) -> Self {
        Self {
            model_name: init.model_name.clone(),
            backend: init.config.backend(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl VlmEngine for SimulatedEngine {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String> {
        if messages.is_empty() {
            return Err(anyhow!("cannot render an empty conversation"));
        }
        let mut rendered = String::new();
        for message in messages {
            let tag = match message.role {
                ChatRole::User => "<|user|>",
                ChatRole::Assistant => "<|assistant|>",
            };
            rendered.push_str(tag);
            rendered.push('\n');
            for image in &message.images {
                rendered.push_str(&format!("<image:{}>\n", image.display()));
            }
            rendered.push_str(&message.text);
            rendered.push('\n');
        }
        rendered.push_str("<|assistant|>\n");
        Ok(rendered)
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        on_event: &mut dyn FnMut(EngineEvent),
    ) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);

        if request.prompt.trim().is_empty() {
            on_event(EngineEvent::Error("empty prompt (code 1002)".into()));
            return Ok(());
        }

        let subject = request
            .image_paths
            .first()
            .and_then(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().replace(['-', '_'], " "))
            .unwrap_or_else(|| "the scene".into());
        let answer = format!(
            "This looks like {subject}. Simulated {} description from {}.",
            self.backend.as_str(),
            self.model_name
        );

        for (index, word) in answer.split_whitespace().enumerate() {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            if index >= request.max_tokens {
                break;
            }
            let token = if index == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            on_event(EngineEvent::Token(token));
            std::thread::sleep(TOKEN_PACING);
        }

        if !self.stopped.load(Ordering::SeqCst) {
            on_event(EngineEvent::Completed);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.stop();
    }
}
