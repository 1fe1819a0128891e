use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::engine::{ChatMessage, EngineEvent, GenerationRequest, VlmEngine};
use super::session::{SessionError, SessionManager};

const DEFAULT_MAX_TOKENS: usize = 512;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no active session; initialize the engine before asking")]
    NoActiveSession,
    #[error("image file missing or empty: {0}")]
    MissingImage(PathBuf),
}

/// Incremental output of one inference request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStreamEvent {
    Token(String),
    Completed,
    Error(String),
}

/// Request lifecycle. `Pending` from submit until the first event;
/// `Streaming` once tokens flow; the three terminal states are mutually
/// exclusive and final. `Cancelled` means superseded, which is not a
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

struct ActiveQuery {
    id: Uuid,
    cancel: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Runs at most one logical (image, prompt) inference at a time. A newer
/// submission preempts the current one: its cancel flag is raised, the
/// native generation is stopped explicitly, and its worker is joined before
/// the new request may start. Cancelling the consumer alone is not enough,
/// since native-side computation keeps burning the device and could
/// interleave with the next stream.
pub struct QueryPipeline {
    sessions: Arc<SessionManager>,
    active: Mutex<Option<ActiveQuery>>,
}

impl QueryPipeline {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            active: Mutex::new(None),
        }
    }

    /// Validates preconditions, preempts any in-flight request, and returns
    /// a cold stream for the new one. No engine work happens until the
    /// stream is consumed. A zero `max_tokens` falls back to the default
    /// budget.
    pub fn submit(
        &self,
        image_path: &Path,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<QueryStream, QueryError> {
        let engine = self
            .sessions
            .engine()
            .map_err(|_: SessionError| QueryError::NoActiveSession)?;

        let image_ok = std::fs::metadata(image_path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false);
        if !image_ok {
            return Err(QueryError::MissingImage(image_path.to_path_buf()));
        }

        self.preempt_active();

        let id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(Mutex::new(None));
        {
            let mut guard = self.active.lock();
            *guard = Some(ActiveQuery {
                id,
                cancel: cancel.clone(),
                worker: worker.clone(),
            });
        }
        debug!(request = %id, image = %image_path.display(), "query accepted");

        Ok(QueryStream {
            id,
            state: RequestState::Pending,
            cancel,
            receiver: None,
            launch: Some(Launch {
                engine,
                image_path: image_path.to_path_buf(),
                prompt: prompt.to_string(),
                max_tokens: if max_tokens == 0 {
                    DEFAULT_MAX_TOKENS
                } else {
                    max_tokens
                },
                worker,
            }),
        })
    }

    /// Explicit user-triggered stop of the current request, if any.
    pub fn cancel_active(&self) {
        self.preempt_active();
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.active.lock().as_ref().map(|query| query.id)
    }

    fn preempt_active(&self) {
        let previous = self.active.lock().take();
        let Some(previous) = previous else {
            return;
        };

        debug!(request = %previous.id, "preempting in-flight query");
        previous.cancel.store(true, Ordering::SeqCst);
        self.sessions.stop_generation();

        let handle = previous.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(request = %previous.id, "query worker panicked");
            }
        }
    }
}

struct Launch {
    engine: Arc<dyn VlmEngine>,
    image_path: PathBuf,
    prompt: String,
    max_tokens: usize,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Cold, single-subscriber event sequence for one request. The generation
/// worker is spawned on first `next()`; a stream dropped unconsumed never
/// touches the engine.
pub struct QueryStream {
    id: Uuid,
    state: RequestState,
    cancel: Arc<AtomicBool>,
    receiver: Option<Receiver<TokenStreamEvent>>,
    launch: Option<Launch>,
}

impl QueryStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    fn ensure_started(&mut self) {
        if self.receiver.is_some() {
            return;
        }
        let Some(launch) = self.launch.take() else {
            return;
        };

        let (sender, receiver) = unbounded();
        let cancel = self.cancel.clone();
        let worker = launch.worker.clone();
        let handle = std::thread::spawn(move || {
            run_generation(
                launch.engine,
                launch.image_path,
                launch.prompt,
                launch.max_tokens,
                cancel,
                sender,
            );
        });
        *worker.lock() = Some(handle);
        self.receiver = Some(receiver);
    }
}

impl Iterator for QueryStream {
    type Item = TokenStreamEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state.is_terminal() {
            return None;
        }
        self.ensure_started();
        let receiver = self.receiver.as_ref()?;

        match receiver.recv() {
            Ok(TokenStreamEvent::Token(token)) => {
                self.state = RequestState::Streaming;
                Some(TokenStreamEvent::Token(token))
            }
            Ok(TokenStreamEvent::Completed) => {
                self.state = RequestState::Completed;
                Some(TokenStreamEvent::Completed)
            }
            Ok(TokenStreamEvent::Error(cause)) => {
                self.state = RequestState::Failed;
                Some(TokenStreamEvent::Error(cause))
            }
            // Channel closed without a terminal marker: superseded if our
            // cancel flag is up, otherwise the worker died on us.
            Err(_) => {
                if self.cancel.load(Ordering::SeqCst) {
                    self.state = RequestState::Cancelled;
                    None
                } else {
                    self.state = RequestState::Failed;
                    Some(TokenStreamEvent::Error(
                        "token stream ended without completion".into(),
                    ))
                }
            }
        }
    }
}

fn run_generation(
    engine: Arc<dyn VlmEngine>,
    image_path: PathBuf,
    prompt: String,
    max_tokens: usize,
    cancel: Arc<AtomicBool>,
    sender: Sender<TokenStreamEvent>,
) {
    if cancel.load(Ordering::SeqCst) {
        return;
    }

    let messages = [ChatMessage::user(prompt, vec![image_path.clone()])];
    let rendered = match engine.render_prompt(&messages) {
        Ok(rendered) => rendered,
        Err(error) => {
            let _ = sender.send(TokenStreamEvent::Error(format!("{error:#}")));
            return;
        }
    };

    let request = GenerationRequest {
        prompt: rendered,
        image_paths: vec![image_path],
        max_tokens,
    };

    let stop_target = engine.clone();
    let mut stop_requested = false;
    let result = engine.generate(&request, &mut |event| {
        if cancel.load(Ordering::SeqCst) {
            if !stop_requested {
                stop_target.stop();
                stop_requested = true;
            }
            return;
        }
        let _ = match event {
            EngineEvent::Token(token) => sender.send(TokenStreamEvent::Token(token)),
            EngineEvent::Completed => sender.send(TokenStreamEvent::Completed),
            EngineEvent::Error(cause) => sender.send(TokenStreamEvent::Error(cause)),
        };
    });

    if let Err(error) = result {
        if !cancel.load(Ordering::SeqCst) {
            let _ = sender.send(TokenStreamEvent::Error(format!("{error:#}")));
        }
    }
}
