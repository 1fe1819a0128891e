pub mod engine;
pub mod query;
pub mod session;
pub mod sim;

#[allow(unused_imports)]
pub use engine::{
    Backend, BackendConfig, ChatMessage, ChatRole, EngineEvent, EngineFactory, EngineInit,
    GenerationRequest, VlmEngine,
};
#[allow(unused_imports)]
pub use query::{QueryError, QueryPipeline, QueryStream, RequestState, TokenStreamEvent};
#[allow(unused_imports)]
pub use session::{SessionError, SessionInfo, SessionManager};
#[allow(unused_imports)]
pub use sim::SimulatedEngine;
