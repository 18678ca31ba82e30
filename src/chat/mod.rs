mod orchestrator;
mod request;
mod sink;
mod stream;

pub use orchestrator::{ChatOrchestrator, TurnOutcome};
pub use request::{AgentRequest, ChatPrompt, TurnMode, TurnRequest};
pub use sink::{BufferSink, ChannelSink, ChunkSink, SinkClosed, SinkEvent};
pub use stream::streaming_response;
