//! Voice session supervisor and WebSocket gateway.
//!
//! Each WebSocket connection gets its own session: client audio feeds the
//! capture queue, the supervisor coordinates transcription, generation and
//! synthesis, and every state change, fragment and audio chunk is streamed
//! back as a JSON event.

pub mod budget;
pub mod connection;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod state;
pub mod supervisor;

pub use pipeline::{ClientAudioSink, PipelineFactory, SessionHandle};
pub use server::start_gateway;
pub use state::GatewayState;
pub use supervisor::{Supervisor, SupervisorEvent};
