//! Conversation engine for the voice pipeline.
//!
//! Takes a final transcript, builds the prompt (system instructions, memory
//! block, recent turns), streams the model response and forwards each text
//! fragment tagged with the turn's epoch.

pub mod engine;
pub mod memory;
pub mod prompt;

pub use engine::{ConversationEngine, EngineSettings, TurnOutcome, TurnRequest};
pub use memory::{FileMemoryStore, MemoryLookup, MemoryWriter, NoMemory};
