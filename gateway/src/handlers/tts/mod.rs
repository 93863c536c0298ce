//! The `/tts` WebSocket front door.

mod handler;

pub use handler::tts_handler;
