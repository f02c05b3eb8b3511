pub mod api;
pub mod client;
pub mod streaming;
pub mod types;

pub use api::OllamaApi;
pub use client::{OllamaClient, RetryableError};
pub use streaming::{StreamChunkData, StreamStats, StreamingResponse};
pub use types::{ChatMessage, ModelInfo, Role};
