//! ollama-facade: OLLAMAクライアントのサービスコンテナ連携
//!
//! サービスプロバイダーがOLLAMAクライアントをコンテナに登録し、
//! ファサード (`Ollama`) がコンテナから解決したクライアントへ呼び出しを転送する。
//! `testing` モジュールはテストごとに独立したアプリケーションを組み立てる。

pub mod app;
pub mod config;
pub mod container;
pub mod facade;
pub mod llm;
pub mod provider;
pub mod testing;

// 主要な型の再エクスポート
pub use app::Application;
pub use config::{AppConfig, Config, DatabaseConfig, OllamaConfig, RetryConfig};
pub use container::{key_of, Container, ContainerError, Lifetime};
pub use facade::{Facade, Ollama};
pub use llm::{
    ChatMessage, ModelInfo, OllamaApi, OllamaClient, Role, StreamChunkData, StreamStats,
    StreamingResponse,
};
pub use provider::{OllamaServiceProvider, ServiceProvider};

/// バージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// デフォルトのOLLAMA URL
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// デフォルトのモデル名
pub const DEFAULT_MODEL: &str = "llama3.2";
