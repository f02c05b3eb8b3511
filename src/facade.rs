//! ファサード
//!
//! コンテナから解決したサービスを保持し、呼び出しをそのまま転送する薄いラッパー。
//! グローバルな参照は持たず、解決元のコンテナを明示的に受け取る。

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::container::{key_of, Container, ContainerError};
use crate::llm::{ChatMessage, ModelInfo, OllamaApi, StreamingResponse};

/// コンテナ上のサービスへのアクセサ
pub trait Facade: Sized {
    /// 転送先のサービス型（通常はトレイトオブジェクト）
    type Service: ?Sized + Send + Sync + 'static;

    /// サービスを解決するコンテナキー
    fn accessor() -> &'static str {
        key_of::<Self::Service>()
    }

    /// 解決済みのサービスからファサードを作成
    fn from_service(service: Arc<Self::Service>) -> Self;

    /// コンテナからサービスを解決してファサードを作成
    ///
    /// キーが登録されていなければ `ContainerError::BindingNotFound`。
    fn resolve(container: &Container) -> Result<Self, ContainerError> {
        container
            .resolve::<Self::Service>(Self::accessor())
            .map(Self::from_service)
    }
}

/// OLLAMAクライアントのファサード
///
/// 全ての呼び出しはコンテナに登録された `dyn OllamaApi` に転送され、
/// 結果やエラーは変換せずに返す。
#[derive(Clone)]
pub struct Ollama {
    root: Arc<dyn OllamaApi>,
}

impl Ollama {
    pub fn new(root: Arc<dyn OllamaApi>) -> Self {
        Self { root }
    }

    /// 転送先のインスタンス
    pub fn root(&self) -> &Arc<dyn OllamaApi> {
        &self.root
    }
}

impl Facade for Ollama {
    type Service = dyn OllamaApi;

    fn from_service(service: Arc<dyn OllamaApi>) -> Self {
        Self::new(service)
    }
}

#[async_trait]
impl OllamaApi for Ollama {
    fn model(&self) -> &str {
        self.root.model()
    }

    fn base_url(&self) -> &str {
        self.root.base_url()
    }

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        self.root.generate(prompt, system).await
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<StreamingResponse> {
        self.root.generate_streaming(prompt, system).await
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        self.root.chat(messages).await
    }

    async fn chat_streaming(&self, messages: &[ChatMessage]) -> Result<StreamingResponse> {
        self.root.chat_streaming(messages).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.root.list_models().await
    }

    async fn is_available(&self) -> bool {
        self.root.is_available().await
    }
}
