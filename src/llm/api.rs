use anyhow::Result;
use async_trait::async_trait;

use super::streaming::StreamingResponse;
use super::types::{ChatMessage, ModelInfo};

/// OLLAMAクライアントのインターフェース
///
/// サービスコンテナにはこのトレイトオブジェクト (`dyn OllamaApi`) の型名を
/// キーとして登録され、ファサードはこのトレイト越しに呼び出しを転送する。
#[async_trait]
pub trait OllamaApi: Send + Sync {
    /// 使用中のモデル名
    fn model(&self) -> &str;

    /// 接続先のベースURL
    fn base_url(&self) -> &str;

    /// 単発のテキスト生成 (`/api/generate`)
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String>;

    /// ストリーミングでのテキスト生成
    async fn generate_streaming(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<StreamingResponse>;

    /// チャット (`/api/chat`)。アシスタントの応答メッセージを返す
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage>;

    /// ストリーミングでのチャット
    async fn chat_streaming(&self, messages: &[ChatMessage]) -> Result<StreamingResponse>;

    /// インストール済みモデルの一覧 (`/api/tags`)
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// サーバーに到達できるかどうか
    async fn is_available(&self) -> bool;
}
