use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::llm::{ChatMessage, ModelInfo, OllamaApi, StreamChunkData, StreamingResponse};

/// フェイクに対して行われた呼び出し
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Generate {
        prompt: String,
        system: Option<String>,
        stream: bool,
    },
    Chat {
        messages: Vec<ChatMessage>,
        stream: bool,
    },
    ListModels,
}

/// ネットワークに接続しないインメモリのOLLAMAクライアント
///
/// 応答はキューから順に返し、キューが空ならデフォルト応答を返す。
pub struct FakeOllama {
    model: String,
    base_url: String,
    default_response: String,
    responses: Mutex<VecDeque<String>>,
    models: Vec<ModelInfo>,
    available: bool,
    failure: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeOllama {
    pub fn new() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            base_url: "fake://ollama".to_string(),
            default_response: String::new(),
            responses: Mutex::new(VecDeque::new()),
            models: Vec::new(),
            available: true,
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// 次の応答をキューに追加
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.push_response(response);
        self
    }

    /// キューが空のときの応答
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    pub fn with_models<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = names
            .into_iter()
            .map(|name| ModelInfo {
                name: name.into(),
                modified_at: None,
                size: None,
                digest: None,
            })
            .collect();
        self
    }

    /// `is_available` がfalseを返すようにする
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// 全ての呼び出しを指定メッセージのエラーで失敗させる
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response.into());
    }

    /// 記録された呼び出しの一覧
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// generate系で送られたプロンプトの一覧
    pub fn generate_prompts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Generate { prompt, .. } => Some(prompt),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RecordedCall) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);

        if let Some(message) = &self.failure {
            bail!("{}", message);
        }
        Ok(())
    }

    fn next_response(&self) -> String {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }

    /// 応答を空白区切りのチャンクに分けてストリームにする
    fn stream_of(text: &str) -> StreamingResponse {
        let mut chunks: Vec<StreamChunkData> = text
            .split_inclusive(' ')
            .map(StreamChunkData::text)
            .collect();
        chunks.push(StreamChunkData::finished("", None));
        StreamingResponse::from_chunks(chunks)
    }
}

impl Default for FakeOllama {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OllamaApi for FakeOllama {
    fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        self.record(RecordedCall::Generate {
            prompt: prompt.to_string(),
            system: system.map(str::to_string),
            stream: false,
        })?;
        Ok(self.next_response())
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<StreamingResponse> {
        self.record(RecordedCall::Generate {
            prompt: prompt.to_string(),
            system: system.map(str::to_string),
            stream: true,
        })?;
        Ok(Self::stream_of(&self.next_response()))
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        self.record(RecordedCall::Chat {
            messages: messages.to_vec(),
            stream: false,
        })?;
        Ok(ChatMessage::assistant(self.next_response()))
    }

    async fn chat_streaming(&self, messages: &[ChatMessage]) -> Result<StreamingResponse> {
        self.record(RecordedCall::Chat {
            messages: messages.to_vec(),
            stream: true,
        })?;
        Ok(Self::stream_of(&self.next_response()))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.record(RecordedCall::ListModels)?;
        Ok(self.models.clone())
    }

    async fn is_available(&self) -> bool {
        self.available
    }
}
