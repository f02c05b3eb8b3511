//! OLLAMAクライアント - エラーリトライ機能付き
//!
//! 接続エラー・タイムアウト・5xx応答時の自動リトライ（エクスポネンシャルバックオフ）を
//! サポートし、ストリーミング出力にも対応する。

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use super::api::OllamaApi;
use super::streaming::{spawn_stream, StreamingResponse};
use super::types::{ChatMessage, ModelInfo};
use crate::config::{OllamaConfig, RetryConfig};

/// リトライ可能なエラーの種類
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryableError {
    /// 接続エラー（サーバーに到達できない）
    Connection,
    /// タイムアウト
    Timeout,
    /// サーバーエラー（5xx）
    ServerError,
    /// リクエストエラー（リトライ不可）
    NonRetryable,
}

impl RetryableError {
    /// reqwestエラーからリトライ可能かどうかを判定
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_connect() {
            RetryableError::Connection
        } else if error.is_timeout() {
            RetryableError::Timeout
        } else if let Some(status) = error.status() {
            Self::from_status(status)
        } else if error.is_request() {
            RetryableError::Connection
        } else {
            RetryableError::NonRetryable
        }
    }

    /// HTTPステータスから判定
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.is_server_error() {
            RetryableError::ServerError
        } else {
            RetryableError::NonRetryable
        }
    }

    /// リトライ可能かどうか
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetryableError::Connection | RetryableError::Timeout | RetryableError::ServerError
        )
    }

    /// エラーの説明
    pub fn description(&self) -> &'static str {
        match self {
            RetryableError::Connection => "接続エラー",
            RetryableError::Timeout => "タイムアウト",
            RetryableError::ServerError => "サーバーエラー",
            RetryableError::NonRetryable => "リクエストエラー",
        }
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    keep_alive: Option<String>,
    retry_config: RetryConfig,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    fn build_client(connect_timeout_secs: u64, read_timeout_secs: u64) -> Client {
        Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .no_proxy()
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(
                    "Failed to build HTTP client with timeouts, falling back to defaults: {}",
                    e
                );
                Client::new()
            })
    }

    /// 基本的なクライアントを作成（デフォルトタイムアウト使用）
    pub fn new(base_url: &str, model: &str) -> Self {
        Self::with_timeout(base_url, model, 30, 300)
    }

    /// タイムアウト設定付きでクライアントを作成
    pub fn with_timeout(
        base_url: &str,
        model: &str,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Self {
        Self {
            client: Self::build_client(connect_timeout_secs, read_timeout_secs),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            keep_alive: None,
            retry_config: RetryConfig::default(),
        }
    }

    /// OllamaConfigからクライアントを作成
    pub fn from_config(config: &OllamaConfig) -> Self {
        Self {
            client: Self::build_client(config.connect_timeout, config.read_timeout),
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            keep_alive: config.keep_alive.clone(),
            retry_config: config.retry.clone(),
        }
    }

    /// リトライ設定を更新
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// keep_alive (例: "5m", "0") を設定
    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    /// モデル名を更新
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// 現在のリトライ設定を取得
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    pub fn keep_alive(&self) -> Option<&str> {
        self.keep_alive.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// バックオフ時間を計算（エクスポネンシャルバックオフ）
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.retry_config.initial_backoff_ms as f64)
            * self.retry_config.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.retry_config.max_backoff_ms as f64) as u64;
        Duration::from_millis(backoff_ms)
    }

    /// リトライ付きでリクエストを送信
    ///
    /// 成功ステータスのレスポンスのみを返す。4xxは即座に失敗し、
    /// 5xxと接続系のエラーは `max_retries` 回までリトライする。
    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let max_retries = self.retry_config.max_retries;

        for attempt in 0..=max_retries {
            let error_type = match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let error_type = RetryableError::from_status(status);
                    if !error_type.is_retryable() || attempt >= max_retries {
                        let body = response.text().await.unwrap_or_default();
                        bail!("OLLAMAサーバーエラー: {} - {}", status, body);
                    }
                    error_type
                }
                Err(error) => {
                    let error_type = RetryableError::from_reqwest_error(&error);
                    if !error_type.is_retryable() || attempt >= max_retries {
                        return Err(error).context(format!(
                            "リクエスト失敗 ({}): {}回のリトライ後",
                            error_type.description(),
                            attempt
                        ));
                    }
                    error_type
                }
            };

            let backoff = self.calculate_backoff(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                max_retries,
                error_type = error_type.description(),
                backoff_ms = backoff.as_millis() as u64,
                "リトライ待機中..."
            );
            sleep(backoff).await;
        }

        bail!("リトライ回数を超過しました")
    }

    async fn post_json<B>(&self, path: &str, body: &B) -> Result<Response>
    where
        B: Serialize + Sync + ?Sized,
    {
        let url = self.url(path);
        self.send_with_retry(|| self.client.post(&url).json(body)).await
    }
}

#[async_trait]
impl OllamaApi for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            system,
            keep_alive: self.keep_alive.as_deref(),
        };

        let response: GenerateResponse = self
            .post_json("/api/generate", &request)
            .await?
            .json()
            .await
            .context("Failed to parse generate response")?;

        Ok(response.response)
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<StreamingResponse> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
            system,
            keep_alive: self.keep_alive.as_deref(),
        };

        let response = self.post_json("/api/generate", &request).await?;
        Ok(spawn_stream(response))
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            keep_alive: self.keep_alive.as_deref(),
        };

        let response: ChatResponse = self
            .post_json("/api/chat", &request)
            .await?
            .json()
            .await
            .context("Failed to parse chat response")?;

        Ok(response.message)
    }

    async fn chat_streaming(&self, messages: &[ChatMessage]) -> Result<StreamingResponse> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            keep_alive: self.keep_alive.as_deref(),
        };

        let response = self.post_json("/api/chat", &request).await?;
        Ok(spawn_stream(response))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.url("/api/tags");
        let response: TagsResponse = self
            .send_with_retry(|| self.client.get(&url))
            .await?
            .json()
            .await
            .context("Failed to parse model list")?;

        Ok(response.models)
    }

    async fn is_available(&self) -> bool {
        match self.client.get(self.url("/api/tags")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(base_url = %self.base_url, "OLLAMA is not reachable: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_error_classification() {
        assert!(RetryableError::Connection.is_retryable());
        assert!(RetryableError::Timeout.is_retryable());
        assert!(RetryableError::ServerError.is_retryable());
        assert!(!RetryableError::NonRetryable.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            RetryableError::from_status(reqwest::StatusCode::BAD_GATEWAY),
            RetryableError::ServerError
        );
        assert_eq!(
            RetryableError::from_status(reqwest::StatusCode::NOT_FOUND),
            RetryableError::NonRetryable
        );
    }

    #[test]
    fn test_calculate_backoff() {
        let client = OllamaClient::new("http://localhost:11434", "test");

        // デフォルト設定: 1000ms, 倍率2.0
        assert_eq!(client.calculate_backoff(0), Duration::from_millis(1000));
        assert_eq!(client.calculate_backoff(1), Duration::from_millis(2000));
        assert_eq!(client.calculate_backoff(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_max_limit() {
        let mut client = OllamaClient::new("http://localhost:11434", "test");
        client.retry_config.max_backoff_ms = 5000;

        // 1000 * 2^4 = 16000ms だが、max 5000ms に制限
        assert_eq!(client.calculate_backoff(4), Duration::from_millis(5000));
    }

    #[test]
    fn test_from_config() {
        let config = OllamaConfig {
            url: "http://custom:11434/".to_string(),
            model: "custom-model".to_string(),
            connect_timeout: 60,
            read_timeout: 600,
            keep_alive: Some("10m".to_string()),
            retry: RetryConfig {
                max_retries: 5,
                initial_backoff_ms: 2000,
                backoff_multiplier: 1.5,
                max_backoff_ms: 30000,
            },
        };

        let client = OllamaClient::from_config(&config);
        assert_eq!(client.base_url(), "http://custom:11434");
        assert_eq!(client.model(), "custom-model");
        assert_eq!(client.keep_alive(), Some("10m"));
        assert_eq!(client.retry_config().max_retries, 5);
        assert_eq!(client.retry_config().initial_backoff_ms, 2000);
    }

    #[test]
    fn test_generate_request_omits_empty_options() {
        let request = GenerateRequest {
            model: "m",
            prompt: "p",
            stream: false,
            system: None,
            keep_alive: None,
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json, serde_json::json!({"model": "m", "prompt": "p", "stream": false}));
    }

    #[test]
    fn test_zero_timeouts_still_build_client() {
        let client = OllamaClient::with_timeout("http://localhost:11434/", "test", 0, 0);
        assert_eq!(client.base_url(), "http://localhost:11434");
        assert_eq!(client.url("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_set_model() {
        let mut client = OllamaClient::new("http://localhost:11434", "a");
        client.set_model("b");
        assert_eq!(client.model(), "b");
    }
}
