//! ストリーミングレスポンス処理モジュール
//!
//! OLLAMAのNDJSONストリーム（`/api/generate` と `/api/chat`）を
//! バックグラウンドタスクで読み取り、チャンネル経由でトークンを受け渡す。

use anyhow::{anyhow, Result};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::types::ChatMessage;

/// チャンネルのバッファサイズ
const CHANNEL_CAPACITY: usize = 100;

#[derive(Deserialize, Debug, Clone)]
struct StreamChunk {
    /// `/api/generate` のトークン
    #[serde(default)]
    response: Option<String>,
    /// `/api/chat` のトークン
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

/// ストリーミングレスポンスのチャンク
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunkData {
    /// テキストコンテンツ
    pub text: String,
    /// ストリームが完了したかどうか
    pub done: bool,
    /// 統計情報（完了時のみ）
    pub stats: Option<StreamStats>,
}

impl StreamChunkData {
    /// 途中のテキストチャンク
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
            stats: None,
        }
    }

    /// 最後のチャンク
    pub fn finished(text: impl Into<String>, stats: Option<StreamStats>) -> Self {
        Self {
            text: text.into(),
            done: true,
            stats,
        }
    }
}

/// ストリーミング完了時の統計情報
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    /// 総処理時間（ナノ秒）
    pub total_duration: u64,
    /// プロンプト評価トークン数
    pub prompt_eval_count: u32,
    /// 生成トークン数
    pub eval_count: u32,
    /// トークン/秒
    pub tokens_per_second: f64,
}

/// 1行のNDJSONをパース
///
/// 空行や解釈できない行は `None`。サーバーが `error` を返した場合は `Err`。
fn parse_line(line: &str) -> Option<Result<StreamChunkData, String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let chunk = match serde_json::from_str::<StreamChunk>(trimmed) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!("Skipping unparsable stream line: {}", e);
            return None;
        }
    };

    if let Some(error) = chunk.error {
        return Some(Err(error));
    }

    let stats = if chunk.done {
        let eval_count = chunk.eval_count.unwrap_or(0);
        let eval_duration = chunk.eval_duration.unwrap_or(0);
        let tokens_per_second = if eval_duration > 0 {
            (eval_count as f64) / (eval_duration as f64 / 1_000_000_000.0)
        } else {
            0.0
        };

        Some(StreamStats {
            total_duration: chunk.total_duration.unwrap_or(0),
            prompt_eval_count: chunk.prompt_eval_count.unwrap_or(0),
            eval_count,
            tokens_per_second,
        })
    } else {
        None
    };

    let text = chunk
        .response
        .or_else(|| chunk.message.map(|m| m.content))
        .unwrap_or_default();

    Some(Ok(StreamChunkData {
        text,
        done: chunk.done,
        stats,
    }))
}

/// ストリーミングレスポンス
///
/// トークン単位でレスポンスを受信するためのイテレータ風インターフェース。
/// ストリーム途中のエラー（サーバーの `error` 行、通信エラー）は `Err` として受け取る。
pub struct StreamingResponse {
    receiver: mpsc::Receiver<Result<StreamChunkData>>,
    /// 累積されたテキスト
    accumulated_text: String,
}

impl StreamingResponse {
    /// 既知のチャンク列からレスポンスを作成（フェイククライアント用）
    pub fn from_chunks(chunks: Vec<StreamChunkData>) -> Self {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // 容量はチャンク数以上なので失敗しない
            let _ = tx.try_send(Ok(chunk));
        }

        Self {
            receiver: rx,
            accumulated_text: String::new(),
        }
    }

    /// 次のチャンクを取得
    ///
    /// ストリームが終了した場合はNoneを返す
    pub async fn next(&mut self) -> Option<Result<StreamChunkData>> {
        let item = self.receiver.recv().await?;
        if let Ok(chunk) = &item {
            self.accumulated_text.push_str(&chunk.text);
        }
        Some(item)
    }

    /// 次のテキストチャンクのみを取得（簡易版）
    pub async fn next_text(&mut self) -> Option<Result<String>> {
        self.next().await.map(|item| item.map(|chunk| chunk.text))
    }

    /// 累積テキストを取得
    pub fn accumulated(&self) -> &str {
        &self.accumulated_text
    }

    /// 全テキストを収集（ストリーム完了まで待機）
    pub async fn collect_all(&mut self) -> Result<String> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.accumulated_text.clone())
    }

    /// コールバック付きで全テキストを処理
    ///
    /// 各チャンク受信時にコールバックが呼ばれる
    pub async fn process_with_callback<F>(&mut self, mut callback: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        while let Some(item) = self.next().await {
            callback(&item?.text);
        }
        Ok(self.accumulated_text.clone())
    }
}

/// 1行分をチャンネルに送る。ストリームを終えるべきならfalse
async fn forward_line(tx: &mpsc::Sender<Result<StreamChunkData>>, line: &[u8]) -> bool {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            let error = anyhow!("ストリームに不正なUTF-8が含まれています: {}", e);
            let _ = tx.send(Err(error)).await;
            return false;
        }
    };

    match parse_line(text) {
        None => true,
        Some(Err(error)) => {
            tracing::warn!("OLLAMAがストリーム中にエラーを返しました: {}", error);
            let _ = tx.send(Err(anyhow!("OLLAMAストリームエラー: {}", error))).await;
            false
        }
        Some(Ok(data)) => {
            let done = data.done;
            // レシーバーがドロップされた場合も終了
            tx.send(Ok(data)).await.is_ok() && !done
        }
    }
}

/// 成功したHTTPレスポンスのボディをバックグラウンドで読み取る
pub(crate) fn spawn_stream(response: reqwest::Response) -> StreamingResponse {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut stream = response.bytes_stream();

    tokio::spawn(async move {
        let mut buffer = Vec::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("ストリーミング中にエラーが発生しました: {}", e);
                    let error = anyhow::Error::new(e)
                        .context("ストリーミング中に通信が切断されました");
                    let _ = tx.send(Err(error)).await;
                    return;
                }
            };
            buffer.extend_from_slice(&bytes);

            // 改行で分割してJSONをパース
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if !forward_line(&tx, &line).await {
                    return;
                }
            }
        }

        // 改行なしで終わった最後の行
        forward_line(&tx, &buffer).await;
    });

    StreamingResponse {
        receiver: rx,
        accumulated_text: String::new(),
    }
}
