//! 設定ファイル管理モジュール
//!
//! TOMLファイルから設定を読み込み、アプリケーションとサービスプロバイダーが
//! 共有する型安全な設定構造体を提供します。

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 設定ファイルパスを上書きする環境変数
pub const CONFIG_ENV_VAR: &str = "OLLAMA_FACADE_CONFIG";

/// アプリケーション全体の設定
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// アプリケーション設定
    #[serde(default)]
    pub app: AppConfig,
    /// OLLAMA関連設定
    #[serde(default)]
    pub ollama: OllamaConfig,
    /// 永続化バックエンド設定（テスト環境の切り替え用）
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// アプリケーション設定
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// アプリケーション名
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 実行環境 (production / local / testing)
    #[serde(default = "default_env")]
    pub env: String,
}

/// OLLAMA接続設定
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    /// OLLAMAサーバーのURL
    #[serde(default = "default_ollama_url")]
    pub url: String,
    /// 使用するモデル名
    #[serde(default = "default_model")]
    pub model: String,
    /// 接続タイムアウト（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// 読み取りタイムアウト（秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// モデルのメモリ常駐時間 (例: "5m")
    #[serde(default)]
    pub keep_alive: Option<String>,
    /// リトライ設定
    #[serde(default)]
    pub retry: RetryConfig,
}

/// リトライ設定
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// 最大リトライ回数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初期バックオフ時間（ミリ秒）
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// バックオフ倍率
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 最大バックオフ時間（ミリ秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// 永続化バックエンド設定
///
/// マイグレーションは存在しないため、現状は接続名と保存先の保持のみ。
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// デフォルト接続名
    #[serde(default = "default_connection")]
    pub default: String,
    /// ストレージディレクトリ（未指定の場合は使用しない）
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

// デフォルト値を返す関数群
fn default_app_name() -> String {
    "ollama-facade".to_string()
}

fn default_env() -> String {
    "production".to_string()
}

fn default_ollama_url() -> String {
    crate::DEFAULT_OLLAMA_URL.to_string()
}

fn default_model() -> String {
    crate::DEFAULT_MODEL.to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    300
}

fn default_connection() -> String {
    "default".to_string()
}

// リトライ設定のデフォルト値
fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000 // 1秒
}

fn default_backoff_multiplier() -> f64 {
    2.0 // エクスポネンシャルバックオフ
}

fn default_max_backoff_ms() -> u64 {
    10000 // 最大10秒
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            env: default_env(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_model(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            keep_alive: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            default: default_connection(),
            storage_path: None,
        }
    }
}

impl Config {
    /// TOMLファイルから設定を読み込む
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// TOML文字列から設定をパース
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// デフォルト設定ファイルパスを取得
    pub fn default_config_path() -> PathBuf {
        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            return PathBuf::from(config_path);
        }

        // カレントディレクトリのconfig/ollama.toml
        let cwd_config = PathBuf::from("config/ollama.toml");
        if cwd_config.exists() {
            return cwd_config;
        }

        // ホームディレクトリの.ollama-facade/config.toml
        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".ollama-facade").join("config.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        cwd_config
    }

    /// デフォルト設定ファイルから読み込み（存在しない場合は自動生成）
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            if let Err(e) = Self::create_default_config(&config_path) {
                tracing::warn!("Failed to create default config: {}", e);
            } else {
                tracing::info!("Created default config at {}", config_path.display());
            }
            Ok(Self::default())
        }
    }

    /// デフォルト設定ファイルを生成
    fn create_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let default_content = r#"# ollama-facade default configuration

[app]
name = "ollama-facade"
env = "production"

[ollama]
url = "http://localhost:11434"
model = "llama3.2"
connect_timeout = 30   # seconds
read_timeout = 300     # seconds
# keep_alive = "5m"

[ollama.retry]
max_retries = 3
initial_backoff_ms = 1000
backoff_multiplier = 2.0
max_backoff_ms = 10000

[database]
default = "default"
"#;

        std::fs::write(path, default_content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// 環境変数 (OLLAMA_HOST / OLLAMA_MODEL) で接続先を上書き
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            if !host.trim().is_empty() {
                self.ollama.url = normalize_host(&host);
            }
        }
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            if !model.trim().is_empty() {
                self.ollama.model = model;
            }
        }
    }

    /// ドット区切りのキーで設定値を上書き
    ///
    /// 例: `config.set("database.default", "testing")`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "app.name" => self.app.name = value.to_string(),
            "app.env" => self.app.env = value.to_string(),
            "ollama.url" => self.ollama.url = value.to_string(),
            "ollama.model" => self.ollama.model = value.to_string(),
            "ollama.connect_timeout" => {
                self.ollama.connect_timeout = parse_value(key, value)?;
            }
            "ollama.read_timeout" => self.ollama.read_timeout = parse_value(key, value)?,
            "ollama.keep_alive" => self.ollama.keep_alive = Some(value.to_string()),
            "ollama.retry.max_retries" => self.ollama.retry.max_retries = parse_value(key, value)?,
            "ollama.retry.initial_backoff_ms" => {
                self.ollama.retry.initial_backoff_ms = parse_value(key, value)?;
            }
            "ollama.retry.backoff_multiplier" => {
                self.ollama.retry.backoff_multiplier = parse_value(key, value)?;
            }
            "ollama.retry.max_backoff_ms" => {
                self.ollama.retry.max_backoff_ms = parse_value(key, value)?;
            }
            "database.default" => self.database.default = value.to_string(),
            "database.storage_path" => {
                self.database.storage_path = Some(PathBuf::from(value));
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// テスト環境かどうか
    pub fn is_testing(&self) -> bool {
        self.app.env.eq_ignore_ascii_case("testing")
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

/// スキームのないホスト指定 (例: "127.0.0.1:11434") にhttp://を補う
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}
