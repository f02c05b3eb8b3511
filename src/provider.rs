//! サービスプロバイダー
//!
//! アプリケーション起動時にコンテナへバインディングを登録するフック。

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::container::Container;
use crate::llm::{OllamaApi, OllamaClient};

/// サービスプロバイダートレイト
pub trait ServiceProvider: Send + Sync {
    /// プロバイダー名（重複登録の判定に使用）
    fn name(&self) -> &str;

    /// コンテナにバインディングを登録
    fn register(&self, container: &mut Container, config: &Config) -> Result<()>;

    /// 全プロバイダーの登録後に一度だけ呼ばれる
    fn boot(&self, _container: &Container) -> Result<()> {
        Ok(())
    }
}

/// OLLAMAクライアントを `dyn OllamaApi` のシングルトンとして登録する
#[derive(Debug, Clone, Copy, Default)]
pub struct OllamaServiceProvider;

impl ServiceProvider for OllamaServiceProvider {
    fn name(&self) -> &str {
        "OllamaServiceProvider"
    }

    fn register(&self, container: &mut Container, _config: &Config) -> Result<()> {
        // 設定は生成時にコンテナから解決するため、後から差し替えた設定も反映される
        container.singleton_type::<dyn OllamaApi, _>(|c| {
            let config = c.make::<Config>()?;
            let client = OllamaClient::from_config(&config.ollama);
            tracing::info!(
                url = %config.ollama.url,
                model = %config.ollama.model,
                "OLLAMA client created"
            );
            Ok(Arc::new(client) as Arc<dyn OllamaApi>)
        });
        Ok(())
    }
}
