//! テストハーネス
//!
//! テストケースごとに新しい `Application` を組み立て、パッケージの
//! サービスプロバイダーを登録し、テスト環境用の設定を適用する。
//! ストレージは使い捨ての一時ディレクトリを指すため、実データには触れない。

mod fake;

pub use fake::{FakeOllama, RecordedCall};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use crate::app::Application;
use crate::config::Config;
use crate::facade::Ollama;
use crate::llm::OllamaApi;
use crate::provider::{OllamaServiceProvider, ServiceProvider};

/// テストケース - 独立したアプリケーションコンテキスト
pub struct TestCase {
    app: Application,
    storage: TempDir,
}

impl TestCase {
    /// デフォルト構成でアプリケーションを起動
    pub fn set_up() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> TestCaseBuilder {
        TestCaseBuilder::default()
    }

    /// パッケージが提供するサービスプロバイダー
    pub fn package_providers() -> Vec<Arc<dyn ServiceProvider>> {
        vec![Arc::new(OllamaServiceProvider)]
    }

    /// テスト環境用の設定を適用
    fn environment_set_up(config: &mut Config, storage: &Path) -> Result<()> {
        config.set("app.env", "testing")?;
        config.set("database.default", "testing")?;
        config.database.storage_path = Some(storage.to_path_buf());
        Ok(())
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut Application {
        &mut self.app
    }

    /// 使い捨てストレージのパス
    pub fn storage_path(&self) -> &Path {
        self.storage.path()
    }

    /// OLLAMAファサードを解決
    pub fn ollama(&self) -> Result<Ollama> {
        Ok(self.app.facade::<Ollama>()?)
    }

    /// ファサードの転送先をフェイクに差し替え、フェイクを返す
    pub fn fake_ollama(&mut self, fake: FakeOllama) -> Arc<FakeOllama> {
        let fake = Arc::new(fake);
        let root: Arc<dyn OllamaApi> = fake.clone();
        self.app.swap::<Ollama>(root);
        fake
    }

    /// コンテキストを破棄（一時ディレクトリも削除される）
    pub fn tear_down(self) {
        tracing::debug!(storage = %self.storage.path().display(), "Tearing down test case");
    }
}

/// テストケースの構成
pub struct TestCaseBuilder {
    config: Config,
    overrides: Vec<(String, String)>,
    providers: Vec<Arc<dyn ServiceProvider>>,
    with_package_providers: bool,
}

impl Default for TestCaseBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            overrides: Vec::new(),
            providers: Vec::new(),
            with_package_providers: true,
        }
    }
}

impl TestCaseBuilder {
    /// ベースとなる設定
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// テスト環境設定の後に適用する上書き
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// 追加のサービスプロバイダー
    pub fn provider<P: ServiceProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// パッケージのプロバイダーを登録しない
    pub fn without_package_providers(mut self) -> Self {
        self.with_package_providers = false;
        self
    }

    pub fn build(self) -> Result<TestCase> {
        let storage = tempfile::tempdir().context("Failed to create test storage")?;

        let mut config = self.config;
        TestCase::environment_set_up(&mut config, storage.path())?;
        for (key, value) in &self.overrides {
            config.set(key, value)?;
        }

        let mut app = Application::new(config);
        if self.with_package_providers {
            for provider in TestCase::package_providers() {
                app.register_arc(provider)?;
            }
        }
        for provider in self.providers {
            app.register_arc(provider)?;
        }
        app.boot()?;

        Ok(TestCase { app, storage })
    }
}
