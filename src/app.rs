//! アプリケーションコンテキスト
//!
//! 設定・サービスコンテナ・サービスプロバイダーをまとめて所有し、起動処理を行う。
//! 破棄されるとコンテナ上の全インスタンスも破棄される。

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::container::{Container, ContainerError};
use crate::facade::Facade;
use crate::provider::ServiceProvider;

pub struct Application {
    config: Arc<Config>,
    container: Container,
    providers: Vec<Arc<dyn ServiceProvider>>,
    booted: bool,
}

impl Application {
    /// 設定をコンテナに登録した状態でアプリケーションを作成
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let mut container = Container::new();
        container.instance_type(Arc::clone(&config));

        Self {
            config,
            container,
            providers: Vec::new(),
            booted: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 実行環境名
    pub fn environment(&self) -> &str {
        &self.config.app.env
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut Container {
        &mut self.container
    }

    /// サービスプロバイダーを登録
    pub fn register<P>(&mut self, provider: P) -> Result<()>
    where
        P: ServiceProvider + 'static,
    {
        self.register_arc(Arc::new(provider))
    }

    /// 共有済みのサービスプロバイダーを登録
    ///
    /// 同名のプロバイダーは二重に登録しない。起動後に登録された場合は即座に `boot` する。
    pub fn register_arc(&mut self, provider: Arc<dyn ServiceProvider>) -> Result<()> {
        if self.has_provider(provider.name()) {
            tracing::debug!(provider = provider.name(), "Provider already registered");
            return Ok(());
        }

        provider
            .register(&mut self.container, &self.config)
            .with_context(|| format!("Failed to register {}", provider.name()))?;
        tracing::debug!(provider = provider.name(), "Provider registered");

        if self.booted {
            Self::boot_provider(provider.as_ref(), &self.container)?;
        }
        self.providers.push(provider);
        Ok(())
    }

    /// 登録済みの全プロバイダーを起動（2回目以降は何もしない）
    pub fn boot(&mut self) -> Result<()> {
        if self.booted {
            return Ok(());
        }

        for provider in &self.providers {
            Self::boot_provider(provider.as_ref(), &self.container)?;
        }
        self.booted = true;

        tracing::info!(
            env = %self.config.app.env,
            providers = self.providers.len(),
            bindings = self.container.len(),
            "Application booted"
        );
        Ok(())
    }

    fn boot_provider(provider: &dyn ServiceProvider, container: &Container) -> Result<()> {
        provider
            .boot(container)
            .with_context(|| format!("Failed to boot {}", provider.name()))
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.iter().any(|p| p.name() == name)
    }

    /// 登録済みプロバイダー名の一覧（登録順）
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// 型名をキーとしてインスタンスを解決
    pub fn make<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.container.make::<T>()
    }

    /// ファサードを解決
    pub fn facade<F: Facade>(&self) -> Result<F, ContainerError> {
        F::resolve(&self.container)
    }

    /// ファサードの転送先を差し替える（テスト用のフェイクなど）
    pub fn swap<F: Facade>(&mut self, service: Arc<F::Service>) {
        tracing::debug!(key = F::accessor(), "Swapping facade root");
        self.container.instance(F::accessor(), service);
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("env", &self.config.app.env)
            .field("providers", &self.provider_names())
            .field("booted", &self.booted)
            .field("container", &self.container)
            .finish()
    }
}
