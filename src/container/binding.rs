use std::any::Any;
use std::sync::{Arc, Mutex};

use super::Container;

/// 型消去された共有インスタンス（中身は `Arc<T>`）
pub(crate) type Shared = Arc<dyn Any + Send + Sync>;

/// 型消去されたファクトリ
pub(crate) type Factory = Arc<dyn Fn(&Container) -> anyhow::Result<Shared> + Send + Sync>;

/// バインディングの寿命
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// 登録済みのインスタンスをそのまま返す
    Instance,
    /// 初回解決時に一度だけ生成し、以後同じインスタンスを返す
    Singleton,
    /// 解決のたびに新しいインスタンスを生成する
    Transient,
}

/// コンテナのエントリ
pub(crate) enum Binding {
    Instance(Shared),
    Singleton {
        factory: Factory,
        resolved: Mutex<Option<Shared>>,
    },
    Transient(Factory),
}

impl Binding {
    pub(crate) fn instance<T>(value: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Binding::Instance(Arc::new(value))
    }

    pub(crate) fn singleton(factory: Factory) -> Self {
        Binding::Singleton {
            factory,
            resolved: Mutex::new(None),
        }
    }

    pub(crate) fn transient(factory: Factory) -> Self {
        Binding::Transient(factory)
    }

    pub(crate) fn lifetime(&self) -> Lifetime {
        match self {
            Binding::Instance(_) => Lifetime::Instance,
            Binding::Singleton { .. } => Lifetime::Singleton,
            Binding::Transient(_) => Lifetime::Transient,
        }
    }

    /// シングルトンが生成済み、またはインスタンス登録かどうか
    pub(crate) fn is_resolved(&self) -> bool {
        match self {
            Binding::Instance(_) => true,
            Binding::Singleton { resolved, .. } => resolved
                .lock()
                .map(|slot| slot.is_some())
                .unwrap_or(false),
            Binding::Transient(_) => false,
        }
    }

    /// インスタンスを取得（必要であれば生成）
    ///
    /// シングルトンの生成中はロックを保持するため、同じキーは一度しか生成されない。
    /// 自己参照するファクトリは `Container::resolve` 側で先に検出される。
    pub(crate) fn resolve(&self, container: &Container) -> anyhow::Result<Shared> {
        match self {
            Binding::Instance(value) => Ok(Arc::clone(value)),
            Binding::Transient(factory) => factory(container),
            Binding::Singleton { factory, resolved } => {
                let mut slot = resolved.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(value) = slot.as_ref() {
                    return Ok(Arc::clone(value));
                }
                let value = factory(container)?;
                *slot = Some(Arc::clone(&value));
                Ok(value)
            }
        }
    }
}

/// 型付きファクトリを型消去する
pub(crate) fn erase<T, F>(factory: F) -> Factory
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
{
    Arc::new(move |container: &Container| {
        let value = factory(container)?;
        Ok(Arc::new(value) as Shared)
    })
}
