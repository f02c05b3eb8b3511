//! サービスコンテナ
//!
//! シンボリックなキー（通常はトレイトオブジェクトの型名）とインスタンスの
//! 対応を保持する。プロセス全体のグローバルではなく、`Application` ごとに
//! 明示的に所有されるため、テストごとに独立したコンテキストを作れる。

mod binding;
mod error;

pub use binding::Lifetime;
pub use error::ContainerError;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use binding::{erase, Binding};

thread_local! {
    /// このスレッドで生成中の (コンテナのアドレス, キー)
    static RESOLVING: RefCell<Vec<(usize, String)>> = const { RefCell::new(Vec::new()) };
}

/// 生成中のキーを記録し、ドロップ時に取り除く
struct ResolvingGuard;

impl ResolvingGuard {
    fn enter(container: &Container, key: &str) -> Result<Self, ContainerError> {
        let id = container as *const Container as usize;
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|(owner, k)| *owner == id && k.as_str() == key) {
                return Err(ContainerError::CircularDependency {
                    key: key.to_string(),
                });
            }
            stack.push((id, key.to_string()));
            Ok(ResolvingGuard)
        })
    }
}

impl Drop for ResolvingGuard {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// 型からコンテナキーを導出
///
/// `key_of::<dyn OllamaApi>()` のようにインターフェースの完全修飾名がキーになる。
pub fn key_of<T: ?Sized>() -> &'static str {
    std::any::type_name::<T>()
}

/// サービスコンテナ - バインディングの登録と解決
#[derive(Default)]
pub struct Container {
    bindings: HashMap<String, Binding>,
}

impl Container {
    /// 空のコンテナを作成
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// 解決のたびに新しいインスタンスを生成するファクトリを登録
    pub fn bind<T, F>(&mut self, key: impl Into<String>, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.insert(key.into(), Binding::transient(erase(factory)));
    }

    /// 初回解決時に一度だけ生成されるシングルトンを登録
    pub fn singleton<T, F>(&mut self, key: impl Into<String>, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.insert(key.into(), Binding::singleton(erase(factory)));
    }

    /// 生成済みのインスタンスを登録（既存のバインディングは置き換えられる）
    pub fn instance<T>(&mut self, key: impl Into<String>, value: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.insert(key.into(), Binding::instance(value));
    }

    /// 型名をキーとして `bind` する
    pub fn bind_type<T, F>(&mut self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.bind(key_of::<T>(), factory);
    }

    /// 型名をキーとして `singleton` を登録する
    pub fn singleton_type<T, F>(&mut self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.singleton(key_of::<T>(), factory);
    }

    /// 型名をキーとして `instance` を登録する
    pub fn instance_type<T>(&mut self, value: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.instance(key_of::<T>(), value);
    }

    /// キーでインスタンスを解決
    ///
    /// ファクトリが生成中の同じキーを要求した場合は `CircularDependency` を返す。
    pub fn resolve<T>(&self, key: &str) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let binding = self
            .bindings
            .get(key)
            .ok_or_else(|| ContainerError::BindingNotFound {
                key: key.to_string(),
            })?;

        let value = {
            let _guard = ResolvingGuard::enter(self, key)?;
            binding
                .resolve(self)
                .map_err(|source| ContainerError::Factory {
                    key: key.to_string(),
                    source,
                })?
        };

        value
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| ContainerError::TypeMismatch {
                key: key.to_string(),
                expected: key_of::<T>(),
            })
    }

    /// 型名をキーとしてインスタンスを解決
    pub fn make<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.resolve::<T>(key_of::<T>())
    }

    /// キーが登録されているかチェック
    pub fn has(&self, key: &str) -> bool {
        self.bindings.contains_key(key)
    }

    /// シングルトンが生成済み（またはインスタンス登録）かどうか
    pub fn is_resolved(&self, key: &str) -> bool {
        self.bindings
            .get(key)
            .map(|binding| binding.is_resolved())
            .unwrap_or(false)
    }

    /// バインディングの寿命を取得
    pub fn lifetime(&self, key: &str) -> Option<Lifetime> {
        self.bindings.get(key).map(|binding| binding.lifetime())
    }

    /// バインディングを削除
    pub fn forget(&mut self, key: &str) -> bool {
        self.bindings.remove(key).is_some()
    }

    /// 登録済みキーの一覧（ソート済み）
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.bindings.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn insert(&mut self, key: String, binding: Binding) {
        let lifetime = binding.lifetime();
        if self.bindings.insert(key.clone(), binding).is_some() {
            tracing::debug!(key = %key, ?lifetime, "Replaced existing binding");
        } else {
            tracing::debug!(key = %key, ?lifetime, "Registered binding");
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("keys", &self.keys())
            .finish()
    }
}
