use thiserror::Error;

/// コンテナ解決時のエラー
#[derive(Debug, Error)]
pub enum ContainerError {
    /// キーに対するバインディングが登録されていない
    #[error("no binding registered for `{key}`")]
    BindingNotFound { key: String },

    /// 登録済みの値が要求された型と一致しない
    #[error("binding `{key}` does not hold a `{expected}`")]
    TypeMismatch { key: String, expected: &'static str },

    /// 解決中のキーをファクトリが再び要求した（A→B→A など）
    #[error("circular dependency detected while resolving `{key}`")]
    CircularDependency { key: String },

    /// ファクトリがインスタンスの生成に失敗した
    #[error("failed to build `{key}`: {source}")]
    Factory {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ContainerError {
    /// エラー対象のキー
    pub fn key(&self) -> &str {
        match self {
            ContainerError::BindingNotFound { key }
            | ContainerError::TypeMismatch { key, .. }
            | ContainerError::CircularDependency { key }
            | ContainerError::Factory { key, .. } => key,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::BindingNotFound { .. })
    }

    /// 循環依存が原因かどうか（ファクトリエラーの内側も辿る）
    pub fn is_circular(&self) -> bool {
        match self {
            ContainerError::CircularDependency { .. } => true,
            ContainerError::Factory { source, .. } => source
                .downcast_ref::<ContainerError>()
                .map(ContainerError::is_circular)
                .unwrap_or(false),
            _ => false,
        }
    }
}
