use domain::{DomainError, RepositoryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    /// 中枢事件循环已经退出，注册通道关闭
    #[error("中枢已停止")]
    Shutdown,
}
