//! 领域模型错误定义
//!
//! 定义了实时中枢涉及的错误类型，提供清晰的错误上下文。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 消息相关错误
    #[error("消息错误: {message}")]
    MessageError { message: String },

    /// 聊天相关错误
    #[error("聊天错误: {message}")]
    ChatError { message: String },

    /// 通知相关错误
    #[error("通知错误: {message}")]
    NotificationError { message: String },

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// 权限错误
    #[error("权限不足: {action}")]
    PermissionDenied { action: String },
}

impl DomainError {
    /// 创建消息错误
    pub fn message_error(message: impl Into<String>) -> Self {
        Self::MessageError {
            message: message.into(),
        }
    }

    /// 创建聊天错误
    pub fn chat_error(message: impl Into<String>) -> Self {
        Self::ChatError {
            message: message.into(),
        }
    }

    /// 创建通知错误
    pub fn notification_error(message: impl Into<String>) -> Self {
        Self::NotificationError {
            message: message.into(),
        }
    }

    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建权限错误
    pub fn permission_denied(action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            action: action.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 持久化协作方返回的错误类型
///
/// 中枢自身不做持久化，所有存储访问都通过窄接口交给协作方，
/// 这里只区分"记录不存在"与其余存储故障。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    /// 记录不存在
    #[error("记录不存在")]
    NotFound,

    /// 存储访问失败
    #[error("存储访问失败: {0}")]
    Storage(String),
}

impl RepositoryError {
    /// 创建存储访问错误
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

/// 持久化操作结果类型
pub type RepositoryResult<T> = Result<T, RepositoryError>;
