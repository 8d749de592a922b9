//! 社交网络实时中枢的核心领域模型
//!
//! 包含聊天、消息、通知等核心实体，以及统一的标识符和错误类型。
//! 持久化与 HTTP 层只通过这些类型和窄接口协作。

pub mod chat;
pub mod errors;
pub mod message;
pub mod notification;
pub mod value_objects;

// 重新导出常用类型
pub use chat::*;
pub use errors::*;
pub use message::*;
pub use notification::*;
pub use value_objects::*;
