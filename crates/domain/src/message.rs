//! 聊天消息实体定义

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

/// 消息内容长度上限
const MAX_CONTENT_LENGTH: usize = 5000;

/// 发送者的展示信息
///
/// 读取消息时由存储层联表补全，推送给客户端用于渲染。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// 聊天消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: Timestamp,
    /// 发送者展示信息（写入时为空，读取时补全）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderProfile>,
}

impl ChatMessage {
    /// 创建新消息，内容为空或超长时拒绝
    pub fn new(
        chat_id: ChatId,
        sender_id: UserId,
        content: impl Into<String>,
        sent_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(DomainError::validation_error("content", "内容不能为空"));
        }
        if content.len() > MAX_CONTENT_LENGTH {
            return Err(DomainError::validation_error("content", "内容超过长度上限"));
        }

        Ok(Self {
            id: MessageId::random(),
            chat_id,
            sender_id,
            content,
            sent_at,
            sender: None,
        })
    }

    /// 补全发送者展示信息
    pub fn with_sender(mut self, sender: SenderProfile) -> Self {
        self.sender = Some(sender);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn rejects_empty_content() {
        let err = ChatMessage::new(ChatId::random(), UserId::random(), "   ", Utc::now());
        assert!(err.is_err());
    }

    #[test]
    fn rejects_oversized_content() {
        let content = "a".repeat(MAX_CONTENT_LENGTH + 1);
        let err = ChatMessage::new(ChatId::random(), UserId::random(), content, Utc::now());
        assert!(err.is_err());
    }

    #[test]
    fn serializes_without_empty_sender() {
        let message =
            ChatMessage::new(ChatId::random(), UserId::random(), "hello", Utc::now()).unwrap();
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("sender").is_none());
    }
}
