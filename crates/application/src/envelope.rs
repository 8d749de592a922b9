//! 连接上流动的信封类型
//!
//! 入站帧来自客户端（发消息、拉历史），出站帧由中枢推送（新消息、
//! 历史分页、通知、确认）。两个方向都用内部标签的 JSON 表示，标签
//! 集合与存量客户端保持兼容。

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use domain::{ChatId, ChatMessage, MessageId, Notification, Timestamp, UserId};

/// 客户端发来的入站帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 新聊天消息
    Message {
        chat_id: ChatId,
        content: String,
        /// 客户端的关联标记，会在确认帧里原样带回
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_tag: Option<String>,
    },
    /// 拉取历史消息
    HistoryRequest {
        chat_id: ChatId,
        /// 只取该时间之前的消息（分页游标）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<Timestamp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
}

/// 读循环盖上发送者身份后交给中枢的入站信封
///
/// 发送者以连接的认证身份为准，客户端自报的字段一律不信。
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub sender_id: UserId,
    pub frame: ClientFrame,
}

/// 消息确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Persisted,
    Failed,
}

/// 实时通知信封：持久化好的通知行加上渲染用的附加数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub notification: Notification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonValue>,
}

/// 中枢推送给客户端的出站帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    /// 聊天室里的新消息（不回显给发送者）
    NewMessage { chat_id: ChatId, data: ChatMessage },
    /// 历史分页，按从旧到新排列
    HistoryResponse {
        chat_id: ChatId,
        data: Vec<ChatMessage>,
    },
    /// 实时通知推送
    Notification { data: NotificationEnvelope },
    /// 对发送者的逐条确认，让客户端能区分"已落库"和"静默失败"
    MessageAck {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_tag: Option<String>,
        status: AckStatus,
    },
    /// REST 层把人拉进聊天后的房间广播
    ParticipantAdded {
        chat_id: ChatId,
        user_id: UserId,
        added_by: UserId,
    },
}
