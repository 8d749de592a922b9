//! 聊天实体定义

use serde::{Deserialize, Serialize};

use crate::value_objects::{ChatId, Timestamp};

/// 聊天类型
///
/// 私聊由关注关系触发创建，群聊挂在一个群组下面。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "direct",
            ChatKind::Group => "group",
        }
    }
}

impl std::fmt::Display for ChatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 聊天实体
///
/// 中枢只关心类型和标识；参与者名单的权威来源在持久化协作方。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub created_at: Timestamp,
}

impl Chat {
    pub fn new(id: ChatId, kind: ChatKind, created_at: Timestamp) -> Self {
        Self {
            id,
            kind,
            created_at,
        }
    }
}
