//! 通知实体定义
//!
//! 通知由 REST 层各业务流程（关注、点赞、评论、邀请、活动）产生并先行
//! 持久化，实时中枢只负责尽力推送，不生产通知内容。

use serde::{Deserialize, Serialize};

use crate::value_objects::{NotificationId, Timestamp, UserId};

/// 通知类型
///
/// 封闭集合，和存储层的约束保持一致。实时推送帧的 `new_message` 标签
/// 与这里的 `NewMessage` 是两套税目，互不混用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewFollower,
    FollowRequest,
    NewLike,
    NewComment,
    NewMessage,
    GroupInvite,
    GroupJoinRequest,
    GroupJoinResponse,
    GroupInvitationResponse,
    EventCreated,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewFollower => "new_follower",
            NotificationKind::FollowRequest => "follow_request",
            NotificationKind::NewLike => "new_like",
            NotificationKind::NewComment => "new_comment",
            NotificationKind::NewMessage => "new_message",
            NotificationKind::GroupInvite => "group_invite",
            NotificationKind::GroupJoinRequest => "group_join_request",
            NotificationKind::GroupJoinResponse => "group_join_response",
            NotificationKind::GroupInvitationResponse => "group_invitation_response",
            NotificationKind::EventCreated => "event_created",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通知实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// 通知ID
    pub id: NotificationId,
    /// 接收者ID
    pub user_id: UserId,
    /// 通知类型
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// 被引用实体的ID（帖子、用户、群组、消息等）
    pub reference_id: String,
    /// 触发者ID（系统通知为空）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<UserId>,
    /// 是否已读
    pub is_read: bool,
    /// 创建时间
    pub created_at: Timestamp,
}

impl Notification {
    /// 创建新通知
    pub fn new(
        user_id: UserId,
        kind: NotificationKind,
        reference_id: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: NotificationId::random(),
            user_id,
            kind,
            reference_id: reference_id.into(),
            actor_id: None,
            is_read: false,
            created_at,
        }
    }

    /// 设置触发者
    pub fn with_actor(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// 标记为已读
    pub fn mark_as_read(&mut self) {
        self.is_read = true;
    }
}
