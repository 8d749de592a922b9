//! 持久化协作方的窄接口
//!
//! 中枢不拥有任何持久化逻辑：消息、参与者名单、通知、群组成员都由
//! 外部存储实现这些 trait。接口刻意收窄到中枢真正用到的查询。

use async_trait::async_trait;

use domain::{
    ChatId, ChatKind, ChatMessage, GroupId, MessageId, Notification, RepositoryResult, Timestamp,
    UserId,
};

/// 消息存储
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 保存消息，要求立即持久化
    async fn save_message(&self, message: &ChatMessage) -> RepositoryResult<()>;

    /// 按ID读取消息（带发送者展示信息）
    async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<ChatMessage>>;

    /// 分页读取聊天消息，按发送时间倒序返回
    async fn chat_messages(
        &self,
        chat_id: ChatId,
        before: Option<Timestamp>,
        limit: u32,
    ) -> RepositoryResult<Vec<ChatMessage>>;
}

/// 聊天与参与者存储
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// 用户参与的全部聊天ID
    async fn user_chat_ids(&self, user_id: UserId) -> RepositoryResult<Vec<ChatId>>;

    /// 聊天的全部持久化参与者
    async fn chat_participants(&self, chat_id: ChatId) -> RepositoryResult<Vec<UserId>>;

    /// 用户是否为聊天参与者
    async fn is_participant(&self, chat_id: ChatId, user_id: UserId) -> RepositoryResult<bool>;

    /// 聊天类型（私聊/群聊）
    async fn chat_kind(&self, chat_id: ChatId) -> RepositoryResult<ChatKind>;
}

/// 通知存储
///
/// REST 层在调用分发器之前也走同一个接口落库；中枢只在消息路由路径
/// 上为离线参与者补写 `new_message` 通知。
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, notification: &Notification) -> RepositoryResult<()>;
}

/// 群组成员存储
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn group_members(&self, group_id: GroupId) -> RepositoryResult<Vec<UserId>>;
}

/// 内存实现（用于测试和单机嵌入）
pub mod memory {
    use super::*;
    use domain::SenderProfile;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::RwLock;

    /// 内存消息存储
    ///
    /// 读取时用注册的用户资料补全发送者信息，模拟存储层的联表查询。
    #[derive(Default)]
    pub struct MemoryMessageStore {
        messages: RwLock<Vec<ChatMessage>>,
        profiles: RwLock<HashMap<UserId, SenderProfile>>,
        fail_next_save: AtomicBool,
    }

    impl MemoryMessageStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// 注册发送者展示资料
        pub async fn set_profile(&self, user_id: UserId, profile: SenderProfile) {
            let mut profiles = self.profiles.write().await;
            profiles.insert(user_id, profile);
        }

        /// 让下一次保存失败（测试持久化故障路径）
        pub fn fail_next_save(&self) {
            self.fail_next_save.store(true, Ordering::SeqCst);
        }

        pub async fn message_count(&self) -> usize {
            self.messages.read().await.len()
        }

        async fn enrich(&self, mut message: ChatMessage) -> ChatMessage {
            let profiles = self.profiles.read().await;
            if let Some(profile) = profiles.get(&message.sender_id) {
                message.sender = Some(profile.clone());
            }
            message
        }
    }

    #[async_trait]
    impl MessageStore for MemoryMessageStore {
        async fn save_message(&self, message: &ChatMessage) -> RepositoryResult<()> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(domain::RepositoryError::storage("injected save failure"));
            }
            let mut messages = self.messages.write().await;
            messages.push(message.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<ChatMessage>> {
            let found = {
                let messages = self.messages.read().await;
                messages.iter().find(|m| m.id == id).cloned()
            };
            match found {
                Some(message) => Ok(Some(self.enrich(message).await)),
                None => Ok(None),
            }
        }

        async fn chat_messages(
            &self,
            chat_id: ChatId,
            before: Option<Timestamp>,
            limit: u32,
        ) -> RepositoryResult<Vec<ChatMessage>> {
            let mut page: Vec<ChatMessage> = {
                let messages = self.messages.read().await;
                messages
                    .iter()
                    .filter(|m| m.chat_id == chat_id)
                    .filter(|m| before.map(|cursor| m.sent_at < cursor).unwrap_or(true))
                    .cloned()
                    .collect()
            };
            // 按发送时间倒序，和 SQL 实现的 ORDER BY sent_at DESC 一致
            page.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
            page.truncate(limit as usize);

            let mut enriched = Vec::with_capacity(page.len());
            for message in page {
                enriched.push(self.enrich(message).await);
            }
            Ok(enriched)
        }
    }

    /// 内存聊天存储
    #[derive(Default)]
    pub struct MemoryChatStore {
        chats: RwLock<HashMap<ChatId, (ChatKind, Vec<UserId>)>>,
    }

    impl MemoryChatStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// 建一个聊天并登记参与者
        pub async fn add_chat(&self, chat_id: ChatId, kind: ChatKind, participants: Vec<UserId>) {
            let mut chats = self.chats.write().await;
            chats.insert(chat_id, (kind, participants));
        }

        pub async fn add_participant(&self, chat_id: ChatId, user_id: UserId) {
            let mut chats = self.chats.write().await;
            if let Some((_, participants)) = chats.get_mut(&chat_id) {
                if !participants.contains(&user_id) {
                    participants.push(user_id);
                }
            }
        }

        pub async fn remove_participant(&self, chat_id: ChatId, user_id: UserId) {
            let mut chats = self.chats.write().await;
            if let Some((_, participants)) = chats.get_mut(&chat_id) {
                participants.retain(|id| *id != user_id);
            }
        }
    }

    #[async_trait]
    impl ChatStore for MemoryChatStore {
        async fn user_chat_ids(&self, user_id: UserId) -> RepositoryResult<Vec<ChatId>> {
            let chats = self.chats.read().await;
            Ok(chats
                .iter()
                .filter(|(_, (_, participants))| participants.contains(&user_id))
                .map(|(chat_id, _)| *chat_id)
                .collect())
        }

        async fn chat_participants(&self, chat_id: ChatId) -> RepositoryResult<Vec<UserId>> {
            let chats = self.chats.read().await;
            match chats.get(&chat_id) {
                Some((_, participants)) => Ok(participants.clone()),
                None => Err(domain::RepositoryError::NotFound),
            }
        }

        async fn is_participant(&self, chat_id: ChatId, user_id: UserId) -> RepositoryResult<bool> {
            let chats = self.chats.read().await;
            Ok(chats
                .get(&chat_id)
                .map(|(_, participants)| participants.contains(&user_id))
                .unwrap_or(false))
        }

        async fn chat_kind(&self, chat_id: ChatId) -> RepositoryResult<ChatKind> {
            let chats = self.chats.read().await;
            chats
                .get(&chat_id)
                .map(|(kind, _)| *kind)
                .ok_or(domain::RepositoryError::NotFound)
        }
    }

    /// 内存通知存储
    #[derive(Default)]
    pub struct MemoryNotificationStore {
        notifications: RwLock<Vec<Notification>>,
    }

    impl MemoryNotificationStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn for_user(&self, user_id: UserId) -> Vec<Notification> {
            let notifications = self.notifications.read().await;
            notifications
                .iter()
                .filter(|n| n.user_id == user_id)
                .cloned()
                .collect()
        }

        pub async fn count(&self) -> usize {
            self.notifications.read().await.len()
        }
    }

    #[async_trait]
    impl NotificationStore for MemoryNotificationStore {
        async fn create(&self, notification: &Notification) -> RepositoryResult<()> {
            let mut notifications = self.notifications.write().await;
            notifications.push(notification.clone());
            Ok(())
        }
    }

    /// 内存群组存储
    #[derive(Default)]
    pub struct MemoryGroupStore {
        groups: RwLock<HashMap<GroupId, Vec<UserId>>>,
    }

    impl MemoryGroupStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_members(&self, group_id: GroupId, members: Vec<UserId>) {
            let mut groups = self.groups.write().await;
            groups.insert(group_id, members);
        }
    }

    #[async_trait]
    impl GroupStore for MemoryGroupStore {
        async fn group_members(&self, group_id: GroupId) -> RepositoryResult<Vec<UserId>> {
            let groups = self.groups.read().await;
            match groups.get(&group_id) {
                Some(members) => Ok(members.clone()),
                None => Err(domain::RepositoryError::NotFound),
            }
        }
    }
}
