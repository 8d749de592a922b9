//! 入站帧路由
//!
//! 核心循环逐条取出入站信封并在这里分发：新消息走"校验→落库→确认→
//! 广播→补离线通知"，历史请求只回给请求者本人。单一共享入站队列
//! 给出跨聊天的全序，自然蕴含每个聊天内的先后顺序。
//!
//! 失败语义：越权和持久化失败都只丢弃当前帧并记日志，连接保持打开；
//! 发送者通过确认帧得知自己的消息是落库了还是失败了。

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, warn};

use domain::{ChatId, ChatMessage, MessageId, Notification, NotificationKind, Timestamp, UserId};

use crate::envelope::{AckStatus, ClientFrame, InboundEnvelope, PushFrame};
use crate::hub::Hub;

impl Hub {
    /// 按帧类型路由一条入站信封
    pub(crate) async fn handle_inbound(&self, envelope: InboundEnvelope) {
        match envelope.frame {
            ClientFrame::Message {
                chat_id,
                content,
                client_tag,
            } => {
                self.handle_new_message(envelope.sender_id, chat_id, content, client_tag)
                    .await;
            }
            ClientFrame::HistoryRequest {
                chat_id,
                before,
                limit,
            } => {
                self.handle_history_request(envelope.sender_id, chat_id, before, limit)
                    .await;
            }
        }
    }

    /// 成员资格校验：优先查内存聊天室，聊天室未加载时回退存储
    async fn verify_membership(&self, chat_id: ChatId, user_id: UserId) -> bool {
        let cached = self
            .room_info(chat_id)
            .await
            .map(|room| room.members.contains(&user_id));
        match cached {
            Some(is_member) => is_member,
            None => match self.deps.chat_store.is_participant(chat_id, user_id).await {
                Ok(is_member) => is_member,
                Err(err) => {
                    error!(chat_id = %chat_id, user_id = %user_id, error = %err, "成员资格查询失败");
                    false
                }
            },
        }
    }

    async fn handle_new_message(
        &self,
        sender_id: UserId,
        chat_id: ChatId,
        content: String,
        client_tag: Option<String>,
    ) {
        if !self.verify_membership(chat_id, sender_id).await {
            warn!(user_id = %sender_id, chat_id = %chat_id, "发送者不是聊天参与者，丢弃消息");
            return;
        }

        let message = match ChatMessage::new(chat_id, sender_id, content, Utc::now()) {
            Ok(message) => message,
            Err(err) => {
                warn!(user_id = %sender_id, chat_id = %chat_id, error = %err, "消息内容非法，丢弃");
                self.ack_sender(sender_id, chat_id, None, client_tag, AckStatus::Failed)
                    .await;
                return;
            }
        };

        if let Err(err) = self.deps.message_store.save_message(&message).await {
            error!(chat_id = %chat_id, error = %err, "消息保存失败，不广播");
            self.ack_sender(sender_id, chat_id, None, client_tag, AckStatus::Failed)
                .await;
            return;
        }

        // 回读补全后的记录（带发送者展示信息）；回读失败就退回原始记录
        let enriched = match self.deps.message_store.find_by_id(message.id).await {
            Ok(Some(enriched)) => enriched,
            Ok(None) => {
                warn!(message_id = %message.id, "刚保存的消息读不到，按原始记录广播");
                message.clone()
            }
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "消息回读失败，按原始记录广播");
                message.clone()
            }
        };

        self.ack_sender(
            sender_id,
            chat_id,
            Some(message.id),
            client_tag,
            AckStatus::Persisted,
        )
        .await;

        self.broadcast(
            chat_id,
            PushFrame::NewMessage {
                chat_id,
                data: enriched,
            },
            Some(sender_id),
        )
        .await;

        self.messages_routed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.notify_offline_capable_participants(chat_id, sender_id, message.id)
            .await;
    }

    /// 给聊天的其他持久化参与者（不限在线）落一条 new_message 通知，
    /// 再尽力实时推送；离线用户因此不丢消息提醒。
    async fn notify_offline_capable_participants(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        message_id: MessageId,
    ) {
        let participants = match self.deps.chat_store.chat_participants(chat_id).await {
            Ok(participants) => participants,
            Err(err) => {
                error!(chat_id = %chat_id, error = %err, "读取聊天参与者失败，跳过消息通知");
                return;
            }
        };

        for participant in participants {
            if participant == sender_id {
                continue;
            }

            let notification = Notification::new(
                participant,
                NotificationKind::NewMessage,
                message_id.to_string(),
                Utc::now(),
            )
            .with_actor(sender_id);

            if let Err(err) = self.deps.notification_store.create(&notification).await {
                error!(user_id = %participant, error = %err, "消息通知落库失败");
                continue;
            }

            let extra = json!({
                "chat_id": chat_id,
                "message_id": message_id,
            });
            self.push_notification(participant, notification, Some(extra))
                .await;
        }
    }

    async fn handle_history_request(
        &self,
        sender_id: UserId,
        chat_id: ChatId,
        before: Option<Timestamp>,
        limit: Option<u32>,
    ) {
        if !self.verify_membership(chat_id, sender_id).await {
            warn!(user_id = %sender_id, chat_id = %chat_id, "请求者不是聊天参与者，丢弃历史请求");
            return;
        }

        let limit = limit
            .unwrap_or(self.config.history_page_size)
            .clamp(1, self.config.history_page_max);

        let mut page = match self
            .deps
            .message_store
            .chat_messages(chat_id, before, limit)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                error!(chat_id = %chat_id, error = %err, "读取历史消息失败");
                return;
            }
        };
        // 存储按时间倒序返回，交付给客户端时按从旧到新
        page.reverse();

        let Some(connection) = self.user_connection(sender_id).await else {
            debug!(user_id = %sender_id, "请求者已断开，丢弃历史分页");
            return;
        };
        if !connection.enqueue(PushFrame::HistoryResponse {
            chat_id,
            data: page,
        }) {
            warn!(user_id = %sender_id, chat_id = %chat_id, "历史分页入队失败");
        }
    }

    /// 只发给发送者本人的逐条确认帧
    async fn ack_sender(
        &self,
        sender_id: UserId,
        chat_id: ChatId,
        message_id: Option<MessageId>,
        client_tag: Option<String>,
        status: AckStatus,
    ) {
        let Some(connection) = self.user_connection(sender_id).await else {
            return;
        };
        connection.enqueue(PushFrame::MessageAck {
            chat_id,
            message_id,
            client_tag,
            status,
        });
    }
}
