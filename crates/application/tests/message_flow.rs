//! 消息路由：落库、确认、广播、历史分页、失败路径

mod support;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use application::MessageStore;
use domain::{ChatId, ChatKind, ChatMessage, MessageId, SenderProfile, UserId};
use support::*;

/// 发消息：落库一条、发送者收确认、对端收 new_message、发送者不回显
#[tokio::test]
async fn message_is_persisted_acked_and_broadcast() {
    let backend = start_hub();
    let (u1, u2) = (UserId::random(), UserId::random());
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Direct, vec![u1, u2])
        .await;
    backend
        .message_store
        .set_profile(
            u1,
            SenderProfile {
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                avatar_url: None,
            },
        )
        .await;

    let mut peer1 = connect(&backend.hub, u1).await;
    let mut peer2 = connect(&backend.hub, u2).await;

    send_json(
        &peer1,
        json!({"type": "message", "chat_id": c1, "content": "hi", "client_tag": "t1"}),
    )
    .await;

    // 发送者只拿到确认帧
    let ack = recv_push(&mut peer1).await;
    assert_eq!(ack["type"], "message_ack");
    assert_eq!(ack["status"], "persisted");
    assert_eq!(ack["client_tag"], "t1");
    let message_id: MessageId = serde_json::from_value(ack["message_id"].clone()).unwrap();

    // 对端拿到补全过发送者信息的 new_message
    let push = recv_push(&mut peer2).await;
    assert_eq!(push["type"], "new_message");
    assert_eq!(push["chat_id"], json!(c1));
    assert_eq!(push["data"]["content"], "hi");
    assert_eq!(push["data"]["sender_id"], json!(u1));
    assert_eq!(push["data"]["sender"]["first_name"], "Ada");

    // 落库的就是广播的那条
    let stored = backend
        .message_store
        .find_by_id(message_id)
        .await
        .unwrap()
        .expect("message persisted");
    assert_eq!(stored.content, "hi");
    assert_eq!(stored.chat_id, c1);
    assert_eq!(stored.sender_id, u1);

    // 发送者的队列里没有自己消息的广播副本
    assert_no_push(&mut peer1).await;
}

/// 消息广播之外，其他参与者各得一条 new_message 持久化通知
#[tokio::test]
async fn other_participants_get_durable_message_notification() {
    let backend = start_hub();
    let (u1, u2, u3) = (UserId::random(), UserId::random(), UserId::random());
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Group, vec![u1, u2, u3])
        .await;

    let peer1 = connect(&backend.hub, u1).await;
    let mut peer2 = connect(&backend.hub, u2).await;
    // u3 不在线

    send_json(
        &peer1,
        json!({"type": "message", "chat_id": c1, "content": "hello all"}),
    )
    .await;

    // u2 先收广播，再收通知推送
    let push = recv_push(&mut peer2).await;
    assert_eq!(push["type"], "new_message");
    let notification = recv_push(&mut peer2).await;
    assert_eq!(notification["type"], "notification");
    assert_eq!(
        notification["data"]["notification"]["type"],
        "new_message"
    );
    assert_eq!(notification["data"]["extra"]["chat_id"], json!(c1));

    // 离线的 u3 也有一条持久化通知行
    let for_u3 = backend.notification_store.for_user(u3).await;
    assert_eq!(for_u3.len(), 1);
    assert_eq!(for_u3[0].kind, domain::NotificationKind::NewMessage);
    assert_eq!(for_u3[0].actor_id, Some(u1));

    // 发送者自己没有通知行
    assert!(backend.notification_store.for_user(u1).await.is_empty());
}

/// 非参与者的消息被丢弃：不落库、不广播、连接保持
#[tokio::test]
async fn message_from_non_participant_is_dropped() {
    let backend = start_hub();
    let (u1, u2, outsider) = (UserId::random(), UserId::random(), UserId::random());
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Direct, vec![u1, u2])
        .await;

    let mut peer1 = connect(&backend.hub, u1).await;
    let mut outsider_peer = connect(&backend.hub, outsider).await;

    send_json(
        &outsider_peer,
        json!({"type": "message", "chat_id": c1, "content": "let me in"}),
    )
    .await;

    assert_no_push(&mut peer1).await;
    assert_eq!(backend.message_store.message_count().await, 0);

    // 连接没有被断开，后续帧仍然处理
    assert!(backend.hub.is_user_online(outsider).await);
    assert_no_push(&mut outsider_peer).await;
}

/// 持久化失败：发送者收 failed 确认，无广播、无通知
#[tokio::test]
async fn persistence_failure_sends_failed_ack_and_skips_broadcast() {
    let backend = start_hub();
    let (u1, u2) = (UserId::random(), UserId::random());
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Direct, vec![u1, u2])
        .await;

    let mut peer1 = connect(&backend.hub, u1).await;
    let mut peer2 = connect(&backend.hub, u2).await;

    backend.message_store.fail_next_save();
    send_json(
        &peer1,
        json!({"type": "message", "chat_id": c1, "content": "doomed", "client_tag": "t9"}),
    )
    .await;

    let ack = recv_push(&mut peer1).await;
    assert_eq!(ack["type"], "message_ack");
    assert_eq!(ack["status"], "failed");
    assert_eq!(ack["client_tag"], "t9");
    assert!(ack.get("message_id").is_none());

    assert_no_push(&mut peer2).await;
    assert_eq!(backend.message_store.message_count().await, 0);
    assert_eq!(backend.notification_store.count().await, 0);

    // 失败后连接还活着，再发一条能成功
    send_json(
        &peer1,
        json!({"type": "message", "chat_id": c1, "content": "retry"}),
    )
    .await;
    let ack = recv_push(&mut peer1).await;
    assert_eq!(ack["status"], "persisted");
}

/// 聊天室未加载时回退存储做成员校验：消息仍然落库并产生通知
#[tokio::test]
async fn membership_falls_back_to_store_when_room_not_loaded() {
    let backend = start_hub();
    let (u1, u2) = (UserId::random(), UserId::random());
    let mut peer1 = connect(&backend.hub, u1).await;

    // 聊天在 u1 上线之后才建，聊天室从未初始化
    let c9 = ChatId::random();
    backend
        .chat_store
        .add_chat(c9, ChatKind::Direct, vec![u1, u2])
        .await;

    send_json(
        &peer1,
        json!({"type": "message", "chat_id": c9, "content": "first"}),
    )
    .await;

    let ack = recv_push(&mut peer1).await;
    assert_eq!(ack["status"], "persisted");
    assert_eq!(backend.message_store.message_count().await, 1);
    assert_eq!(backend.notification_store.for_user(u2).await.len(), 1);
}

/// 历史请求：按游标分页，只回给请求者，从旧到新
#[tokio::test]
async fn history_request_pages_and_goes_to_requester_only() {
    let backend = start_hub();
    let (u1, u2) = (UserId::random(), UserId::random());
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Direct, vec![u1, u2])
        .await;

    // 预置五条历史消息
    let base = Utc::now();
    for i in 0..5 {
        let message = ChatMessage::new(
            c1,
            u2,
            format!("m{i}"),
            base + Duration::seconds(i),
        )
        .unwrap();
        backend.message_store.save_message(&message).await.unwrap();
    }

    let mut peer1 = connect(&backend.hub, u1).await;
    let mut peer2 = connect(&backend.hub, u2).await;

    send_json(
        &peer1,
        json!({"type": "history_request", "chat_id": c1, "limit": 3}),
    )
    .await;

    let response = recv_push(&mut peer1).await;
    assert_eq!(response["type"], "history_response");
    assert_eq!(response["chat_id"], json!(c1));
    let data = response["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    // 最新三条，按从旧到新
    assert_eq!(data[0]["content"], "m2");
    assert_eq!(data[2]["content"], "m4");

    // 带游标翻更早的一页
    let cursor = data[0]["sent_at"].clone();
    send_json(
        &peer1,
        json!({"type": "history_request", "chat_id": c1, "before": cursor, "limit": 10}),
    )
    .await;
    let older = recv_push(&mut peer1).await;
    let data = older["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["content"], "m0");
    assert_eq!(data[1]["content"], "m1");

    // 历史分页不广播
    assert_no_push(&mut peer2).await;
}

/// 非参与者的历史请求被丢弃
#[tokio::test]
async fn history_request_requires_membership() {
    let backend = start_hub();
    let outsider = UserId::random();
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Direct, vec![UserId::random(), UserId::random()])
        .await;

    let mut peer = connect(&backend.hub, outsider).await;
    send_json(
        &peer,
        json!({"type": "history_request", "chat_id": c1}),
    )
    .await;

    assert_no_push(&mut peer).await;
}

/// 同一连接串行发送的消息按序广播
#[tokio::test]
async fn messages_broadcast_in_send_order() {
    let backend = start_hub();
    let (u1, u2) = (UserId::random(), UserId::random());
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Direct, vec![u1, u2])
        .await;

    let peer1 = connect(&backend.hub, u1).await;
    let mut peer2 = connect(&backend.hub, u2).await;

    for i in 0..5 {
        send_json(
            &peer1,
            json!({"type": "message", "chat_id": c1, "content": format!("m{i}")}),
        )
        .await;
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let push = recv_push(&mut peer2).await;
        if push["type"] == "new_message" {
            seen.push(push["data"]["content"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);
}

/// 无法解析的入站帧被忽略，连接继续工作
#[tokio::test]
async fn malformed_frames_are_ignored() {
    let backend = start_hub();
    let (u1, u2) = (UserId::random(), UserId::random());
    let c1 = ChatId::random();
    backend
        .chat_store
        .add_chat(c1, ChatKind::Direct, vec![u1, u2])
        .await;

    let mut peer1 = connect(&backend.hub, u1).await;

    peer1
        .send(application::TransportFrame::Data("not json at all".into()))
        .await
        .unwrap();
    send_json(
        &peer1,
        json!({"type": "unknown_kind", "chat_id": Uuid::new_v4()}),
    )
    .await;

    send_json(
        &peer1,
        json!({"type": "message", "chat_id": c1, "content": "still here"}),
    )
    .await;
    let ack = recv_push(&mut peer1).await;
    assert_eq!(ack["status"], "persisted");
}
