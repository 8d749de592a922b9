//! 集成测试支撑：内存存储装配 + 双工端点辅助
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use application::store::memory::{
    MemoryChatStore, MemoryGroupStore, MemoryMessageStore, MemoryNotificationStore,
};
use application::transport::duplex::{self, DuplexPeer};
use application::{Hub, HubConfig, HubDependencies, TransportFrame};
use domain::{ChatId, UserId};

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 一套跑在内存存储上的中枢
pub struct TestBackend {
    pub hub: Arc<Hub>,
    pub message_store: Arc<MemoryMessageStore>,
    pub chat_store: Arc<MemoryChatStore>,
    pub notification_store: Arc<MemoryNotificationStore>,
    pub group_store: Arc<MemoryGroupStore>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn start_hub() -> TestBackend {
    start_hub_with(HubConfig::default())
}

pub fn start_hub_with(config: HubConfig) -> TestBackend {
    init_tracing();

    let message_store = Arc::new(MemoryMessageStore::new());
    let chat_store = Arc::new(MemoryChatStore::new());
    let notification_store = Arc::new(MemoryNotificationStore::new());
    let group_store = Arc::new(MemoryGroupStore::new());

    let hub = Hub::start(
        HubDependencies {
            message_store: Arc::clone(&message_store) as _,
            chat_store: Arc::clone(&chat_store) as _,
            notification_store: Arc::clone(&notification_store) as _,
            group_store: Arc::clone(&group_store) as _,
        },
        config,
    );

    TestBackend {
        hub,
        message_store,
        chat_store,
        notification_store,
        group_store,
    }
}

/// 开一条双工连接并完成注册，返回模拟客户端的一端
pub async fn connect(hub: &Hub, user_id: UserId) -> DuplexPeer {
    let (transport, peer) = duplex::pair();
    hub.connect(user_id, Box::new(transport))
        .await
        .expect("connect");
    peer
}

/// 把 JSON 值作为数据帧发给服务端
pub async fn send_json(peer: &DuplexPeer, value: serde_json::Value) {
    peer.send(TransportFrame::Data(value.to_string()))
        .await
        .expect("send frame");
}

/// 收下一条数据帧（跳过心跳），超时视为测试失败
pub async fn recv_push(peer: &mut DuplexPeer) -> serde_json::Value {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            match peer.recv().await {
                Some(TransportFrame::Data(text)) => {
                    return serde_json::from_str(&text).expect("push frame is json")
                }
                Some(_) => continue,
                None => panic!("等推送帧时连接被关闭"),
            }
        }
    })
    .await
    .expect("等推送帧超时")
}

/// 断言短时间内没有任何数据帧推下来
pub async fn assert_no_push(peer: &mut DuplexPeer) {
    sleep(Duration::from_millis(100)).await;
    while let Some(frame) = peer.try_recv() {
        if let TransportFrame::Data(text) = frame {
            panic!("不应有推送帧，却收到: {text}");
        }
    }
}

/// 等服务端主动关掉这条连接（收到流结束）
pub async fn wait_for_close(peer: &mut DuplexPeer) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while peer.recv().await.is_some() {}
    })
    .await
    .expect("等连接关闭超时");
}

/// 等用户从注册表消失
pub async fn wait_for_offline(hub: &Hub, user_id: UserId) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if !hub.is_user_online(user_id).await {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("用户 {user_id} 一直在线");
}

/// 等聊天室的在线成员集合收敛到期望值
pub async fn wait_for_members(hub: &Hub, chat_id: ChatId, expected: HashSet<UserId>) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        let members = hub.room_info(chat_id).await.map(|room| room.members);
        if members.as_ref() == Some(&expected) {
            return;
        }
        last = members;
        sleep(POLL_INTERVAL).await;
    }
    panic!("聊天室 {chat_id} 成员未收敛到 {expected:?}，最后为 {last:?}");
}

/// 等聊天室被销毁
pub async fn wait_for_room_gone(hub: &Hub, chat_id: ChatId) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if hub.room_info(chat_id).await.is_none() {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("聊天室 {chat_id} 没有被销毁");
}
