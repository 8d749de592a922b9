//! 连接注册表与聊天室注册表（中枢核心）
//!
//! 一个 Hub 实例维护 userID→连接 和 chatID→聊天室 两张表，由同一把
//! 读写锁保护；注册、注销和入站帧分发串行化在单个事件循环任务里，
//! REST 处理器产生的服务端事件则直接调用同步注册表方法。
//!
//! 锁内不做存储 I/O：注册路径先在锁外读完持久化数据再改表，广播路径
//! 在读锁内做成员快照、在锁外入队。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use domain::{ChatId, ChatKind, Notification, Timestamp, UserId};

use crate::connection::Connection;
use crate::envelope::{InboundEnvelope, NotificationEnvelope, PushFrame};
use crate::error::HubError;
use crate::store::{ChatStore, GroupStore, MessageStore, NotificationStore};
use crate::transport::Transport;

/// 中枢运行参数
///
/// 默认值对齐线上部署：出站队列 256、空闲期限 60 秒、心跳周期取
/// 空闲期限的九成、单次写 10 秒、历史分页默认 50 上限 100。
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 每条连接的出站队列容量
    pub outbound_capacity: usize,
    /// 注册/注销通道容量
    pub register_capacity: usize,
    /// 入站帧队列容量
    pub inbound_capacity: usize,
    /// 空闲期限：超过该时长没有任何入站帧就断开
    pub idle_timeout: Duration,
    /// 心跳发送周期
    pub ping_interval: Duration,
    /// 单次传输写入的超时
    pub write_timeout: Duration,
    /// 历史分页的默认条数
    pub history_page_size: u32,
    /// 历史分页的条数上限
    pub history_page_max: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        let idle_timeout = Duration::from_secs(60);
        Self {
            outbound_capacity: 256,
            register_capacity: 100,
            inbound_capacity: 1000,
            idle_timeout,
            ping_interval: idle_timeout.mul_f64(0.9),
            write_timeout: Duration::from_secs(10),
            history_page_size: 50,
            history_page_max: 100,
        }
    }
}

impl From<&config::RealtimeConfig> for HubConfig {
    fn from(value: &config::RealtimeConfig) -> Self {
        Self {
            outbound_capacity: value.outbound_capacity,
            register_capacity: value.register_capacity,
            inbound_capacity: value.inbound_capacity,
            idle_timeout: Duration::from_secs(value.idle_timeout_secs),
            ping_interval: Duration::from_secs(value.ping_interval_secs),
            write_timeout: Duration::from_secs(value.write_timeout_secs),
            history_page_size: value.history_page_size,
            history_page_max: value.history_page_max,
        }
    }
}

/// 聊天室：一个聊天的在线成员缓存
///
/// 只存用户ID，不存连接引用；解析到活动连接必须在同一次加锁里完成，
/// 不允许把连接引用缓存到锁外。权威参与者名单在持久化协作方，
/// 这里恒有 members ⊆ 持久化参与者。
pub(crate) struct Room {
    pub kind: ChatKind,
    pub members: HashSet<UserId>,
    pub created_at: Timestamp,
}

impl Room {
    fn new(kind: ChatKind) -> Self {
        Self {
            kind,
            members: HashSet::new(),
            created_at: Utc::now(),
        }
    }
}

/// 聊天室快照（对外暴露）
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub id: ChatId,
    pub kind: ChatKind,
    pub members: HashSet<UserId>,
    pub created_at: Timestamp,
}

/// 中枢运行统计
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub active_connections: usize,
    pub active_rooms: usize,
    pub messages_routed: u64,
    pub frames_dropped: u64,
}

/// 读循环退出时发给核心循环的注销请求
#[derive(Debug)]
pub(crate) struct Unregister {
    pub user_id: UserId,
    pub connection_id: Uuid,
}

struct RegisterEvent {
    connection: Arc<Connection>,
    done: Option<oneshot::Sender<()>>,
}

/// 中枢依赖的持久化协作方
#[derive(Clone)]
pub struct HubDependencies {
    pub message_store: Arc<dyn MessageStore>,
    pub chat_store: Arc<dyn ChatStore>,
    pub notification_store: Arc<dyn NotificationStore>,
    pub group_store: Arc<dyn GroupStore>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<UserId, Arc<Connection>>,
    rooms: HashMap<ChatId, Room>,
}

/// 实时中枢聚合根
pub struct Hub {
    state: RwLock<HubState>,
    register_tx: mpsc::Sender<RegisterEvent>,
    unregister_tx: mpsc::Sender<Unregister>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    pub(crate) deps: HubDependencies,
    pub(crate) config: HubConfig,
    pub(crate) messages_routed: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
}

/// 核心事件循环：三个输入通道的单一消费者
pub struct HubRunner {
    hub: Arc<Hub>,
    register_rx: mpsc::Receiver<RegisterEvent>,
    unregister_rx: mpsc::Receiver<Unregister>,
    inbound_rx: mpsc::Receiver<InboundEnvelope>,
}

impl Hub {
    pub fn new(deps: HubDependencies, config: HubConfig) -> (Arc<Self>, HubRunner) {
        let (register_tx, register_rx) = mpsc::channel(config.register_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.register_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

        let hub = Arc::new(Self {
            state: RwLock::new(HubState::default()),
            register_tx,
            unregister_tx,
            inbound_tx,
            deps,
            config,
            messages_routed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        });

        let runner = HubRunner {
            hub: Arc::clone(&hub),
            register_rx,
            unregister_rx,
            inbound_rx,
        };

        (hub, runner)
    }

    /// 创建中枢并直接起事件循环任务
    pub fn start(deps: HubDependencies, config: HubConfig) -> Arc<Self> {
        let (hub, runner) = Self::new(deps, config);
        tokio::spawn(runner.run());
        hub
    }

    /// 为已认证用户注册一条新连接
    ///
    /// 起读写循环后把连接交给核心循环；等注册和房间初始化完成再返回，
    /// 调用方返回后即可观察到该用户的成员关系。
    pub async fn connect(
        &self,
        user_id: UserId,
        transport: Box<dyn Transport>,
    ) -> Result<(), HubError> {
        let connection = Connection::spawn(
            user_id,
            transport,
            &self.config,
            self.inbound_tx.clone(),
            self.unregister_tx.clone(),
        );

        let (done_tx, done_rx) = oneshot::channel();
        self.register_tx
            .send(RegisterEvent {
                connection,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| HubError::Shutdown)?;
        let _ = done_rx.await;
        Ok(())
    }

    /// 显式登出：关闭该用户当前连接，注销由读循环退出触发
    pub async fn disconnect(&self, user_id: UserId) {
        let connection = {
            let state = self.state.read().await;
            state.connections.get(&user_id).cloned()
        };
        if let Some(connection) = connection {
            connection.close();
        }
    }

    /// 幂等地初始化一个聊天室，把当前在线的参与者挂进去
    ///
    /// REST 处理器在建完私聊/群聊后从任意任务调用。
    pub async fn initialize_room(&self, chat_id: ChatId, kind: ChatKind, participants: &[UserId]) {
        let mut guard = self.state.write().await;
        let HubState { connections, rooms } = &mut *guard;

        let room = rooms.entry(chat_id).or_insert_with(|| Room::new(kind));
        for user_id in participants {
            if let Some(connection) = connections.get(user_id) {
                room.members.insert(*user_id);
                connection.join_chat(chat_id);
            }
        }
        debug!(chat_id = %chat_id, members = room.members.len(), "初始化聊天室");
    }

    /// 把一个在线用户挂进已存在的聊天室；聊天室不存在或用户不在线则不动
    pub async fn add_member(&self, chat_id: ChatId, user_id: UserId) {
        let mut guard = self.state.write().await;
        let HubState { connections, rooms } = &mut *guard;

        let Some(room) = rooms.get_mut(&chat_id) else {
            return;
        };
        if let Some(connection) = connections.get(&user_id) {
            room.members.insert(user_id);
            connection.join_chat(chat_id);
        }
    }

    /// 把用户从聊天室摘掉；最后一个成员离开时销毁聊天室
    pub async fn remove_member(&self, chat_id: ChatId, user_id: UserId) {
        let mut guard = self.state.write().await;
        let HubState { connections, rooms } = &mut *guard;

        let Some(room) = rooms.get_mut(&chat_id) else {
            return;
        };
        room.members.remove(&user_id);
        if let Some(connection) = connections.get(&user_id) {
            connection.leave_chat(chat_id);
        }
        if room.members.is_empty() {
            rooms.remove(&chat_id);
            debug!(chat_id = %chat_id, "聊天室已空，销毁");
        }
    }

    /// 给聊天室在线成员（除 exclude 外）尽力推送一帧
    ///
    /// 读锁内只做成员快照，入队在锁外；不重试，不保证成员间的先后。
    pub async fn broadcast(&self, chat_id: ChatId, frame: PushFrame, exclude: Option<UserId>) {
        let targets: Vec<Arc<Connection>> = {
            let state = self.state.read().await;
            let Some(room) = state.rooms.get(&chat_id) else {
                debug!(chat_id = %chat_id, "聊天室未激活，跳过广播");
                return;
            };
            room.members
                .iter()
                .filter(|user_id| Some(**user_id) != exclude)
                .filter_map(|user_id| state.connections.get(user_id).cloned())
                .collect()
        };

        for connection in targets {
            if !connection.enqueue(frame.clone()) {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 给单个在线用户推通知；不在线时立即返回 false，不算错误
    /// （持久化的通知行在调用方手里，离线投递不是这里的职责）
    pub(crate) async fn push_notification(
        &self,
        user_id: UserId,
        notification: Notification,
        extra: Option<JsonValue>,
    ) -> bool {
        let connection = {
            let state = self.state.read().await;
            state.connections.get(&user_id).cloned()
        };
        let Some(connection) = connection else {
            debug!(user_id = %user_id, "用户不在线，通知只保留存储记录");
            return false;
        };

        let frame = PushFrame::Notification {
            data: NotificationEnvelope {
                notification,
                extra,
            },
        };
        if connection.enqueue(frame) {
            true
        } else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub(crate) async fn user_connection(&self, user_id: UserId) -> Option<Arc<Connection>> {
        let state = self.state.read().await;
        state.connections.get(&user_id).cloned()
    }

    pub async fn is_user_online(&self, user_id: UserId) -> bool {
        let state = self.state.read().await;
        state.connections.contains_key(&user_id)
    }

    pub async fn connected_users(&self) -> Vec<UserId> {
        let state = self.state.read().await;
        state.connections.keys().copied().collect()
    }

    /// 聊天室快照；未激活时返回 None
    pub async fn room_info(&self, chat_id: ChatId) -> Option<RoomInfo> {
        let state = self.state.read().await;
        state.rooms.get(&chat_id).map(|room| RoomInfo {
            id: chat_id,
            kind: room.kind,
            members: room.members.clone(),
            created_at: room.created_at,
        })
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.read().await;
        HubStats {
            active_connections: state.connections.len(),
            active_rooms: state.rooms.len(),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }

    /// 注册：锁外读存储，锁内改表
    async fn handle_register(&self, connection: Arc<Connection>) {
        let user_id = connection.user_id();
        info!(user_id = %user_id, "注册新连接");

        let chat_ids = match self.deps.chat_store.user_chat_ids(user_id).await {
            Ok(ids) => ids,
            Err(err) => {
                error!(user_id = %user_id, error = %err, "读取用户聊天列表失败");
                Vec::new()
            }
        };

        let mut chats = Vec::with_capacity(chat_ids.len());
        for chat_id in chat_ids {
            let kind = match self.deps.chat_store.chat_kind(chat_id).await {
                Ok(kind) => kind,
                Err(err) => {
                    warn!(chat_id = %chat_id, error = %err, "读取聊天类型失败，按私聊处理");
                    ChatKind::Direct
                }
            };
            let participants = match self.deps.chat_store.chat_participants(chat_id).await {
                Ok(participants) => participants,
                Err(err) => {
                    warn!(chat_id = %chat_id, error = %err, "读取聊天参与者失败");
                    Vec::new()
                }
            };
            chats.push((chat_id, kind, participants));
        }

        let mut guard = self.state.write().await;
        let HubState { connections, rooms } = &mut *guard;

        // 同一用户最多一条活动连接：重复登录时显式关闭被取代的旧连接
        if let Some(superseded) = connections.insert(user_id, Arc::clone(&connection)) {
            warn!(user_id = %user_id, "用户重复登录，关闭旧连接");
            superseded.close();
        }

        for (chat_id, kind, participants) in chats {
            let room = rooms.entry(chat_id).or_insert_with(|| Room::new(kind));
            room.members.insert(user_id);
            connection.join_chat(chat_id);

            // 顺手把其他已在线的参与者补进来，修复乱序连接留下的缺口
            for participant in participants {
                if participant == user_id {
                    continue;
                }
                if let Some(other) = connections.get(&participant) {
                    if room.members.insert(participant) {
                        other.join_chat(chat_id);
                    }
                }
            }
        }
    }

    /// 注销：被新连接取代的旧连接发来的请求直接忽略
    async fn handle_unregister(&self, event: Unregister) {
        let mut guard = self.state.write().await;
        let HubState { connections, rooms } = &mut *guard;

        match connections.get(&event.user_id) {
            Some(current) if current.connection_id() == event.connection_id => {
                connections.remove(&event.user_id);
            }
            _ => {
                debug!(user_id = %event.user_id, "注销请求来自被取代的连接，忽略");
                return;
            }
        }

        rooms.retain(|_, room| {
            room.members.remove(&event.user_id);
            !room.members.is_empty()
        });
        info!(user_id = %event.user_id, "连接已注销");
    }
}

impl HubRunner {
    /// 核心事件循环：串行消费注册、注销和入站帧
    pub async fn run(mut self) {
        info!("中枢事件循环启动");
        loop {
            tokio::select! {
                event = self.register_rx.recv() => {
                    let Some(event) = event else { break };
                    self.hub.handle_register(event.connection).await;
                    if let Some(done) = event.done {
                        let _ = done.send(());
                    }
                }
                event = self.unregister_rx.recv() => {
                    let Some(event) = event else { break };
                    self.hub.handle_unregister(event).await;
                }
                envelope = self.inbound_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.hub.handle_inbound(envelope).await;
                }
            }
        }
        info!("中枢事件循环退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{
        MemoryChatStore, MemoryGroupStore, MemoryMessageStore, MemoryNotificationStore,
    };
    use domain::ChatMessage;

    fn test_hub() -> Arc<Hub> {
        let deps = HubDependencies {
            message_store: Arc::new(MemoryMessageStore::new()),
            chat_store: Arc::new(MemoryChatStore::new()),
            notification_store: Arc::new(MemoryNotificationStore::new()),
            group_store: Arc::new(MemoryGroupStore::new()),
        };
        let (hub, _runner) = Hub::new(deps, HubConfig::default());
        hub
    }

    async fn insert_connection(hub: &Hub, user_id: UserId) -> crate::connection::ConnectionChannels {
        let (connection, channels) = Connection::new(user_id, 8);
        let mut state = hub.state.write().await;
        state.connections.insert(user_id, connection);
        channels
    }

    fn sample_frame(chat_id: ChatId, sender: UserId) -> PushFrame {
        let message = ChatMessage::new(chat_id, sender, "hi", Utc::now()).unwrap();
        PushFrame::NewMessage {
            chat_id,
            data: message,
        }
    }

    #[tokio::test]
    async fn initialize_room_attaches_only_connected_participants() {
        let hub = test_hub();
        let (u1, u3) = (UserId::random(), UserId::random());
        let chat_id = ChatId::random();

        let _ch1 = insert_connection(&hub, u1).await;
        // u3 不在线

        hub.initialize_room(chat_id, ChatKind::Group, &[u1, u3]).await;

        let info = hub.room_info(chat_id).await.unwrap();
        assert_eq!(info.members, HashSet::from([u1]));
        assert_eq!(info.kind, ChatKind::Group);
    }

    #[tokio::test]
    async fn initialize_room_is_idempotent() {
        let hub = test_hub();
        let u1 = UserId::random();
        let chat_id = ChatId::random();
        let _ch1 = insert_connection(&hub, u1).await;

        hub.initialize_room(chat_id, ChatKind::Direct, &[u1]).await;
        hub.initialize_room(chat_id, ChatKind::Direct, &[u1]).await;

        let info = hub.room_info(chat_id).await.unwrap();
        assert_eq!(info.members.len(), 1);
    }

    #[tokio::test]
    async fn removing_last_member_destroys_room() {
        let hub = test_hub();
        let u1 = UserId::random();
        let chat_id = ChatId::random();
        let _ch1 = insert_connection(&hub, u1).await;

        hub.initialize_room(chat_id, ChatKind::Direct, &[u1]).await;
        hub.remove_member(chat_id, u1).await;

        assert!(hub.room_info(chat_id).await.is_none());
    }

    #[tokio::test]
    async fn add_member_ignores_unknown_room() {
        let hub = test_hub();
        let u1 = UserId::random();
        let _ch1 = insert_connection(&hub, u1).await;

        hub.add_member(ChatId::random(), u1).await;
        assert_eq!(hub.stats().await.active_rooms, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_user() {
        let hub = test_hub();
        let (u1, u2) = (UserId::random(), UserId::random());
        let chat_id = ChatId::random();

        let mut ch1 = insert_connection(&hub, u1).await;
        let mut ch2 = insert_connection(&hub, u2).await;
        hub.initialize_room(chat_id, ChatKind::Direct, &[u1, u2]).await;

        hub.broadcast(chat_id, sample_frame(chat_id, u1), Some(u1)).await;

        assert!(ch1.outbound_rx.try_recv().is_err());
        assert!(ch2.outbound_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_counts_dropped_frames() {
        let hub = test_hub();
        let (u1, u2) = (UserId::random(), UserId::random());
        let chat_id = ChatId::random();

        let _ch1 = insert_connection(&hub, u1).await;
        // u2 的出站队列容量只有 1，第二次广播必然溢出
        let (connection, _ch2) = Connection::new(u2, 1);
        {
            let mut state = hub.state.write().await;
            state.connections.insert(u2, connection);
        }
        hub.initialize_room(chat_id, ChatKind::Direct, &[u1, u2]).await;

        hub.broadcast(chat_id, sample_frame(chat_id, u1), Some(u1)).await;
        hub.broadcast(chat_id, sample_frame(chat_id, u1), Some(u1)).await;

        assert_eq!(hub.stats().await.frames_dropped, 1);
    }

    #[tokio::test]
    async fn offline_notification_push_is_noop() {
        let hub = test_hub();
        let offline = UserId::random();
        let notification = Notification::new(
            offline,
            domain::NotificationKind::NewFollower,
            "ref",
            Utc::now(),
        );

        let delivered = hub.push_notification(offline, notification, None).await;
        assert!(!delivered);
    }
}
