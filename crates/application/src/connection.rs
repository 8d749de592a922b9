//! 单个用户的活动连接
//!
//! 每条连接独占一个有界出站队列和底层传输句柄，并跑两个常驻任务：
//! 读循环把入站帧盖上发送者身份后转给中枢，写循环把出站队列排干到
//! 传输上并按周期发心跳。任何一侧的传输故障都只终止这一条连接。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use domain::{ChatId, UserId};

use crate::envelope::{ClientFrame, InboundEnvelope, PushFrame};
use crate::hub::{HubConfig, Unregister};
use crate::transport::{Transport, TransportFrame, TransportSink, TransportStream};

/// 写循环要处理的两种写操作
#[derive(Debug)]
pub(crate) enum WriteCommand {
    Frame(PushFrame),
    Pong,
}

/// 一个用户的一条活动连接
///
/// 注册表独占其生命周期；出站队列和传输句柄归连接自己。
pub struct Connection {
    user_id: UserId,
    /// 区分同一用户先后两条连接，防止被取代的旧连接注销掉新连接
    connection_id: Uuid,
    outbound: mpsc::Sender<WriteCommand>,
    /// 该用户当前参与的聊天集合
    chats: Mutex<HashSet<ChatId>>,
    closed: watch::Sender<bool>,
}

pub(crate) struct ConnectionChannels {
    pub outbound_rx: mpsc::Receiver<WriteCommand>,
    pub closed_rx: watch::Receiver<bool>,
}

impl Connection {
    pub(crate) fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, ConnectionChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (closed_tx, closed_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            user_id,
            connection_id: Uuid::new_v4(),
            outbound: outbound_tx,
            chats: Mutex::new(HashSet::new()),
            closed: closed_tx,
        });

        (
            connection,
            ConnectionChannels {
                outbound_rx,
                closed_rx,
            },
        )
    }

    /// 拆开传输、起读写循环，返回可注册的连接句柄
    pub(crate) fn spawn(
        user_id: UserId,
        transport: Box<dyn Transport>,
        config: &HubConfig,
        inbound_tx: mpsc::Sender<InboundEnvelope>,
        unregister_tx: mpsc::Sender<Unregister>,
    ) -> Arc<Self> {
        let (connection, channels) = Self::new(user_id, config.outbound_capacity);
        let (sink, stream) = transport.split();

        tokio::spawn(write_pump(
            sink,
            channels.outbound_rx,
            channels.closed_rx.clone(),
            config.clone(),
            user_id,
        ));
        tokio::spawn(read_pump(
            stream,
            Arc::clone(&connection),
            channels.closed_rx,
            config.clone(),
            inbound_tx,
            unregister_tx,
        ));

        connection
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// 非阻塞入队：队列满时返回 false，由调用方记日志后丢弃。
    /// 绝不阻塞调用线程。
    pub fn enqueue(&self, frame: PushFrame) -> bool {
        match self.outbound.try_send(WriteCommand::Frame(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user_id = %self.user_id, "出站队列已满，丢弃推送帧");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(user_id = %self.user_id, "连接已关闭，丢弃推送帧");
                false
            }
        }
    }

    fn enqueue_pong(&self) {
        if self.outbound.try_send(WriteCommand::Pong).is_err() {
            debug!(user_id = %self.user_id, "出站队列已满，跳过 pong 回应");
        }
    }

    pub fn is_in_chat(&self, chat_id: ChatId) -> bool {
        self.chats.lock().map(|set| set.contains(&chat_id)).unwrap_or(false)
    }

    pub fn joined_chats(&self) -> Vec<ChatId> {
        self.chats
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn join_chat(&self, chat_id: ChatId) {
        if let Ok(mut set) = self.chats.lock() {
            set.insert(chat_id);
        }
    }

    pub(crate) fn leave_chat(&self, chat_id: ChatId) {
        if let Ok(mut set) = self.chats.lock() {
            set.remove(&chat_id);
        }
    }

    /// 主动关闭连接：两个循环都会在下一个调度点退出，
    /// 写循环退出时顺带关掉传输出站方向。
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// 写循环：排干出站队列 + 周期心跳
///
/// 所有对传输出站半边的写都收口在这里，单次写受 write_timeout 约束。
async fn write_pump(
    mut sink: Box<dyn TransportSink>,
    mut outbound_rx: mpsc::Receiver<WriteCommand>,
    mut closed_rx: watch::Receiver<bool>,
    config: HubConfig,
    user_id: UserId,
) {
    let mut keepalive = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        tokio::select! {
            _ = closed_rx.changed() => break,
            command = outbound_rx.recv() => {
                let Some(command) = command else { break };
                let frame = match command {
                    WriteCommand::Frame(frame) => match serde_json::to_string(&frame) {
                        Ok(json) => TransportFrame::Data(json),
                        Err(err) => {
                            warn!(user_id = %user_id, error = %err, "推送帧序列化失败");
                            continue;
                        }
                    },
                    WriteCommand::Pong => TransportFrame::Pong,
                };
                match timeout(config.write_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(user_id = %user_id, error = %err, "写入传输失败，写循环退出");
                        break;
                    }
                    Err(_) => {
                        warn!(user_id = %user_id, "写入传输超时，写循环退出");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                match timeout(config.write_timeout, sink.send(TransportFrame::Ping)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(user_id = %user_id, "心跳发送失败，写循环退出");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!(user_id = %user_id, "写循环结束");
}

/// 读循环：逐帧读取、盖上发送者身份、转发给中枢
///
/// 空闲期限靠整帧读取的超时实现：每收到一帧（包括心跳回应）都重新
/// 计时；超过 idle_timeout 没有任何帧就判定连接死亡。退出前的最后
/// 一个动作是把自己送进注销通道。
async fn read_pump(
    mut stream: Box<dyn TransportStream>,
    connection: Arc<Connection>,
    mut closed_rx: watch::Receiver<bool>,
    config: HubConfig,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    unregister_tx: mpsc::Sender<Unregister>,
) {
    let user_id = connection.user_id();

    loop {
        tokio::select! {
            _ = closed_rx.changed() => break,
            next = timeout(config.idle_timeout, stream.next_frame()) => {
                match next {
                    Err(_) => {
                        warn!(user_id = %user_id, "连接空闲超时，断开");
                        break;
                    }
                    Ok(Err(err)) => {
                        debug!(user_id = %user_id, error = %err, "读取传输失败，读循环退出");
                        break;
                    }
                    Ok(Ok(None)) => break,
                    Ok(Ok(Some(TransportFrame::Close))) => break,
                    Ok(Ok(Some(TransportFrame::Ping))) => connection.enqueue_pong(),
                    Ok(Ok(Some(TransportFrame::Pong))) => {
                        // 心跳回应只负责刷新空闲期限
                    }
                    Ok(Ok(Some(TransportFrame::Data(text)))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                let envelope = InboundEnvelope {
                                    sender_id: user_id,
                                    frame,
                                };
                                if inbound_tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(user_id = %user_id, error = %err, "无法解析入站帧，忽略");
                            }
                        }
                    }
                }
            }
        }
    }

    // 保证写循环跟着退出，然后注销自己
    connection.close();
    let _ = unregister_tx
        .send(Unregister {
            user_id,
            connection_id: connection.connection_id(),
        })
        .await;
    debug!(user_id = %user_id, "读循环结束");
}
