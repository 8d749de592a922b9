//! 双工传输抽象
//!
//! HTTP 升级和线缆分帧由外层协作方完成，中枢只拿到一个可以收发帧的
//! 双工通道。帧的字母表对齐 WebSocket：文本数据、心跳 Ping/Pong、关闭。

use async_trait::async_trait;
use thiserror::Error;

/// 传输层的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// JSON 信封文本
    Data(String),
    Ping,
    Pong,
    Close,
}

/// 传输层错误
#[derive(Debug, Error)]
pub enum TransportError {
    /// 对端已经关闭
    #[error("连接已关闭")]
    Closed,
    /// 底层读写失败
    #[error("传输失败: {0}")]
    Io(String),
}

/// 出站半边：写循环独占
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: TransportFrame) -> Result<(), TransportError>;

    /// 关闭出站方向；重复关闭应当是无害的
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// 入站半边：读循环独占
#[async_trait]
pub trait TransportStream: Send {
    /// 读取下一帧；流正常结束时返回 `None`
    async fn next_frame(&mut self) -> Result<Option<TransportFrame>, TransportError>;
}

/// 一条完整的双工传输，注册时拆成两个半边分别交给读写循环
pub trait Transport: Send {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>);
}

/// 进程内双工实现
///
/// 两对 mpsc 通道背靠背接起来，一端交给中枢注册，另一端留给测试或
/// 嵌入方模拟客户端。
pub mod duplex {
    use super::*;
    use tokio::sync::mpsc;

    /// 通道容量，对齐 WebSocket 升级层的读写缓冲
    const FRAME_BUFFER: usize = 64;

    /// 服务端持有的一端
    pub struct DuplexTransport {
        outgoing: mpsc::Sender<TransportFrame>,
        incoming: mpsc::Receiver<TransportFrame>,
    }

    /// 客户端（测试）持有的一端
    pub struct DuplexPeer {
        outgoing: mpsc::Sender<TransportFrame>,
        incoming: mpsc::Receiver<TransportFrame>,
    }

    /// 创建一对相互连接的双工端点
    pub fn pair() -> (DuplexTransport, DuplexPeer) {
        let (client_tx, server_rx) = mpsc::channel(FRAME_BUFFER);
        let (server_tx, client_rx) = mpsc::channel(FRAME_BUFFER);

        (
            DuplexTransport {
                outgoing: server_tx,
                incoming: server_rx,
            },
            DuplexPeer {
                outgoing: client_tx,
                incoming: client_rx,
            },
        )
    }

    impl Transport for DuplexTransport {
        fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
            (
                Box::new(DuplexSink {
                    outgoing: Some(self.outgoing),
                }),
                Box::new(DuplexStream {
                    incoming: self.incoming,
                }),
            )
        }
    }

    struct DuplexSink {
        outgoing: Option<mpsc::Sender<TransportFrame>>,
    }

    #[async_trait]
    impl TransportSink for DuplexSink {
        async fn send(&mut self, frame: TransportFrame) -> Result<(), TransportError> {
            let Some(outgoing) = &self.outgoing else {
                return Err(TransportError::Closed);
            };
            outgoing
                .send(frame)
                .await
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            // 丢掉发送端，让对端的接收流自然结束
            self.outgoing.take();
            Ok(())
        }
    }

    struct DuplexStream {
        incoming: mpsc::Receiver<TransportFrame>,
    }

    #[async_trait]
    impl TransportStream for DuplexStream {
        async fn next_frame(&mut self) -> Result<Option<TransportFrame>, TransportError> {
            Ok(self.incoming.recv().await)
        }
    }

    impl DuplexPeer {
        /// 向服务端发一帧
        pub async fn send(&self, frame: TransportFrame) -> Result<(), TransportError> {
            self.outgoing
                .send(frame)
                .await
                .map_err(|_| TransportError::Closed)
        }

        /// 收服务端推下来的一帧；连接被关闭时返回 `None`
        pub async fn recv(&mut self) -> Option<TransportFrame> {
            self.incoming.recv().await
        }

        /// 非阻塞地收一帧
        pub fn try_recv(&mut self) -> Option<TransportFrame> {
            self.incoming.try_recv().ok()
        }

        /// 模拟客户端断开：丢掉出站通道，服务端读循环随即收到流结束
        pub fn disconnect(self) {
            drop(self);
        }
    }
}
