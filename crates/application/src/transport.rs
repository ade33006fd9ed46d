//! 实时连接的传输层抽象
//!
//! 核心只依赖这里的 trait，WebSocket 等具体协议在外层适配。
//! 传输在连接建立时拆分为读端和写端，读写分别由独立的任务驱动。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{CloseCode, ServerFrame};
use thiserror::Error;

use crate::connection::CloseReason;

/// 从客户端收到的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// 文本帧，内容为 JSON
    Text(String),
    /// 协议层心跳（ping/pong）
    Heartbeat,
    /// 不支持的帧类型（例如二进制帧）
    Unsupported,
}

/// 写入连接发送队列的指令
#[derive(Debug, Clone)]
pub enum Outbound {
    /// 推送一帧，同一帧在多个连接间共享
    Frame(Arc<ServerFrame>),
    /// 刷新队列中已有的帧后关闭连接
    Close(CloseReason),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is gone")]
    ConnectionGone,
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("transport error: {0}")]
    Io(String),
}

/// 写端
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError>;

    /// 发送关闭帧；连接已断开时静默忽略
    async fn close(&mut self, code: CloseCode, reason: &str);
}

/// 读端
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// 读取下一帧，对端关闭时返回 `None`。
    ///
    /// 必须可以安全取消：读取循环会与空闲超时和驱逐信号一起 `select!`。
    async fn receive(&mut self) -> Option<Result<Inbound, TransportError>>;
}

/// 可拆分为读写两端的双向传输
pub trait Transport: Send + 'static {
    type Sink: FrameSink;
    type Source: FrameSource;

    fn split(self) -> (Self::Sink, Self::Source);
}
