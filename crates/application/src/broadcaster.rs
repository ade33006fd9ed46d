//! 跨进程扇出
//!
//! 本地扇出完成后，调度器把同一份事件交给 `FanoutBackend`，
//! 由它转发给其他进程；其他进程只投递给自己本地的连接，不再转发。

use async_trait::async_trait;
use domain::{NodeId, ServerFrame, UserId};
use thiserror::Error;

/// 转发给其他进程的一次扇出
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteDispatch {
    /// 发起扇出的节点，接收方据此忽略自己发出的事件
    pub origin: NodeId,
    pub audience: Vec<UserId>,
    pub frame: ServerFrame,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Failed(String),
}

impl BroadcastError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait FanoutBackend: Send + Sync {
    async fn publish(&self, dispatch: RemoteDispatch) -> Result<(), BroadcastError>;

    /// 是否需要把事件转发出去；单进程部署返回 false
    fn forwards(&self) -> bool {
        true
    }
}

/// 单进程部署：不转发
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnlyBackend;

#[async_trait]
impl FanoutBackend for LocalOnlyBackend {
    async fn publish(&self, _dispatch: RemoteDispatch) -> Result<(), BroadcastError> {
        Ok(())
    }

    fn forwards(&self) -> bool {
        false
    }
}
