//! 实时聊天系统核心领域模型
//!
//! 包含会话（私聊/群聊）、成员、消息、连接会话与在线状态等实体，
//! 以及客户端/服务端线上帧格式和仓储接口。

pub mod entities;
pub mod errors;
pub mod frames;
pub mod repositories;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use frames::*;
pub use repositories::*;
pub use value_objects::*;
