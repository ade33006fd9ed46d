//! 按键串行化
//!
//! 同一个键（会话或用户）上的扇出按进入顺序逐个执行，不同键之间互不阻塞。
//! `tokio::sync::Mutex` 按 FIFO 顺序唤醒等待者，先进入的扇出先完成。

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

pub struct OrderingKeys<K> {
    lanes: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> Default for OrderingKeys<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            lanes: DashMap::new(),
        }
    }
}

impl<K> OrderingKeys<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `key` 的串行通道上执行 `work`
    ///
    /// 调用方的 future 被取消时（等待中或执行中）通道同样会被回收。
    pub async fn serialize<F, T>(&self, key: K, work: F) -> T
    where
        F: Future<Output = T>,
    {
        // 局部变量逆序析构：先释放锁，再释放通道引用，最后回收
        let _cleanup = LaneCleanup {
            keys: self,
            key: key.clone(),
        };
        let lane = self.lanes.entry(key).or_default().value().clone();
        let _turn = lane.lock().await;
        work.await
    }

    /// 当前持有通道的键数量
    pub fn active_keys(&self) -> usize {
        self.lanes.len()
    }
}

/// 离开串行通道时，没有其他持有者的通道被回收
struct LaneCleanup<'a, K>
where
    K: Eq + Hash + Clone,
{
    keys: &'a OrderingKeys<K>,
    key: K,
}

impl<K> Drop for LaneCleanup<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.keys
            .lanes
            .remove_if(&self.key, |_, lane| Arc::strong_count(lane) == 1);
    }
}
