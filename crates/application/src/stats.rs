//! 实时核心运行计数
//!
//! 全部为无锁原子计数，读取时生成快照。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RealtimeStats {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connections_rejected: AtomicU64,
    messages_dispatched: AtomicU64,
    updates_dispatched: AtomicU64,
    presence_events: AtomicU64,
    acks_dispatched: AtomicU64,
    remote_dispatches: AtomicU64,
    frames_pushed: AtomicU64,
    push_timeouts: AtomicU64,
    receivers_gone: AtomicU64,
    audience_failures: AtomicU64,
    publish_failures: AtomicU64,
    invalid_frames: AtomicU64,
}

/// 计数快照，附带注册表的实时数值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealtimeStatsSnapshot {
    pub live_connections: u64,
    pub online_users: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub messages_dispatched: u64,
    /// 消息修改与删除的扇出次数
    pub updates_dispatched: u64,
    pub presence_events: u64,
    pub acks_dispatched: u64,
    pub remote_dispatches: u64,
    pub frames_pushed: u64,
    pub push_timeouts: u64,
    pub receivers_gone: u64,
    pub audience_failures: u64,
    pub publish_failures: u64,
    pub invalid_frames: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl RealtimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_opened(&self) {
        bump(&self.connections_opened, 1);
    }

    pub fn record_connection_closed(&self) {
        bump(&self.connections_closed, 1);
    }

    pub fn record_connection_rejected(&self) {
        bump(&self.connections_rejected, 1);
    }

    pub fn record_message_dispatched(&self) {
        bump(&self.messages_dispatched, 1);
    }

    pub fn record_update_dispatched(&self) {
        bump(&self.updates_dispatched, 1);
    }

    pub fn record_presence_event(&self) {
        bump(&self.presence_events, 1);
    }

    pub fn record_ack_dispatched(&self) {
        bump(&self.acks_dispatched, 1);
    }

    pub fn record_remote_dispatch(&self) {
        bump(&self.remote_dispatches, 1);
    }

    pub fn record_push_results(&self, delivered: usize, timed_out: usize, gone: usize) {
        bump(&self.frames_pushed, delivered as u64);
        bump(&self.push_timeouts, timed_out as u64);
        bump(&self.receivers_gone, gone as u64);
    }

    pub fn record_audience_failure(&self) {
        bump(&self.audience_failures, 1);
    }

    pub fn record_publish_failure(&self) {
        bump(&self.publish_failures, 1);
    }

    pub fn record_invalid_frame(&self) {
        bump(&self.invalid_frames, 1);
    }

    pub fn snapshot(&self, live_connections: usize, online_users: usize) -> RealtimeStatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RealtimeStatsSnapshot {
            live_connections: live_connections as u64,
            online_users: online_users as u64,
            connections_opened: read(&self.connections_opened),
            connections_closed: read(&self.connections_closed),
            connections_rejected: read(&self.connections_rejected),
            messages_dispatched: read(&self.messages_dispatched),
            updates_dispatched: read(&self.updates_dispatched),
            presence_events: read(&self.presence_events),
            acks_dispatched: read(&self.acks_dispatched),
            remote_dispatches: read(&self.remote_dispatches),
            frames_pushed: read(&self.frames_pushed),
            push_timeouts: read(&self.push_timeouts),
            receivers_gone: read(&self.receivers_gone),
            audience_failures: read(&self.audience_failures),
            publish_failures: read(&self.publish_failures),
            invalid_frames: read(&self.invalid_frames),
        }
    }
}
