//! 同步事件 - 供宿主 UI 渲染"待同步"提示
//!
//! 事件通过 broadcast 通道分发，没有订阅者时直接丢弃。

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::storage::entities::RecordId;

/// 同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 一次字段修改进入待同步日志
    ChangeQueued {
        change_id: u64,
        record_id: RecordId,
        field: String,
        timestamp: i64,
    },
    /// 开始一次刷写
    FlushStarted { pending: usize, timestamp: i64 },
    /// 一条记录的全部待同步字段已写入远端
    RecordSynced {
        record_id: RecordId,
        fields: Vec<String>,
        timestamp: i64,
    },
    /// 一条记录写入失败，条目保留到下一轮
    RecordSyncFailed {
        record_id: RecordId,
        reason: String,
        retryable: bool,
        timestamp: i64,
    },
    /// 被远端永久拒绝的条目已移入死信区
    ChangesDeadLettered {
        record_id: RecordId,
        count: usize,
        reason: String,
        timestamp: i64,
    },
    /// 刷写结束
    FlushCompleted {
        synced_records: usize,
        failed_records: usize,
        dead_lettered: usize,
        remaining: usize,
        timestamp: i64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ChangeQueued { .. } => "change_queued",
            SyncEvent::FlushStarted { .. } => "flush_started",
            SyncEvent::RecordSynced { .. } => "record_synced",
            SyncEvent::RecordSyncFailed { .. } => "record_sync_failed",
            SyncEvent::ChangesDeadLettered { .. } => "changes_dead_lettered",
            SyncEvent::FlushCompleted { .. } => "flush_completed",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ChangeQueued { timestamp, .. }
            | SyncEvent::FlushStarted { timestamp, .. }
            | SyncEvent::RecordSynced { timestamp, .. }
            | SyncEvent::RecordSyncFailed { timestamp, .. }
            | SyncEvent::ChangesDeadLettered { timestamp, .. }
            | SyncEvent::FlushCompleted { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
#[derive(Debug)]
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    stats: RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        if self.sender.send(event).is_err() {
            debug!("同步事件无订阅者，已丢弃");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
