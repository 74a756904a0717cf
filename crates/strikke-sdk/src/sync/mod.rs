//! 同步模块
//!
//! 职责：
//! - 按记录合并待同步修改并写入远端（coordinator）
//! - 汇总网络恢复与周期定时两个触发源（service）
//! - 编辑器字段的防抖保存与离线兜底（field_writer）

pub mod coordinator;
pub mod field_writer;
pub mod service;

pub use coordinator::{group_changes, ChangeGroup, FlushOutcome, FlushReport, SyncCoordinator, SyncMetrics, WriteGate};
pub use field_writer::{FieldWriter, FieldWriterConfig, WriteOutcome};
pub use service::{FlushTrigger, SyncService, SyncServiceHandle};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 周期刷写间隔（毫秒）
    pub flush_interval_ms: u64,
    /// 单次远端写入超时（毫秒）
    pub remote_timeout_ms: u64,
    /// 远端永久拒绝的修改是否移入死信区（否则一直保留重试）
    pub dead_letter_rejected: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 30_000,
            remote_timeout_ms: 30_000,
            dead_letter_rejected: true,
        }
    }
}

impl SyncConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}
