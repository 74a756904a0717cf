//! 字段写入器 - 编辑器（行计数器、笔记）的防抖保存
//!
//! 每个 (记录, 字段) 独立防抖。到期后在线则直接写远端，失败或离线时写入待同步日志，
//! 由同步协调器稍后补发。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::network::NetworkMonitor;
use crate::remote::RemoteRecordStore;
use crate::storage::entities::{fields, FieldKey, FieldMap, RecordId};
use crate::storage::pending::PendingChangeStore;
use crate::sync::coordinator::WriteGate;

/// 字段写入器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldWriterConfig {
    /// 未单独配置的字段使用的防抖时间（毫秒）
    pub default_debounce_ms: u64,
    /// 按字段覆盖的防抖时间（毫秒）
    pub field_debounce_ms: HashMap<String, u64>,
}

impl Default for FieldWriterConfig {
    fn default() -> Self {
        let mut field_debounce_ms = HashMap::new();
        field_debounce_ms.insert(fields::CURRENT_ROW.to_string(), 400);
        field_debounce_ms.insert(fields::NOTES.to_string(), 600);
        Self {
            default_debounce_ms: 400,
            field_debounce_ms,
        }
    }
}

impl FieldWriterConfig {
    pub fn debounce_for(&self, field: &str) -> Duration {
        let ms = self
            .field_debounce_ms
            .get(field)
            .copied()
            .unwrap_or(self.default_debounce_ms);
        Duration::from_millis(ms)
    }
}

/// 一次保存的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 已直接写入远端
    Applied,
    /// 已写入待同步日志
    Queued { change_id: u64 },
}

struct PendingSave {
    generation: u64,
    value: serde_json::Value,
    handle: JoinHandle<()>,
}

struct WriterInner {
    store: Arc<dyn PendingChangeStore>,
    remote: Arc<dyn RemoteRecordStore>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    config: FieldWriterConfig,
    remote_timeout: Duration,
    pending: Mutex<HashMap<FieldKey, PendingSave>>,
    next_generation: AtomicU64,
    // 与协调器共用，同一字段的旧值不会晚于新值到达远端
    gate: WriteGate,
}

/// 字段写入器
#[derive(Clone)]
pub struct FieldWriter {
    inner: Arc<WriterInner>,
}

impl fmt::Debug for FieldWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldWriter")
            .field("config", &self.inner.config)
            .field("remote_timeout", &self.inner.remote_timeout)
            .field("pending_saves", &self.pending_saves())
            .finish_non_exhaustive()
    }
}

impl FieldWriter {
    pub fn new(
        store: Arc<dyn PendingChangeStore>,
        remote: Arc<dyn RemoteRecordStore>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        config: FieldWriterConfig,
        remote_timeout: Duration,
        gate: WriteGate,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                store,
                remote,
                network,
                events,
                config,
                remote_timeout,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                gate,
            }),
        }
    }

    /// 防抖保存：同一字段在防抖窗口内的多次修改只写最后一次
    pub fn save(&self, record_id: RecordId, field: &str, value: serde_json::Value) {
        let key = FieldKey::new(record_id, field);
        let delay = self.inner.config.debounce_for(field);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        // 持锁 spawn，保证定时任务读到的是本次写入的条目
        let mut pending = self.inner.pending.lock();
        let inner = self.inner.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(task_key, generation).await;
        });
        if let Some(previous) = pending.insert(
            key,
            PendingSave {
                generation,
                value,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// 立即保存，取消该字段尚未触发的防抖
    pub async fn save_now(&self, record_id: RecordId, field: &str, value: serde_json::Value) -> Result<WriteOutcome> {
        let key = FieldKey::new(record_id, field);
        if let Some(previous) = self.inner.pending.lock().remove(&key) {
            previous.handle.abort();
        }
        self.inner.write(key, value).await
    }

    /// 立即写出所有尚未触发的防抖保存，返回写出的条数
    ///
    /// 逐条尝试，返回遇到的第一个错误。
    pub async fn flush(&self) -> Result<usize> {
        let drained: Vec<(FieldKey, PendingSave)> = self.inner.pending.lock().drain().collect();
        let mut written = 0;
        let mut first_error = None;
        for (key, save) in drained {
            save.handle.abort();
            match self.inner.write(key, save.value).await {
                Ok(_) => written += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// 尚未触发的防抖保存数量
    pub fn pending_saves(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl WriterInner {
    async fn fire(&self, key: FieldKey, generation: u64) {
        let value = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some(save) if save.generation == generation => pending.remove(&key).map(|save| save.value),
                _ => None,
            }
        };
        let Some(value) = value else {
            return;
        };

        let record_id = key.record_id.clone();
        let field = key.field.clone();
        if let Err(e) = self.write(key, value).await {
            error!("字段保存失败，本次修改未能落盘: {}.{}: {}", record_id, field, e);
        }
    }

    async fn write(&self, key: FieldKey, value: serde_json::Value) -> Result<WriteOutcome> {
        let _gate = self.gate.lock().await;

        if self.network.is_online().await {
            // 只清理写入前已在日志中的条目，写入期间新记下的修改要保留
            let superseded = self.superseded_ids(&key).await;
            let mut update = FieldMap::new();
            update.insert(key.field.clone(), value.clone());
            match tokio::time::timeout(self.remote_timeout, self.remote.apply_update(&key.record_id, &update)).await {
                Ok(Ok(())) => {
                    debug!("字段已直接写入远端: {}.{}", key.record_id, key.field);
                    self.drop_superseded(&superseded).await;
                    return Ok(WriteOutcome::Applied);
                }
                Ok(Err(e)) => warn!("直接写入失败，转入待同步日志: {}.{}: {}", key.record_id, key.field, e),
                Err(_) => warn!("直接写入超时，转入待同步日志: {}.{}", key.record_id, key.field),
            }
        }

        let change = self.store.record(key.record_id, &key.field, value).await?;
        self.events.emit(SyncEvent::ChangeQueued {
            change_id: change.id,
            record_id: change.record_id.clone(),
            field: change.field.clone(),
            timestamp: now_millis(),
        });
        Ok(WriteOutcome::Queued { change_id: change.id })
    }

    /// 日志中同一字段的现有条目，直接写入成功后它们都已过时
    async fn superseded_ids(&self, key: &FieldKey) -> Vec<u64> {
        match self.store.list_all().await {
            Ok(changes) => changes
                .into_iter()
                .filter(|change| &change.key() == key)
                .map(|change| change.id)
                .collect(),
            Err(e) => {
                warn!("读取待同步日志失败，旧值可能被补发: {}", e);
                Vec::new()
            }
        }
    }

    /// 远端已是最新值时，日志里同一字段的旧值不能再被补发
    async fn drop_superseded(&self, ids: &[u64]) {
        for &id in ids {
            match self.store.remove(id).await {
                Ok(()) => debug!("移除已被覆盖的待同步条目 #{}", id),
                Err(e) => warn!("移除已被覆盖的待同步条目 #{} 失败: {}", id, e),
            }
        }
    }
}
