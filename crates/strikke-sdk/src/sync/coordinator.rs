//! 同步协调器 - 把待同步日志按记录合并后写入远端
//!
//! 状态只有两个：空闲 / 刷写中。刷写中再次触发直接跳过，不排队。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::network::NetworkMonitor;
use crate::remote::{RemoteError, RemoteFailureReason, RemoteRecordStore};
use crate::storage::entities::{FieldMap, PendingChange, RecordId};
use crate::storage::pending::PendingChangeStore;
use crate::sync::SyncConfig;

/// 同一条记录的一组待同步修改，合并为一次远端更新
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeGroup {
    pub record_id: RecordId,
    pub fields: FieldMap,
    /// 参与合并的本地条目 ID，成功后逐个删除
    pub change_ids: Vec<u64>,
}

/// 按记录分组，同一字段 ID 更大的值覆盖更小的
pub fn group_changes(mut changes: Vec<PendingChange>) -> Vec<ChangeGroup> {
    changes.sort_by_key(|change| change.id);

    let mut groups: BTreeMap<RecordId, ChangeGroup> = BTreeMap::new();
    for change in changes {
        let group = groups
            .entry(change.record_id.clone())
            .or_insert_with(|| ChangeGroup {
                record_id: change.record_id.clone(),
                fields: FieldMap::new(),
                change_ids: Vec::new(),
            });
        group.fields.insert(change.field, change.value);
        group.change_ids.push(change.id);
    }
    groups.into_values().collect()
}

/// 一次刷写的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// 快照中的条目数
    pub snapshot_size: usize,
    pub synced_records: Vec<RecordId>,
    pub failed_records: Vec<(RecordId, RemoteFailureReason)>,
    /// 成功删除的条目数
    pub removed: usize,
    /// 移入死信区的条目数
    pub dead_lettered: usize,
}

/// 刷写调用的结果
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// 离线，未做任何事
    SkippedOffline,
    /// 已有刷写在进行
    SkippedBusy,
    Completed(FlushReport),
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// 同步统计信息
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub flush_completed_total: u64,
    pub skipped_offline_total: u64,
    pub skipped_busy_total: u64,
    pub remote_call_total: u64,
    pub remote_failure_total: u64,
    pub changes_removed_total: u64,
    pub changes_dead_lettered_total: u64,
}

impl SyncMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.remote_call_total == 0 {
            0.0
        } else {
            (self.remote_call_total - self.remote_failure_total) as f64 / self.remote_call_total as f64
        }
    }
}

/// 刷写标志守卫，离开作用域（包括 future 被取消）时释放
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlushGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 远端写入闸门
///
/// 协调器刷写与字段写入器的直接写入共用，二者对远端的写入互不交错，
/// 远端不会在新值之后再收到旧值。
pub type WriteGate = Arc<tokio::sync::Mutex<()>>;

/// 同步协调器
pub struct SyncCoordinator {
    store: Arc<dyn PendingChangeStore>,
    remote: Arc<dyn RemoteRecordStore>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    config: SyncConfig,
    flushing: AtomicBool,
    write_gate: WriteGate,
    metrics: RwLock<SyncMetrics>,
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("flushing", &self.is_flushing())
            .field("metrics", &*self.metrics.read())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn PendingChangeStore>,
        remote: Arc<dyn RemoteRecordStore>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            network,
            events,
            config,
            flushing: AtomicBool::new(false),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            metrics: RwLock::new(SyncMetrics::default()),
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics.read().clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 交给字段写入器共用的写入闸门
    pub fn write_gate(&self) -> WriteGate {
        self.write_gate.clone()
    }

    /// 尝试把待同步日志写入远端
    ///
    /// 远端失败不会作为错误返回，只体现在报告里；只有读取本地日志失败才返回错误。
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let _guard = match FlushGuard::try_acquire(&self.flushing) {
            Some(guard) => guard,
            None => {
                debug!("已有刷写在进行，跳过本次触发");
                self.metrics.write().skipped_busy_total += 1;
                return Ok(FlushOutcome::SkippedBusy);
            }
        };

        if !self.network.is_online().await {
            debug!("离线，跳过刷写");
            self.metrics.write().skipped_offline_total += 1;
            return Ok(FlushOutcome::SkippedOffline);
        }

        // 快照到最后一组写完都持有闸门，期间的直接写入排在本次刷写之后
        let _gate = self.write_gate.lock().await;
        let snapshot = self.store.list_all().await?;
        let mut report = FlushReport {
            snapshot_size: snapshot.len(),
            ..FlushReport::default()
        };
        if snapshot.is_empty() {
            self.metrics.write().flush_completed_total += 1;
            return Ok(FlushOutcome::Completed(report));
        }

        let groups = group_changes(snapshot);
        info!("🔄 开始刷写 {} 条修改，涉及 {} 条记录", report.snapshot_size, groups.len());
        self.events.emit(SyncEvent::FlushStarted {
            pending: report.snapshot_size,
            timestamp: now_millis(),
        });

        for group in groups {
            self.flush_group(group, &mut report).await;
        }

        let remaining = match self.store.count().await {
            Ok(count) => count,
            Err(e) => {
                warn!("读取剩余待同步条目数失败: {}", e);
                report
                    .snapshot_size
                    .saturating_sub(report.removed + report.dead_lettered)
            }
        };
        info!(
            "刷写完成: 成功 {} 条记录, 失败 {} 条记录, 死信 {} 条, 剩余 {} 条",
            report.synced_records.len(),
            report.failed_records.len(),
            report.dead_lettered,
            remaining
        );
        self.events.emit(SyncEvent::FlushCompleted {
            synced_records: report.synced_records.len(),
            failed_records: report.failed_records.len(),
            dead_lettered: report.dead_lettered,
            remaining,
            timestamp: now_millis(),
        });
        self.metrics.write().flush_completed_total += 1;

        Ok(FlushOutcome::Completed(report))
    }

    async fn flush_group(&self, group: ChangeGroup, report: &mut FlushReport) {
        let result = self.apply_with_timeout(&group.record_id, &group.fields).await;
        self.metrics.write().remote_call_total += 1;

        match result {
            Ok(()) => {
                let mut removed = 0usize;
                for id in &group.change_ids {
                    match self.store.remove(*id).await {
                        Ok(()) => removed += 1,
                        // 条目留在日志里，下一轮会再次发送同样的值
                        Err(e) => warn!("删除已同步条目 #{} 失败: {}", id, e),
                    }
                }
                debug!("记录 {} 已同步 {} 个字段", group.record_id, group.fields.len());
                self.metrics.write().changes_removed_total += removed as u64;
                report.removed += removed;
                self.events.emit(SyncEvent::RecordSynced {
                    record_id: group.record_id.clone(),
                    fields: group.fields.keys().cloned().collect(),
                    timestamp: now_millis(),
                });
                report.synced_records.push(group.record_id);
            }
            Err(error) => {
                self.metrics.write().remote_failure_total += 1;
                if !error.is_retryable() && self.config.dead_letter_rejected {
                    self.dead_letter_group(&group, &error, report).await;
                } else {
                    warn!("记录 {} 同步失败，保留到下一轮: {}", group.record_id, error);
                }
                self.events.emit(SyncEvent::RecordSyncFailed {
                    record_id: group.record_id.clone(),
                    reason: error.to_string(),
                    retryable: error.is_retryable(),
                    timestamp: now_millis(),
                });
                report.failed_records.push((group.record_id, error.reason));
            }
        }
    }

    async fn dead_letter_group(&self, group: &ChangeGroup, error: &RemoteError, report: &mut FlushReport) {
        match self.store.dead_letter(&group.change_ids, &error.to_string()).await {
            Ok(moved) => {
                warn!("记录 {} 被远端拒绝，{} 条修改移入死信区: {}", group.record_id, moved, error);
                self.metrics.write().changes_dead_lettered_total += moved as u64;
                report.dead_lettered += moved;
                self.events.emit(SyncEvent::ChangesDeadLettered {
                    record_id: group.record_id.clone(),
                    count: moved,
                    reason: error.to_string(),
                    timestamp: now_millis(),
                });
            }
            Err(e) => warn!("记录 {} 移入死信区失败，保留到下一轮: {}", group.record_id, e),
        }
    }

    async fn apply_with_timeout(
        &self,
        record_id: &RecordId,
        fields: &FieldMap,
    ) -> std::result::Result<(), RemoteError> {
        let limit = Duration::from_millis(self.config.remote_timeout_ms);
        match tokio::time::timeout(limit, self.remote.apply_update(record_id, fields)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::new(
                RemoteFailureReason::NetworkTimeout,
                format!("远端 {}ms 内未响应", self.config.remote_timeout_ms),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ManualNetworkListener, NetworkStatus};
    use crate::remote::testing::ScriptedRemote;
    use crate::storage::entities::fields;
    use crate::storage::pending::MemoryPendingChangeStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryPendingChangeStore>,
        remote: Arc<ScriptedRemote>,
        network: Arc<NetworkMonitor>,
        coordinator: SyncCoordinator,
    }

    async fn fixture(online: bool, config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryPendingChangeStore::new());
        let remote = Arc::new(ScriptedRemote::new());
        let network = Arc::new(NetworkMonitor::new(Arc::new(ManualNetworkListener::new(online))));
        network.start().await.unwrap();
        let coordinator = SyncCoordinator::new(
            store.clone(),
            remote.clone(),
            network.clone(),
            Arc::new(EventManager::default()),
            config,
        );
        Fixture {
            store,
            remote,
            network,
            coordinator,
        }
    }

    fn completed(outcome: FlushOutcome) -> FlushReport {
        match outcome {
            FlushOutcome::Completed(report) => report,
            other => panic!("expected a completed flush, got {:?}", other),
        }
    }

    #[test]
    fn test_group_changes_later_id_wins() {
        let change = |id: u64, record: &str, field: &str, value: i64| PendingChange {
            id,
            record_id: RecordId::from(record),
            field: field.to_string(),
            value: json!(value),
            timestamp: 0,
        };
        let groups = group_changes(vec![
            change(5, "a", "x", 3),
            change(1, "a", "x", 1),
            change(2, "b", "x", 2),
            change(3, "a", "y", 4),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].record_id, RecordId::from("a"));
        assert_eq!(groups[0].fields.get("x"), Some(&json!(3)));
        assert_eq!(groups[0].fields.get("y"), Some(&json!(4)));
        assert_eq!(groups[0].change_ids, vec![1, 3, 5]);
        assert_eq!(groups[1].change_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_fields_of_one_record_are_sent_together() {
        let f = fixture(true, SyncConfig::default()).await;
        f.store.record(RecordId::from("A"), "x", json!(1)).await.unwrap();
        f.store.record(RecordId::from("A"), "y", json!(2)).await.unwrap();

        let report = completed(f.coordinator.flush().await.unwrap());

        let calls = f.remote.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, RecordId::from("A"));
        assert_eq!(serde_json::Value::Object(calls[0].1.clone()), json!({"x": 1, "y": 2}));
        assert_eq!(report.removed, 2);
        assert_eq!(f.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_record_does_not_block_others() {
        let f = fixture(true, SyncConfig::default()).await;
        f.remote.fail_record("A", RemoteFailureReason::ServerError(503));
        f.store.record(RecordId::from("A"), "x", json!(1)).await.unwrap();
        f.store.record(RecordId::from("B"), "x", json!(2)).await.unwrap();

        let report = completed(f.coordinator.flush().await.unwrap());

        assert_eq!(report.synced_records, vec![RecordId::from("B")]);
        assert_eq!(
            report.failed_records,
            vec![(RecordId::from("A"), RemoteFailureReason::ServerError(503))]
        );
        let left = f.store.list_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record_id, RecordId::from("A"));
    }

    #[tokio::test]
    async fn test_overlapping_flushes_run_once() {
        let f = fixture(true, SyncConfig::default()).await;
        f.remote.set_delay(Duration::from_millis(100));
        f.store.record(RecordId::from("A"), "x", json!(1)).await.unwrap();

        let (first, second) = tokio::join!(f.coordinator.flush(), f.coordinator.flush());

        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| **o == FlushOutcome::SkippedBusy).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.report().is_some()).count(), 1);
        assert_eq!(f.remote.call_count(), 1);
        assert!(!f.coordinator.is_flushing());
        assert_eq!(f.coordinator.metrics().skipped_busy_total, 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_is_retried_next_cycle() {
        let f = fixture(true, SyncConfig::default()).await;
        f.remote.fail_all(RemoteFailureReason::NetworkUnavailable);
        f.store.record(RecordId::from(42u64), fields::CURRENT_ROW, json!(7)).await.unwrap();

        completed(f.coordinator.flush().await.unwrap());
        assert_eq!(f.store.count().await.unwrap(), 1);

        f.remote.heal();
        let report = completed(f.coordinator.flush().await.unwrap());
        assert_eq!(report.removed, 1);
        assert_eq!(f.store.count().await.unwrap(), 0);
        assert_eq!(f.remote.applied(42u64).unwrap().get(fields::CURRENT_ROW), Some(&json!(7)));
    }

    #[tokio::test]
    async fn test_offline_change_is_sent_once_back_online() {
        let f = fixture(false, SyncConfig::default()).await;
        f.store.record(RecordId::from(42u64), fields::CURRENT_ROW, json!(7)).await.unwrap();

        assert_eq!(f.coordinator.flush().await.unwrap(), FlushOutcome::SkippedOffline);
        assert_eq!(f.remote.call_count(), 0);

        f.network.set_status(NetworkStatus::Online).await;
        completed(f.coordinator.flush().await.unwrap());

        let calls = f.remote.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(serde_json::Value::Object(calls[0].1.clone()), json!({"current_row": 7}));
        assert!(f.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_latest_value_reaches_remote() {
        let f = fixture(true, SyncConfig::default()).await;
        f.store.record(RecordId::from(42u64), fields::CURRENT_ROW, json!(7)).await.unwrap();
        f.store.record(RecordId::from(42u64), fields::CURRENT_ROW, json!(9)).await.unwrap();

        completed(f.coordinator.flush().await.unwrap());

        let calls = f.remote.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.get(fields::CURRENT_ROW), Some(&json!(9)));
        assert_eq!(f.remote.applied(42u64).unwrap().get(fields::CURRENT_ROW), Some(&json!(9)));
    }

    #[tokio::test]
    async fn test_transient_failures_never_drop_changes() {
        let f = fixture(true, SyncConfig::default()).await;
        f.remote.fail_all(RemoteFailureReason::ServerError(500));
        f.store.record(RecordId::from(42u64), fields::CURRENT_ROW, json!(7)).await.unwrap();

        for _ in 0..3 {
            completed(f.coordinator.flush().await.unwrap());
        }

        assert_eq!(f.remote.call_count(), 3);
        assert_eq!(f.store.count().await.unwrap(), 1);
        assert_eq!(f.coordinator.metrics().remote_failure_total, 3);
        assert_eq!(f.coordinator.metrics().success_rate(), 0.0);

        f.remote.heal();
        completed(f.coordinator.flush().await.unwrap());
        assert_eq!(f.store.count().await.unwrap(), 0);
        assert_eq!(f.coordinator.metrics().success_rate(), 0.25);
    }

    #[tokio::test]
    async fn test_permanent_rejection_moves_to_dead_letters() {
        let f = fixture(true, SyncConfig::default()).await;
        f.remote.fail_record("A", RemoteFailureReason::Rejected(422));
        f.store.record(RecordId::from("A"), "x", json!("bad")).await.unwrap();
        f.store.record(RecordId::from("A"), "y", json!(1)).await.unwrap();

        let report = completed(f.coordinator.flush().await.unwrap());

        assert_eq!(report.dead_lettered, 2);
        assert_eq!(f.store.count().await.unwrap(), 0);
        let dead = f.store.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 2);
        assert!(dead[0].reason.contains("422"));

        // 死信不再重试
        completed(f.coordinator.flush().await.unwrap());
        assert_eq!(f.remote.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rejection_kept_when_dead_letters_disabled() {
        let config = SyncConfig {
            dead_letter_rejected: false,
            ..SyncConfig::default()
        };
        let f = fixture(true, config).await;
        f.remote.fail_record("A", RemoteFailureReason::NotFound);
        f.store.record(RecordId::from("A"), "x", json!(1)).await.unwrap();

        let report = completed(f.coordinator.flush().await.unwrap());

        assert_eq!(report.dead_lettered, 0);
        assert_eq!(f.store.count().await.unwrap(), 1);
        assert!(f.store.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hung_remote_call_times_out() {
        let config = SyncConfig {
            remote_timeout_ms: 50,
            ..SyncConfig::default()
        };
        let f = fixture(true, config).await;
        f.remote.set_delay(Duration::from_secs(5));
        f.store.record(RecordId::from("A"), "x", json!(1)).await.unwrap();

        let report = completed(f.coordinator.flush().await.unwrap());

        assert_eq!(
            report.failed_records,
            vec![(RecordId::from("A"), RemoteFailureReason::NetworkTimeout)]
        );
        assert_eq!(f.store.count().await.unwrap(), 1);
        assert!(!f.coordinator.is_flushing());
    }

    #[tokio::test]
    async fn test_edit_during_flush_survives() {
        let f = fixture(true, SyncConfig::default()).await;
        f.remote.set_delay(Duration::from_millis(100));
        f.store.record(RecordId::from("A"), "x", json!(1)).await.unwrap();

        let edit = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.store.record(RecordId::from("A"), "x", json!(2)).await.unwrap()
        };
        let (outcome, newer) = tokio::join!(f.coordinator.flush(), edit);
        completed(outcome.unwrap());

        let left = f.store.list_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, newer.id);
        assert_eq!(left[0].value, json!(2));
    }

    #[tokio::test]
    async fn test_flush_waits_for_write_gate() {
        let f = fixture(true, SyncConfig::default()).await;
        f.store.record(RecordId::from(42u64), fields::CURRENT_ROW, json!(3)).await.unwrap();
        let gate = f.coordinator.write_gate();
        let held = gate.lock().await;

        let (outcome, calls_while_held) = tokio::join!(f.coordinator.flush(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let calls = f.remote.call_count();
            drop(held);
            calls
        });

        assert_eq!(calls_while_held, 0);
        assert_eq!(completed(outcome.unwrap()).synced_records, vec![RecordId::from(42u64)]);
        assert!(format!("{:?}", f.coordinator).contains("SyncCoordinator"));
    }

    #[tokio::test]
    async fn test_flush_publishes_events() {
        let f = fixture(true, SyncConfig::default()).await;
        let mut events = f.coordinator.events.subscribe();
        f.store.record(RecordId::from("A"), "x", json!(1)).await.unwrap();

        completed(f.coordinator.flush().await.unwrap());

        let mut types = Vec::new();
        while let Ok(event) = events.try_recv() {
            types.push(event.event_type());
        }
        assert_eq!(types, vec!["flush_started", "record_synced", "flush_completed"]);
    }
}
