//! SDK 主入口 - 组装存储、网络、写入器与同步协调器

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StrikkeSDKError};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatusListener};
use crate::remote::RemoteRecordStore;
use crate::storage::entities::{DeadLetter, PendingChange, RecordId};
use crate::storage::kv::KvStore;
use crate::storage::pending::{PendingChangeStore, SledPendingChangeStore};
use crate::sync::{
    FieldWriter, FieldWriterConfig, FlushOutcome, SyncConfig, SyncCoordinator, SyncMetrics, SyncService,
    SyncServiceHandle, WriteOutcome,
};

/// Strikke SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikkeConfig {
    /// 数据存储目录（待同步日志位于 `{data_dir}/kv`）
    pub data_dir: PathBuf,
    /// 同步配置
    pub sync: SyncConfig,
    /// 字段写入器配置
    pub writer: FieldWriterConfig,
    /// 同步事件通道容量
    pub event_capacity: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for StrikkeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strikke_data"),
            sync: SyncConfig::default(),
            writer: FieldWriterConfig::default(),
            event_capacity: 256,
            debug_mode: false,
        }
    }
}

impl StrikkeConfig {
    pub fn builder() -> StrikkeConfigBuilder {
        StrikkeConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StrikkeSDKError::Config("数据目录不能为空".to_string()));
        }
        if self.sync.flush_interval_ms == 0 {
            return Err(StrikkeSDKError::Config("同步周期不能为 0".to_string()));
        }
        if self.sync.remote_timeout_ms == 0 {
            return Err(StrikkeSDKError::Config("远端写入超时不能为 0".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(StrikkeSDKError::Config("事件通道容量不能为 0".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct StrikkeConfigBuilder {
    config: StrikkeConfig,
}

impl StrikkeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config.sync = config;
        self
    }

    /// 周期刷写间隔（毫秒）
    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync.flush_interval_ms = ms;
        self
    }

    pub fn remote_timeout_ms(mut self, ms: u64) -> Self {
        self.config.sync.remote_timeout_ms = ms;
        self
    }

    pub fn dead_letter_rejected(mut self, enabled: bool) -> Self {
        self.config.sync.dead_letter_rejected = enabled;
        self
    }

    pub fn writer_config(mut self, config: FieldWriterConfig) -> Self {
        self.config.writer = config;
        self
    }

    /// 覆盖某个字段的防抖时间（毫秒）
    pub fn field_debounce_ms(mut self, field: impl Into<String>, ms: u64) -> Self {
        self.config.writer.field_debounce_ms.insert(field.into(), ms);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> StrikkeConfig {
        self.config
    }
}

/// 统一 SDK 主接口
///
/// 分层：
/// - 存储层：PendingChangeStore（sled）
/// - 网络层：NetworkMonitor
/// - 同步层：FieldWriter / SyncCoordinator / SyncService
/// - 事件层：EventManager
pub struct StrikkeSDK {
    config: StrikkeConfig,
    store: Arc<dyn PendingChangeStore>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    coordinator: Arc<SyncCoordinator>,
    writer: FieldWriter,
    sync_service: SyncService,
    shutting_down: AtomicBool,
}

impl StrikkeSDK {
    /// 初始化 SDK，待同步日志保存在 `config.data_dir` 下
    pub async fn initialize(
        config: StrikkeConfig,
        remote: Arc<dyn RemoteRecordStore>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let kv = KvStore::new(&config.data_dir).await?;
        match kv.stats() {
            Ok(stats) => info!(
                "📦 KV 存储已打开 {}: {} 个 Tree, 占用 {} 字节",
                kv.base_path().display(),
                stats.tree_count,
                stats.size_on_disk
            ),
            Err(e) => warn!("读取 KV 存储统计失败 {}: {}", kv.base_path().display(), e),
        }
        let store: Arc<dyn PendingChangeStore> = Arc::new(SledPendingChangeStore::open(&kv)?);
        Self::initialize_with_store(config, store, remote, listener).await
    }

    /// 使用外部提供的存储初始化（例如没有可写目录时使用内存存储）
    pub async fn initialize_with_store(
        config: StrikkeConfig,
        store: Arc<dyn PendingChangeStore>,
        remote: Arc<dyn RemoteRecordStore>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 StrikkeSDK ({})...", crate::version::version_string());
        config.validate()?;

        let network = Arc::new(NetworkMonitor::new(listener));
        network.start().await?;

        let events = Arc::new(EventManager::new(config.event_capacity));
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            remote.clone(),
            network.clone(),
            events.clone(),
            config.sync.clone(),
        ));
        let writer = FieldWriter::new(
            store.clone(),
            remote,
            network.clone(),
            events.clone(),
            config.writer.clone(),
            config.sync.remote_timeout(),
            coordinator.write_gate(),
        );
        let sync_service = SyncService::new(coordinator.clone(), network.clone(), config.sync.flush_interval());

        let pending = store.count().await?;
        info!("✅ StrikkeSDK 初始化完成，待同步修改 {} 条", pending);
        if config.debug_mode {
            debug!("SDK 配置: {:?}", config);
        }

        Ok(Arc::new(Self {
            config,
            store,
            network,
            events,
            coordinator,
            writer,
            sync_service,
            shutting_down: AtomicBool::new(false),
        }))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(StrikkeSDKError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &StrikkeConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// 缓冲一次字段修改，等待下一次刷写
    ///
    /// 用于直接写远端失败或被跳过之后。存储不可用时返回错误，调用方不应假定修改已保存。
    pub async fn queue_field_change(
        &self,
        record_id: impl Into<RecordId>,
        field: &str,
        value: serde_json::Value,
    ) -> Result<PendingChange> {
        self.ensure_active()?;
        let change = self.store.record(record_id.into(), field, value).await?;
        self.events.emit(SyncEvent::ChangeQueued {
            change_id: change.id,
            record_id: change.record_id.clone(),
            field: change.field.clone(),
            timestamp: now_millis(),
        });
        Ok(change)
    }

    /// 防抖保存（编辑器使用）
    pub fn save_field(&self, record_id: impl Into<RecordId>, field: &str, value: serde_json::Value) -> Result<()> {
        self.ensure_active()?;
        self.writer.save(record_id.into(), field, value);
        Ok(())
    }

    /// 立即保存：在线时直接写远端，否则写入待同步日志
    pub async fn save_field_now(
        &self,
        record_id: impl Into<RecordId>,
        field: &str,
        value: serde_json::Value,
    ) -> Result<WriteOutcome> {
        self.ensure_active()?;
        self.writer.save_now(record_id.into(), field, value).await
    }

    /// 启动同步服务（网络恢复 + 周期刷写）
    pub fn start_sync_service(&self) -> Result<SyncServiceHandle> {
        self.ensure_active()?;
        self.sync_service.start()
    }

    pub fn is_sync_service_running(&self) -> bool {
        self.sync_service.is_running()
    }

    /// 立即尝试一次刷写
    pub async fn flush_now(&self) -> Result<FlushOutcome> {
        self.coordinator.flush().await
    }

    pub async fn pending_changes(&self) -> Result<Vec<PendingChange>> {
        self.store.list_all().await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.store.count().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.store.list_dead_letters().await
    }

    pub async fn clear_dead_letters(&self) -> Result<usize> {
        self.store.clear_dead_letters().await
    }

    pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn sync_metrics(&self) -> SyncMetrics {
        self.coordinator.metrics()
    }

    /// 关闭 SDK
    ///
    /// 写出尚未触发的防抖保存，通知同步服务退出，停止网络监控。
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("正在关闭 StrikkeSDK...");

        let result = self.writer.flush().await;
        if let Err(e) = &result {
            error!("关闭时写出防抖保存失败: {}", e);
        }
        self.sync_service.signal_stop();
        self.network.stop().await;

        let metrics = self.coordinator.metrics();
        info!(
            "StrikkeSDK 关闭完成，共刷写 {} 次，远端调用 {} 次，成功率 {:.1}%",
            metrics.flush_completed_total,
            metrics.remote_call_total,
            metrics.success_rate() * 100.0
        );
        result.map(|_| ())
    }
}
