//! Strikke SDK - 针织计数应用的离线写缓冲与同步
//!
//! 本 SDK 提供：
//! - 💾 设备本地的待同步日志：同一 (记录, 字段) 只保留最新值，崩溃后不丢
//! - 🔄 同步协调器：按记录合并修改，一次远端更新一条记录，同一时间最多一次刷写
//! - 📡 网络状态监控：网络恢复与周期定时自动刷写
//! - ✏️ 编辑器防抖保存：在线直接写远端，失败或离线时写入待同步日志
//! - ⚙️ 同步事件：供 UI 渲染"待同步"提示
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strikke_sdk::{
//!     fields, ManualNetworkListener, PostgrestConfig, PostgrestRecordStore, StrikkeConfig, StrikkeSDK,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StrikkeConfig::builder().data_dir("/path/to/data").build();
//!     let remote = Arc::new(PostgrestRecordStore::new(PostgrestConfig::new(
//!         "https://xyz.supabase.co",
//!         "anon-key",
//!     ))?);
//!     let network = Arc::new(ManualNetworkListener::new(true));
//!
//!     let sdk = StrikkeSDK::initialize(config, remote, network.clone()).await?;
//!     let service = sdk.start_sync_service()?;
//!
//!     // 行计数器 +1
//!     sdk.save_field(42u64, fields::CURRENT_ROW, serde_json::json!(8))?;
//!
//!     // 平台回调
//!     network.set_online(false);
//!
//!     service.stop().await;
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod events;
pub mod network;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

pub use error::{Result, StrikkeSDKError};
pub use events::{EventManager, SyncEvent};
pub use network::{ManualNetworkListener, NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use remote::{PostgrestConfig, PostgrestRecordStore, RemoteError, RemoteFailureReason, RemoteRecordStore};
pub use sdk::{StrikkeConfig, StrikkeConfigBuilder, StrikkeSDK};
pub use storage::{
    fields, DeadLetter, FieldKey, FieldMap, KvStore, MemoryPendingChangeStore, PendingChange, PendingChangeStore,
    RecordId, SledPendingChangeStore,
};
pub use sync::{
    FieldWriter, FieldWriterConfig, FlushOutcome, FlushReport, SyncConfig, SyncCoordinator, SyncMetrics,
    SyncServiceHandle, WriteGate, WriteOutcome,
};
pub use version::{version_string, SDK_VERSION};
