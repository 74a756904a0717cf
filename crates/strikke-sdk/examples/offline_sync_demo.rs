//! 离线编辑 → 网络恢复 → 自动补发 的完整流程演示
//!
//! 运行：cargo run -p strikke-sdk --example offline_sync_demo

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use strikke_sdk::{
    fields, FieldMap, ManualNetworkListener, RecordId, RemoteError, RemoteRecordStore, StrikkeConfig, StrikkeSDK,
    SyncEvent,
};
use tracing::info;

/// 内存中的"远端项目表"
#[derive(Default)]
struct InMemoryProjects {
    rows: Mutex<HashMap<RecordId, FieldMap>>,
}

#[async_trait]
impl RemoteRecordStore for InMemoryProjects {
    async fn apply_update(&self, record_id: &RecordId, fields: &FieldMap) -> Result<(), RemoteError> {
        info!("☁️ 远端收到更新 {} → {}", record_id, serde_json::Value::Object(fields.clone()));
        let mut rows = self.rows.lock();
        let row = rows.entry(record_id.clone()).or_default();
        for (field, value) in fields {
            row.insert(field.clone(), value.clone());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let data_dir = tempfile::TempDir::new()?;
    let config = StrikkeConfig::builder()
        .data_dir(data_dir.path())
        .flush_interval_ms(5_000)
        .field_debounce_ms(fields::CURRENT_ROW, 100)
        .field_debounce_ms(fields::NOTES, 150)
        .build();

    let remote = Arc::new(InMemoryProjects::default());
    let network = Arc::new(ManualNetworkListener::new(false));
    let sdk = StrikkeSDK::initialize(config, remote.clone(), network.clone()).await?;

    let mut events = sdk.subscribe_sync_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SyncEvent::FlushCompleted { remaining, .. } = &event {
                info!("📣 刷写完成，剩余 {} 条待同步", remaining);
            } else {
                info!("📣 {}", event.event_type());
            }
        }
    });

    let service = sdk.start_sync_service()?;

    info!("📴 离线状态下编辑项目 42");
    for row in 5..=9 {
        sdk.save_field(42u64, fields::CURRENT_ROW, json!(row))?;
    }
    sdk.save_field(42u64, fields::NOTES, json!("decrease every 4th row"))?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    info!("待同步修改: {} 条", sdk.pending_count().await?);

    info!("📶 网络恢复");
    network.set_online(true);
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("待同步修改: {} 条", sdk.pending_count().await?);
    info!("远端项目 42: {:?}", remote.rows.lock().get(&RecordId::from(42u64)));

    service.stop().await;
    sdk.shutdown().await?;
    Ok(())
}
