use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

impl NetworkStatus {
    /// 是否可以尝试远端写入
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }

    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    pub fn new(old_status: NetworkStatus, new_status: NetworkStatus) -> Self {
        Self {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 从离线恢复到在线
    pub fn is_reconnect(&self) -> bool {
        !self.old_status.is_online() && self.new_status.is_online()
    }
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS/WebView）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Offline)),
            forward_task: Mutex::new(None),
        }
    }

    /// 启动网络监控
    ///
    /// 先以平台当前状态作为初始值，再转发平台的状态变化。
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        *self.current_status.write().await = initial.clone();
        info!("网络监控启动，当前状态: {:?}", initial);

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        {
                            let mut status = current_status.write().await;
                            *status = event.new_status.clone();
                        }
                        debug!("网络状态变化: {:?} → {:?}", event.old_status, event.new_status);
                        let _ = status_sender.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.forward_task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// 停止网络监控
    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
        if let Some(handle) = self.forward_task.lock().take() {
            handle.abort();
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        self.current_status.read().await.clone()
    }

    /// 手动设置网络状态（例如远端写入超时后由宿主标记离线）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            std::mem::replace(&mut *status, new_status.clone())
        };
        if old_status != new_status {
            let _ = self
                .status_sender
                .send(NetworkStatusEvent::new(old_status, new_status));
        }
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 检查网络连接（通过网络状态判断）
    pub async fn is_online(&self) -> bool {
        self.get_status().await.is_online()
    }
}

/// 由宿主手动推送状态的监听器
///
/// 适用于只能拿到 online/offline 回调的平台（例如 WebView 的 `navigator.onLine`）。
#[derive(Debug)]
pub struct ManualNetworkListener {
    status: Mutex<NetworkStatus>,
    sender: Mutex<Option<broadcast::Sender<NetworkStatusEvent>>>,
}

impl ManualNetworkListener {
    pub fn new(online: bool) -> Self {
        Self {
            status: Mutex::new(NetworkStatus::from_online(online)),
            sender: Mutex::new(None),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.set_status(NetworkStatus::from_online(online));
    }

    pub fn set_status(&self, new_status: NetworkStatus) {
        let old_status = std::mem::replace(&mut *self.status.lock(), new_status.clone());
        if old_status == new_status {
            return;
        }
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(NetworkStatusEvent::new(old_status, new_status));
        }
    }
}

#[async_trait]
impl NetworkStatusListener for ManualNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        self.status.lock().clone()
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        let mut sender = self.sender.lock();
        match sender.as_ref() {
            Some(existing) => Ok(existing.subscribe()),
            None => {
                let (tx, rx) = broadcast::channel(16);
                *sender = Some(tx);
                Ok(rx)
            }
        }
    }

    async fn stop_monitoring(&self) {
        *self.sender.lock() = None;
    }
}
