//! 同步服务 - 把网络恢复和周期定时两个触发源汇入同一个刷写入口

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StrikkeSDKError};
use crate::network::NetworkMonitor;
use crate::sync::coordinator::{FlushOutcome, SyncCoordinator};

/// 刷写触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// 服务启动时已在线
    Startup,
    /// 离线 → 在线
    Reconnect,
    /// 周期定时
    Periodic,
}

/// 运行标志守卫，服务任务结束（正常退出或被中止）时清除
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 同步服务
#[derive(Debug)]
pub struct SyncService {
    coordinator: Arc<SyncCoordinator>,
    network: Arc<NetworkMonitor>,
    interval: Duration,
    running: Arc<AtomicBool>,
    shutdown_signal: Mutex<Option<Arc<Notify>>>,
}

impl SyncService {
    pub fn new(coordinator: Arc<SyncCoordinator>, network: Arc<NetworkMonitor>, interval: Duration) -> Self {
        Self {
            coordinator,
            network,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_signal: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 启动服务：订阅网络变化并开启周期定时器
    ///
    /// 同一时间只允许一个服务实例运行。
    pub fn start(&self) -> Result<SyncServiceHandle> {
        if self.interval.is_zero() {
            return Err(StrikkeSDKError::Config("同步周期必须大于 0".to_string()));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StrikkeSDKError::InvalidOperation("同步服务已在运行".to_string()));
        }

        let shutdown = Arc::new(Notify::new());
        *self.shutdown_signal.lock() = Some(shutdown.clone());

        // 在 spawn 之前订阅，启动期间发生的网络变化不会丢
        let network_events = self.network.subscribe();
        let task = tokio::spawn(run_loop(
            self.coordinator.clone(),
            self.network.clone(),
            network_events,
            self.interval,
            shutdown.clone(),
            RunningGuard(self.running.clone()),
        ));

        Ok(SyncServiceHandle {
            shutdown,
            task: Some(task),
        })
    }

    /// 通知正在运行的服务退出（不等待）
    pub fn signal_stop(&self) {
        if let Some(shutdown) = self.shutdown_signal.lock().take() {
            shutdown.notify_one();
        }
    }
}

async fn run_loop(
    coordinator: Arc<SyncCoordinator>,
    network: Arc<NetworkMonitor>,
    mut network_events: broadcast::Receiver<crate::network::NetworkStatusEvent>,
    period: Duration,
    shutdown: Arc<Notify>,
    _running: RunningGuard,
) {
    info!("🔄 同步服务已启动，周期 {:?}", period);

    if network.is_online().await {
        spawn_flush(&coordinator, FlushTrigger::Startup);
    }

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut listening = true;

    loop {
        select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => spawn_flush(&coordinator, FlushTrigger::Periodic),
            event = network_events.recv(), if listening => match event {
                Ok(event) if event.is_reconnect() => {
                    info!("网络已恢复: {:?} → {:?}", event.old_status, event.new_status);
                    spawn_flush(&coordinator, FlushTrigger::Reconnect);
                }
                Ok(event) => debug!("网络状态变化: {:?} → {:?}", event.old_status, event.new_status),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // 丢失的事件里可能有恢复在线，补一次刷写
                    warn!("网络事件积压，跳过 {} 条", skipped);
                    spawn_flush(&coordinator, FlushTrigger::Reconnect);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("网络事件通道已关闭，仅保留周期刷写");
                    listening = false;
                }
            },
        }
    }

    info!("同步服务已停止");
}

fn spawn_flush(coordinator: &Arc<SyncCoordinator>, trigger: FlushTrigger) {
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        match coordinator.flush().await {
            Ok(FlushOutcome::Completed(report)) => {
                debug!("{:?} 触发的刷写完成: {:?}", trigger, report)
            }
            Ok(outcome) => debug!("{:?} 触发的刷写跳过: {:?}", trigger, outcome),
            Err(e) => error!("{:?} 触发的刷写失败: {}", trigger, e),
        }
    });
}

/// 运行中的同步服务句柄
///
/// `stop()` 会等待服务任务退出；直接丢弃句柄则中止任务。
#[derive(Debug)]
pub struct SyncServiceHandle {
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SyncServiceHandle {
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("同步服务任务异常退出: {}", e);
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for SyncServiceHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
