//! UI 刷新
//!
//! 后台定时任务，每个周期在登记器锁内：
//! 1. 按引擎状态刷新每个任务的记录状态
//! 2. 把所有任务记录写回存储
//! 3. 汇总下载速度，更新总带宽
//!
//! 停止时发送关闭信号并等待后台任务退出，`stop` 返回后不会再有刷新。

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::events::RegistryEvent;
use super::manager::{RegistryShared, RegistryState};

/// 单次刷新统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub tasks: usize,
    pub changed: usize,
    pub flush_failures: usize,
    pub download_bandwidth: u64,
}

/// 刷新调度器
pub(crate) struct RefreshScheduler {
    interval: Duration,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// 启动后台刷新，已在运行时不做任何事
    pub fn start(&mut self, shared: Arc<RegistryShared>) {
        if self.is_running() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let interval = self.interval;
        self.task = Some(tokio::spawn(refresh_loop(shared, interval, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);

        info!("UI 刷新已启动，周期: {}ms", interval.as_millis());
    }

    /// 停止后台刷新并等待退出
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.task.take() {
            match handle.await {
                Ok(_) => info!("UI 刷新已停止"),
                Err(e) => error!("UI 刷新任务异常退出: {}", e),
            }
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn refresh_loop(
    shared: Arc<RegistryShared>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // 第一次 tick 立即返回，跳过它
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // 等锁期间也要响应关闭信号
                tokio::select! {
                    mut state = shared.state.lock() => {
                        refresh_pass(&shared, &mut state);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    debug!("UI 刷新循环已退出");
}

/// 执行一次刷新（调用方持有登记器锁）
pub(crate) fn refresh_pass(shared: &RegistryShared, state: &mut RegistryState) -> RefreshSummary {
    let mut summary = RefreshSummary::default();

    for task in state.collection.iter() {
        summary.tasks += 1;

        let outcome = task.refresh_from_live();
        summary.download_bandwidth += outcome.speed;

        if let Err(e) = state.tasks.put(task.id(), task.record().to_stored()) {
            summary.flush_failures += 1;
            warn!("写回任务记录失败: {}, 错误: {}", task.id(), e);
        }

        if outcome.changed {
            summary.changed += 1;
            shared.emit(RegistryEvent::TaskUpdated {
                task: task.snapshot(),
            });
        }
    }

    let previous = shared
        .download_bandwidth
        .swap(summary.download_bandwidth, Ordering::SeqCst);
    if previous != summary.download_bandwidth {
        shared.emit(RegistryEvent::BandwidthUpdated {
            download: summary.download_bandwidth,
            upload: 0,
        });
    }

    summary
}
