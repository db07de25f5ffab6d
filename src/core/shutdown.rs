//! 统一关闭流程
//!
//! 信号一到就取消根 token，持有它的后台任务各自走正常退出路径：
//! 服务器关会话、连接器批量拒绝挂起命令、引擎把任务状态落盘。
//! 随后协调器按注册顺序跑清理任务，单个清理失败或超时不拖累其余的。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

/// 关闭信号的单一源头。克隆共享同一个根 token
#[derive(Clone)]
pub struct ShutdownManager {
    cancel: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    /// 根 token，交给需要感知退出的后台任务
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        info!(?reason, "shutdown requested");
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.cancel.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM，各占一个后台任务
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 退出前要做的一件清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志里的名字
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，每个任务有独立超时
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        info!(tasks = self.tasks.len(), "running shutdown cleanup");
        let per_task = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.tasks {
            match tokio::time::timeout(per_task, task.cleanup()).await {
                Ok(Ok(())) => info!(task = task.name(), "cleanup done"),
                Ok(Err(err)) => warn!(task = task.name(), error = %err, "cleanup failed"),
                Err(_) => {
                    warn!(task = task.name(), timeout_secs = self.timeout_secs, "cleanup timed out")
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 闭包形式的清理任务（会话表清空、缓存落盘等一次性动作）
pub struct FnCleanup<F>
where
    F: Fn() + Send + Sync,
{
    name: &'static str,
    cleanup_fn: F,
}

impl<F> FnCleanup<F>
where
    F: Fn() + Send + Sync,
{
    pub fn new(name: &'static str, cleanup_fn: F) -> Self {
        Self { name, cleanup_fn }
    }
}

#[async_trait::async_trait]
impl<F> ShutdownCleanup for FnCleanup<F>
where
    F: Fn() + Send + Sync,
{
    async fn cleanup(&self) -> anyhow::Result<()> {
        (self.cleanup_fn)();
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_manager_starts_open_and_latches_on_shutdown() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
    }

    #[test]
    fn test_token_clones_share_the_same_cancellation() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::Signal);
        assert!(token.is_cancelled());
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flag"
        }
    }

    struct StuckCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for StuckCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_cleanup_tasks_run_in_registration_order() {
        let mut coordinator = ShutdownCoordinator::new();

        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(FlagCleanup {
            called: called.clone(),
        });

        let flushed = Arc::new(AtomicBool::new(false));
        let flag = flushed.clone();
        coordinator.register(FnCleanup::new("session-table", move || {
            flag.store(true, Ordering::SeqCst);
        }));

        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
        assert!(flushed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_cleanup_times_out_without_blocking_the_rest() {
        let mut coordinator = ShutdownCoordinator::new().with_timeout(0);
        coordinator.register(StuckCleanup);

        let reached = Arc::new(AtomicBool::new(false));
        let flag = reached.clone();
        coordinator.register(FnCleanup::new("after-stuck", move || {
            flag.store(true, Ordering::SeqCst);
        }));

        coordinator.run_cleanup().await;
        assert!(reached.load(Ordering::SeqCst));
    }
}
