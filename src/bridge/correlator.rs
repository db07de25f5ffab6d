//! 命令关联表
//!
//! 每条出站命令登记一个挂起表项，结果信封按配对键回来时唤醒等待方。
//! 每个命令挂一个独立的超时定时器；迟到或重复的结果静默丢弃，
//! 断线时所有挂起表项统一拒绝。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::core::BridgeError;

struct PendingCommand {
    issued_at: Instant,
    timeout_ms: u64,
    tx: oneshot::Sender<Result<Value, BridgeError>>,
    timer: JoinHandle<()>,
}

#[derive(Clone)]
pub struct CommandCorrelator {
    pending: Arc<Mutex<HashMap<String, PendingCommand>>>,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 登记一条挂起命令，返回等待结果的接收端。
    /// 超时后表项被摘除并以 Timeout 拒绝。
    pub async fn register_command(&self, id: &str, timeout_ms: u64) -> oneshot::Receiver<Result<Value, BridgeError>> {
        let (tx, rx) = oneshot::channel();
        let key = id.to_string();

        // 持锁期间 spawn + 插入：定时器要摘表项得先拿同一把锁，
        // 所以极短超时也不会在插入前触发
        let mut table = self.pending.lock().await;

        let timer = {
            let pending = Arc::clone(&self.pending);
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if let Some(entry) = pending.lock().await.remove(&key) {
                    tracing::debug!(command = %key, timeout_ms = entry.timeout_ms, "pending command timed out");
                    let _ = entry.tx.send(Err(BridgeError::Timeout(format!(
                        "command {} exceeded {}ms",
                        key, timeout_ms
                    ))));
                }
            })
        };

        // 同 id 重复登记：旧表项以校验错误出局，新表项顶替
        if let Some(old) = table.insert(
            key.clone(),
            PendingCommand {
                issued_at: Instant::now(),
                timeout_ms,
                tx,
                timer,
            },
        ) {
            old.timer.abort();
            tracing::warn!(command = %key, "duplicate command id, rejecting earlier registration");
            let _ = old.tx.send(Err(BridgeError::Validation(format!("duplicate command id {}", key))));
        }

        rx
    }

    /// 结果到达：摘除表项、停掉定时器、唤醒等待方。
    /// 找不到表项说明已超时或重复，丢弃即可。
    pub async fn handle_result(&self, id: &str, payload: Value) {
        let entry = self.pending.lock().await.remove(id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                tracing::debug!(
                    command = %id,
                    waited_ms = entry.issued_at.elapsed().as_millis() as u64,
                    "command resolved"
                );
                let _ = entry.tx.send(Ok(payload));
            }
            None => {
                tracing::debug!(command = %id, "dropping result for unknown or expired command");
            }
        }
    }

    /// 断线时批量拒绝所有挂起命令，返回拒绝条数
    pub async fn reject_all(&self, error: BridgeError) -> usize {
        let entries: Vec<(String, PendingCommand)> = self.pending.lock().await.drain().collect();
        let count = entries.len();
        for (id, entry) in entries {
            entry.timer.abort();
            tracing::debug!(command = %id, "rejecting pending command");
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
