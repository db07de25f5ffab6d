//! 任务持久化
//!
//! 进程随时可能被杀，任务状态每次变更都落一笔快照。默认内存实现给测试
//! 和轻量场景，配置了目录就换文件实现。记录按时间戳淘汰，坏档跳过不拖死
//! 整个列表。

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::error::BridgeError;
use crate::task::types::PersistedTaskState;

pub const MAX_PERSISTED_TASKS: usize = 20;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task_state(&self, state: &PersistedTaskState) -> Result<(), BridgeError>;

    /// 按时间戳倒序，最新在前
    async fn get_persisted_tasks(&self) -> Result<Vec<PersistedTaskState>, BridgeError>;

    async fn get_persisted_task(&self, task_id: &str) -> Result<Option<PersistedTaskState>, BridgeError>;

    /// 幂等，记录不存在也返回 Ok
    async fn remove_persisted_task(&self, task_id: &str) -> Result<(), BridgeError>;

    /// 超上限时淘汰最旧记录，返回删掉的条数
    async fn cleanup_old_tasks(&self) -> Result<usize, BridgeError>;
}

pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, PersistedTaskState>>,
    max_tasks: usize,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PERSISTED_TASKS)
    }

    pub fn with_capacity(max_tasks: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            max_tasks: max_tasks.max(1),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save_task_state(&self, state: &PersistedTaskState) -> Result<(), BridgeError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(state.id.clone(), state.clone());
        while tasks.len() > self.max_tasks {
            let oldest = tasks
                .values()
                .min_by_key(|s| s.timestamp)
                .map(|s| s.id.clone());
            match oldest {
                Some(id) => {
                    tasks.remove(&id);
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn get_persisted_tasks(&self) -> Result<Vec<PersistedTaskState>, BridgeError> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<PersistedTaskState> = tasks.values().cloned().collect();
        list.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
        Ok(list)
    }

    async fn get_persisted_task(&self, task_id: &str) -> Result<Option<PersistedTaskState>, BridgeError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn remove_persisted_task(&self, task_id: &str) -> Result<(), BridgeError> {
        self.tasks.write().await.remove(task_id);
        Ok(())
    }

    async fn cleanup_old_tasks(&self) -> Result<usize, BridgeError> {
        let mut tasks = self.tasks.write().await;
        let mut removed = 0;
        while tasks.len() > self.max_tasks {
            let oldest = tasks
                .values()
                .min_by_key(|s| s.timestamp)
                .map(|s| s.id.clone());
            match oldest {
                Some(id) => {
                    tasks.remove(&id);
                    removed += 1;
                }
                None => break,
            }
        }
        Ok(removed)
    }
}

/// 一任务一文件，文件名取自任务 id（非法字符替换成下划线）
pub struct FileTaskStore {
    dir: PathBuf,
    max_tasks: usize,
}

impl FileTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_tasks: MAX_PERSISTED_TASKS,
        }
    }

    pub fn with_capacity(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks.max(1);
        self
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        let sanitized: String = task_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }

    async fn load_all(&self) -> Result<Vec<PersistedTaskState>, BridgeError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable task record");
                    continue;
                }
            };
            match serde_json::from_str::<PersistedTaskState>(&raw) {
                Ok(state) => out.push(state),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping corrupted task record");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save_task_state(&self, state: &PersistedTaskState) -> Result<(), BridgeError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(self.task_path(&state.id), json).await?;
        self.cleanup_old_tasks().await?;
        Ok(())
    }

    async fn get_persisted_tasks(&self) -> Result<Vec<PersistedTaskState>, BridgeError> {
        let mut list = self.load_all().await?;
        list.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
        Ok(list)
    }

    async fn get_persisted_task(&self, task_id: &str) -> Result<Option<PersistedTaskState>, BridgeError> {
        let path = self.task_path(task_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupted task record treated as missing");
                Ok(None)
            }
        }
    }

    async fn remove_persisted_task(&self, task_id: &str) -> Result<(), BridgeError> {
        match tokio::fs::remove_file(self.task_path(task_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn cleanup_old_tasks(&self) -> Result<usize, BridgeError> {
        let mut list = self.load_all().await?;
        if list.len() <= self.max_tasks {
            return Ok(0);
        }
        list.sort_by_key(|s| s.timestamp);
        let excess = list.len() - self.max_tasks;
        let mut removed = 0;
        for state in list.into_iter().take(excess) {
            if self.remove_persisted_task(&state.id).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// 配置了目录走文件存储，否则留在内存
pub fn create_task_store(persist_dir: Option<&str>, max_tasks: usize) -> Arc<dyn TaskStore> {
    match persist_dir {
        Some(dir) if !dir.trim().is_empty() => {
            info!(dir = %dir, "task persistence on disk");
            Arc::new(FileTaskStore::new(dir).with_capacity(max_tasks))
        }
        _ => {
            info!("task persistence in memory only");
            Arc::new(MemoryTaskStore::with_capacity(max_tasks))
        }
    }
}
