//! 工作区文件系统
//!
//! SafeFs 绑定一个根目录：所有路径先做词法归一化并确认落在根内，
//! `../` 逃逸和根外绝对路径一律拒绝。写入自动建父目录。
//! 动作处理器的全部文件副作用（以及回滚的撤销）都经由这里。

use std::path::{Component, Path, PathBuf};

use crate::core::BridgeError;

#[derive(Debug, Clone)]
pub struct SafeFs {
    root: PathBuf,
}

impl SafeFs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        // 根目录可能还不存在（首次运行），canonicalize 失败就用原样
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 词法解析：相对路径接根，归一化掉 `.`/`..`，出根即拒
    pub fn resolve(&self, path: &str) -> Result<PathBuf, BridgeError> {
        let raw = Path::new(path.trim_start_matches("./"));
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.root.join(raw)
        };

        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(BridgeError::Validation(format!("path escapes workspace: {}", path)));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }

        if normalized.starts_with(&self.root) {
            Ok(normalized)
        } else {
            Err(BridgeError::Validation(format!("path escapes workspace: {}", path)))
        }
    }

    pub async fn read(&self, path: &str) -> Result<String, BridgeError> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| BridgeError::Io(format!("read {}: {}", path, e)))
    }

    pub async fn write(&self, path: &str, content: &str) -> Result<(), BridgeError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BridgeError::Io(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| BridgeError::Io(format!("write {}: {}", path, e)))
    }

    pub async fn delete(&self, path: &str) -> Result<(), BridgeError> {
        let resolved = self.resolve(path)?;
        tokio::fs::remove_file(&resolved)
            .await
            .map_err(|e| BridgeError::Io(format!("delete {}: {}", path, e)))
    }

    pub async fn create_dir(&self, path: &str) -> Result<(), BridgeError> {
        let resolved = self.resolve(path)?;
        tokio::fs::create_dir_all(&resolved)
            .await
            .map_err(|e| BridgeError::Io(format!("mkdir {}: {}", path, e)))
    }

    /// 只删空目录；回滚撤销 create_directory 用，绝不递归
    pub async fn remove_dir(&self, path: &str) -> Result<(), BridgeError> {
        let resolved = self.resolve(path)?;
        tokio::fs::remove_dir(&resolved)
            .await
            .map_err(|e| BridgeError::Io(format!("rmdir {}: {}", path, e)))
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }
}
