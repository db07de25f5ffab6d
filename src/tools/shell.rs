//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串；
//! 执行通过 sh -c / cmd /C，固定在工作区目录，带超时与 tracing 审计。
//! 与审批闸门是两道独立防线：闸门拦的是计划里标记的破坏性步骤，
//! 这里拦的是任何渠道混进来的危险命令文本。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::core::BridgeError;

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 一次命令执行的产物。非零退出码不是 Err，交给调用方定夺
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// 受限 Shell：仅允许白名单内命令，工作目录固定
pub struct ShellRunner {
    allowed_commands: HashSet<String>,
    timeout_secs: u64,
    workdir: PathBuf,
}

impl ShellRunner {
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64, workdir: impl AsRef<Path>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            timeout_secs,
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// 解析命令：只取第一个 token 作为命令名
    fn command_name<'a>(&self, raw: &'a str) -> &'a str {
        raw.split_whitespace().next().unwrap_or("")
    }

    pub fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = self.command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }

    pub async fn run(&self, raw: &str) -> Result<ShellOutput, BridgeError> {
        let command = raw.trim();
        self.is_allowed(command).map_err(BridgeError::Validation)?;

        tracing::info!(command = %command, workdir = %self.workdir.display(), "shell execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.workdir);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| BridgeError::Timeout(format!("command timed out after {}s", self.timeout_secs)))?
            .map_err(|e| BridgeError::Execution(format!("spawn failed: {}", e)))?;

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ShellRunner {
        let workdir = std::env::temp_dir();
        ShellRunner::new(vec!["echo".into(), "ls".into(), "cat".into()], 5, workdir)
    }

    #[tokio::test]
    async fn test_allowed_command_runs() {
        let out = runner().run("echo hello").await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let out = runner().run("ls /definitely_missing_path_axon").await.unwrap();
        assert_ne!(out.exit_code, 0);
        assert!(!out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_command_rejected() {
        let err = runner().run("python3 -c 'print(1)'").await.unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
        assert!(err.to_string().contains("not in allowlist"));
    }

    #[tokio::test]
    async fn test_forbidden_pattern_rejected_even_if_listed() {
        // ls 在白名单里，但带禁用子串照样拦下
        let err = runner().run("ls; rm -rf /tmp/whatever").await.unwrap_err();
        assert!(err.to_string().contains("Forbidden pattern"));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        assert!(runner().run("   ").await.is_err());
    }
}
