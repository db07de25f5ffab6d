//! 应用配置：从 config/axon.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AXON__*` 覆盖（双下划线表示嵌套，
//! 如 `AXON__CONNECTOR__URL=ws://10.0.0.2:9000`）。各段都有可独立运行的默认值。

use std::path::PathBuf;

use serde::Deserialize;

use crate::bridge::connector::ConnectorConfig;
use crate::bridge::server::ServerConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::task::engine::{ApprovalConfig, ApprovalMode, EngineConfig};

/// 配置根（对应 config/axon.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AxonConfig {
    pub server: ServerSection,
    pub connector: ConnectorSection,
    pub engine: EngineSection,
    pub persistence: PersistenceSection,
    pub orchestrator: OrchestratorSection,
    pub llm: LlmSection,
    pub workspace: WorkspaceSection,
    pub shell: ShellSection,
}

/// [server] 段：中心路由服务器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    pub ping_interval_secs: u64,
    pub session_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            ping_interval_secs: 30,
            session_timeout_secs: 90,
        }
    }
}

/// [connector] 段：对外的客户端连接
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorSection {
    pub url: String,
    /// 信封 source，服务器按它登记会话
    pub name: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_ms: u64,
    pub pong_grace_ms: u64,
    pub message_queue_max: usize,
    pub command_timeout_ms: u64,
}

impl Default for ConnectorSection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000".to_string(),
            name: "axon".to_string(),
            reconnect_interval_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            ping_interval_ms: 30_000,
            pong_grace_ms: 75_000,
            message_queue_max: 100,
            command_timeout_ms: 30_000,
        }
    }
}

/// [engine] 段：执行引擎与审批
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_parallel_steps: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub step_timeout_secs: u64,
    pub abort_on_denial: bool,
    /// auto / channel / console / webhook
    pub approval_mode: String,
    /// 0 表示一直等
    pub approval_timeout_ms: u64,
    pub approval_webhook_url: Option<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel_steps: 2,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            step_timeout_secs: 300,
            abort_on_denial: false,
            approval_mode: "channel".to_string(),
            approval_timeout_ms: 60_000,
            approval_webhook_url: None,
        }
    }
}

/// [persistence] 段：任务落盘。不配目录就留在内存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub dir: Option<String>,
    pub max_tasks: usize,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            dir: None,
            max_tasks: crate::task::persistence::MAX_PERSISTED_TASKS,
        }
    }
}

/// [orchestrator] 段：多 agent 协同
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub enabled: bool,
    pub selection_threshold: f32,
    pub max_agents: usize,
    pub max_parallel_tasks: usize,
    pub max_rounds: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            selection_threshold: 0.3,
            max_agents: 3,
            max_parallel_tasks: 2,
            max_rounds: 3,
        }
    }
}

/// [llm] 段：文本生成后端。API Key 走 OPENAI_API_KEY 环境变量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（兼容端点）或 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
        }
    }
}

/// [workspace] 段：任务动作能触碰的根目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WorkspaceSection {
    /// 未设置时用 ./workspace
    pub root: Option<PathBuf>,
}

/// [shell] 段：run_command 白名单（仅首词，如 ls、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: vec![
                "ls".into(),
                "grep".into(),
                "cat".into(),
                "head".into(),
                "tail".into(),
                "wc".into(),
                "find".into(),
                "git".into(),
                "cargo".into(),
                "rustc".into(),
                "echo".into(),
            ],
            timeout_secs: 30,
        }
    }
}

impl AxonConfig {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.server.bind_addr.clone(),
            ping_interval_secs: self.server.ping_interval_secs,
            session_timeout_secs: self.server.session_timeout_secs,
        }
    }

    pub fn to_connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            url: self.connector.url.clone(),
            name: self.connector.name.clone(),
            reconnect_interval_ms: self.connector.reconnect_interval_ms,
            max_reconnect_delay_ms: self.connector.max_reconnect_delay_ms,
            max_reconnect_attempts: self.connector.max_reconnect_attempts,
            ping_interval_ms: self.connector.ping_interval_ms,
            pong_grace_ms: self.connector.pong_grace_ms,
            message_queue_max: self.connector.message_queue_max,
            command_timeout_ms: self.connector.command_timeout_ms,
        }
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        let mode = match self.engine.approval_mode.to_lowercase().as_str() {
            "auto" => ApprovalMode::Auto,
            "channel" => ApprovalMode::Channel,
            "console" => ApprovalMode::Console,
            "webhook" => match self.engine.approval_webhook_url.as_deref() {
                Some(url) if !url.is_empty() => ApprovalMode::Webhook {
                    url: url.to_string(),
                },
                _ => {
                    tracing::warn!("approval_mode=webhook without approval_webhook_url, using channel");
                    ApprovalMode::Channel
                }
            },
            other => {
                tracing::warn!(mode = other, "unknown approval_mode, using channel");
                ApprovalMode::Channel
            }
        };
        EngineConfig {
            max_parallel_steps: self.engine.max_parallel_steps,
            max_retries: self.engine.max_retries,
            retry_base_delay_ms: self.engine.retry_base_delay_ms,
            retry_max_delay_ms: self.engine.retry_max_delay_ms,
            step_timeout_secs: self.engine.step_timeout_secs,
            abort_on_denial: self.engine.abort_on_denial,
            approval: ApprovalConfig {
                mode,
                timeout_ms: self.engine.approval_timeout_ms,
            },
        }
    }

    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            selection_threshold: self.orchestrator.selection_threshold,
            max_agents: self.orchestrator.max_agents,
            max_parallel_tasks: self.orchestrator.max_parallel_tasks,
            max_rounds: self.orchestrator.max_rounds,
        }
    }

    /// 工作目录：配置 > 当前目录下的 workspace
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// 从 config 目录加载配置，环境变量 AXON__* 可覆盖
///
/// 1. 按顺序查找 config/axon.toml、../config/axon.toml、axon.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AXON__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AxonConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/axon", "../config/axon", "axon"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AXON")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let cfg = AxonConfig::default();
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.connector.name, "axon");
        assert_eq!(cfg.engine.max_parallel_steps, 2);
        assert_eq!(cfg.persistence.max_tasks, 20);
        assert!(cfg.persistence.dir.is_none());
    }

    #[test]
    fn test_engine_config_parses_approval_modes() {
        let mut cfg = AxonConfig::default();
        assert_eq!(cfg.to_engine_config().approval.mode, ApprovalMode::Channel);

        cfg.engine.approval_mode = "AUTO".to_string();
        assert_eq!(cfg.to_engine_config().approval.mode, ApprovalMode::Auto);

        cfg.engine.approval_mode = "webhook".to_string();
        cfg.engine.approval_webhook_url = Some("http://127.0.0.1:8080/approve".to_string());
        assert_eq!(
            cfg.to_engine_config().approval.mode,
            ApprovalMode::Webhook {
                url: "http://127.0.0.1:8080/approve".to_string()
            }
        );

        // webhook 没配地址退回 channel
        cfg.engine.approval_webhook_url = None;
        assert_eq!(cfg.to_engine_config().approval.mode, ApprovalMode::Channel);

        cfg.engine.approval_mode = "nonsense".to_string();
        assert_eq!(cfg.to_engine_config().approval.mode, ApprovalMode::Channel);
    }

    #[test]
    fn test_section_conversions_copy_fields() {
        let cfg = AxonConfig::default();
        let connector = cfg.to_connector_config();
        assert_eq!(connector.url, "ws://127.0.0.1:9000");
        assert_eq!(connector.command_timeout_ms, 30_000);

        let orchestrator = cfg.to_orchestrator_config();
        assert!((orchestrator.selection_threshold - 0.3).abs() < 1e-6);
        assert_eq!(orchestrator.max_agents, 3);
    }
}
