//! 命令服务
//!
//! 桥接层和任务层之间的粘合：订阅连接上的 command_request /
//! command_execute 信封，按 payload 里的 command 字段分发，跑
//! 「编排 → 规划 → 执行」流水线，把结果打包成 command_result 回给
//! 请求方。每条命令独立 spawn，慢任务不挡消息循环；断线时结果信封
//! 进离线队列，重连后补发。

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::bridge::connector::BridgeConnector;
use crate::bridge::envelope::{Envelope, EnvelopeKind};
use crate::core::BridgeError;
use crate::orchestrator::Orchestrator;
use crate::task::engine::ExecutionEngine;
use crate::task::planner::TaskPlanner;
use crate::task::types::WorkspaceContext;

pub struct CommandService {
    connector: Arc<BridgeConnector>,
    planner: Arc<TaskPlanner>,
    engine: Arc<ExecutionEngine>,
    orchestrator: Arc<Orchestrator>,
    workspace: WorkspaceContext,
}

impl CommandService {
    pub fn new(
        connector: Arc<BridgeConnector>,
        planner: Arc<TaskPlanner>,
        engine: Arc<ExecutionEngine>,
        orchestrator: Arc<Orchestrator>,
        workspace: WorkspaceContext,
    ) -> Self {
        Self {
            connector,
            planner,
            engine,
            orchestrator,
            workspace,
        }
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        self.engine.clone()
    }

    /// 后台消费信封直到连接订阅关闭
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut messages = self.connector.subscribe_messages();
        info!(name = %self.connector.name(), "command service listening");
        loop {
            match messages.recv().await {
                Ok(envelope) => match envelope.kind {
                    EnvelopeKind::CommandRequest | EnvelopeKind::CommandExecute => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            service.handle_command(envelope).await;
                        });
                    }
                    _ => {
                        debug!(kind = %envelope.kind, source = %envelope.source, "ignoring non-command envelope");
                    }
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "command service lagged behind inbound messages");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("command service stopped");
    }

    /// 执行一条命令并把 command_result 发回请求方
    pub async fn handle_command(&self, envelope: Envelope) {
        let reply_to = envelope.source.clone();
        let correlation = envelope.correlation_key().to_string();
        debug!(from = %reply_to, id = %correlation, "handling command");

        let payload = match self.execute_command(&envelope.payload).await {
            Ok(value) => json!({ "status": "ok", "result": value }),
            Err(err) => {
                warn!(id = %correlation, error = %err, "command failed");
                json!({ "status": "error", "error": err.to_string() })
            }
        };

        let reply =
            Envelope::command_result(self.connector.name(), &reply_to, &correlation, payload);
        self.connector.send_or_queue(&reply).await;
    }

    /// payload.command 选操作，缺省走完整的任务执行
    pub async fn execute_command(&self, payload: &Value) -> Result<Value, BridgeError> {
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("execute_task");

        match command {
            "execute_task" => self.execute_instruction(payload).await,
            "plan_task" => self.plan_only(payload).await,
            "resume_task" => {
                let task_id = require_str(payload, "taskId")?;
                let result = self.engine.resume_task(task_id).await?;
                serde_json::to_value(&result).map_err(Into::into)
            }
            "rollback_task" => {
                let task_id = require_str(payload, "taskId")?;
                let report = self.engine.rollback(task_id).await?;
                serde_json::to_value(&report).map_err(Into::into)
            }
            "cancel_task" => {
                let task_id = require_str(payload, "taskId")?;
                let cancelled = self.engine.cancel(task_id).await;
                Ok(json!({ "cancelled": cancelled }))
            }
            "approve_step" | "reject_step" => {
                let task_id = require_str(payload, "taskId")?;
                let step_id = require_str(payload, "stepId")?;
                let resolved = if command == "approve_step" {
                    self.engine.approve(task_id, step_id).await
                } else {
                    self.engine.reject(task_id, step_id).await
                };
                Ok(json!({ "resolved": resolved }))
            }
            "pause_engine" => {
                self.engine.pause();
                Ok(json!({ "paused": true }))
            }
            "resume_engine" => {
                self.engine.resume();
                Ok(json!({ "paused": false }))
            }
            "list_tasks" => {
                let tasks = self.engine.list_resumable().await?;
                serde_json::to_value(&tasks).map_err(Into::into)
            }
            other => Err(BridgeError::Validation(format!(
                "unknown command: {other}"
            ))),
        }
    }

    /// 完整流水线：编排分析 → 生成计划 → 引擎执行
    async fn execute_instruction(&self, payload: &Value) -> Result<Value, BridgeError> {
        let instruction = instruction_from(payload)?;

        let briefing = self
            .orchestrator
            .orchestrate(instruction, &self.workspace.files)
            .await
            .map(|outcome| outcome.summary)
            .filter(|summary| !summary.trim().is_empty());

        let plan = self
            .planner
            .create_plan_with_briefing(instruction, Some(&self.workspace), briefing.as_deref())
            .await;
        info!(task_id = %plan.id, steps = plan.steps.len(), "executing planned task");

        let result = self.engine.execute(plan, instruction).await?;
        serde_json::to_value(&result).map_err(Into::into)
    }

    /// 只出计划不执行，给对端预览用
    async fn plan_only(&self, payload: &Value) -> Result<Value, BridgeError> {
        let instruction = instruction_from(payload)?;
        let plan = self.planner.create_plan(instruction, Some(&self.workspace)).await;
        serde_json::to_value(&plan).map_err(Into::into)
    }
}

fn instruction_from(payload: &Value) -> Result<&str, BridgeError> {
    for key in ["instruction", "prompt", "text"] {
        if let Some(text) = payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
        {
            return Ok(text);
        }
    }
    Err(BridgeError::Validation(
        "missing required param: instruction".to_string(),
    ))
}

fn require_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, BridgeError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::Validation(format!("missing required param: {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::connector::ConnectorConfig;
    use crate::llm::{MockGenerator, TextGenerator};
    use crate::orchestrator::OrchestratorConfig;
    use crate::task::actions::{ActionContext, ActionRegistry};
    use crate::task::engine::{ApprovalConfig, ApprovalMode, EngineConfig};
    use crate::task::persistence::MemoryTaskStore;
    use crate::tools::{SafeFs, ShellRunner};
    use std::path::Path;
    use tempfile::tempdir;

    fn offline_connector(name: &str) -> Arc<BridgeConnector> {
        // 不 connect，发出的信封都会进离线队列
        Arc::new(BridgeConnector::new(ConnectorConfig {
            url: "ws://127.0.0.1:1".to_string(),
            name: name.to_string(),
            ..ConnectorConfig::default()
        }))
    }

    fn service_with(generator: Arc<dyn TextGenerator>, root: &Path) -> CommandService {
        let ctx = ActionContext::new(
            SafeFs::new(root),
            ShellRunner::new(vec!["echo".into(), "ls".into()], 5, root),
            generator.clone(),
        );
        let config = EngineConfig {
            approval: ApprovalConfig {
                mode: ApprovalMode::Auto,
                timeout_ms: 1_000,
            },
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(
            config,
            ActionRegistry::standard(),
            Arc::new(MemoryTaskStore::new()),
            ctx,
        )
        .unwrap();
        CommandService::new(
            offline_connector("worker"),
            Arc::new(TaskPlanner::new(generator.clone())),
            Arc::new(engine),
            Arc::new(Orchestrator::new(OrchestratorConfig::default(), generator)),
            WorkspaceContext::new(root.to_string_lossy()),
        )
    }

    const PLAN_JSON: &str = r#"{
        "title": "write the file",
        "steps": [
            {"id": "1", "action": "write_file", "params": {"path": "out.txt", "content": "hello"}}
        ]
    }"#;

    #[tokio::test]
    async fn test_execute_task_runs_full_pipeline() {
        let dir = tempdir().unwrap();
        // 第一条喂给编排分支，第二条是规划器要的计划
        let generator: Arc<dyn TextGenerator> = Arc::new(MockGenerator::with_responses(vec![
            "focus on writing the file",
            PLAN_JSON,
        ]));
        let service = service_with(generator, dir.path());

        let result = service
            .execute_command(&json!({ "instruction": "write hello into out.txt" }))
            .await
            .unwrap();

        assert_eq!(result["status"], "completed");
        assert_eq!(result["completedSteps"], json!(["step-1"]));
        let written = tokio::fs::read_to_string(dir.path().join("out.txt"))
            .await
            .unwrap();
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn test_plan_task_previews_without_executing() {
        let dir = tempdir().unwrap();
        let generator: Arc<dyn TextGenerator> =
            Arc::new(MockGenerator::with_responses(vec![PLAN_JSON]));
        let service = service_with(generator, dir.path());

        let plan = service
            .execute_command(&json!({ "command": "plan_task", "instruction": "write hello" }))
            .await
            .unwrap();

        assert_eq!(plan["title"], "write the file");
        assert_eq!(plan["steps"][0]["id"], "step-1");
        // 预览不落盘
        assert!(!dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let dir = tempdir().unwrap();
        let generator: Arc<dyn TextGenerator> = Arc::new(MockGenerator::new());
        let service = service_with(generator, dir.path());

        let err = service
            .execute_command(&json!({ "command": "bogus" }))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        let err = service.execute_command(&json!({})).await.unwrap_err();
        assert!(err.to_string().contains("instruction"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_reports_false() {
        let dir = tempdir().unwrap();
        let generator: Arc<dyn TextGenerator> = Arc::new(MockGenerator::new());
        let service = service_with(generator, dir.path());

        let result = service
            .execute_command(&json!({ "command": "cancel_task", "taskId": "task_nope" }))
            .await
            .unwrap();
        assert_eq!(result["cancelled"], false);
    }

    #[tokio::test]
    async fn test_handle_command_queues_reply_when_offline() {
        let dir = tempdir().unwrap();
        let generator: Arc<dyn TextGenerator> = Arc::new(MockGenerator::new());
        let service = service_with(generator, dir.path());

        let request = Envelope::new(
            EnvelopeKind::CommandRequest,
            json!({ "command": "cancel_task", "taskId": "task_x" }),
            "editor",
        )
        .to("worker");
        service.handle_command(request).await;

        // 离线时结果信封排进队列等重连
        assert_eq!(service.connector.queued().await, 1);
    }
}
