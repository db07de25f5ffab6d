//! 任务模型
//!
//! 计划、步骤、动作种类、持久化记录。落盘与信封 payload 用 camelCase，
//! 动作与状态的取值用 snake_case 字符串，两侧对端都认识。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 动作种类：封闭集合，计划里出现集合之外的值整份作废
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReadFile,
    WriteFile,
    EditFile,
    DeleteFile,
    CreateDirectory,
    RunCommand,
    SearchCodebase,
    AnalyzeCode,
    RefactorCode,
    GenerateCode,
    RunTests,
    GitCommit,
    /// 兜底：交给生成后端自由发挥的一步
    Custom,
}

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        ActionKind::ReadFile,
        ActionKind::WriteFile,
        ActionKind::EditFile,
        ActionKind::DeleteFile,
        ActionKind::CreateDirectory,
        ActionKind::RunCommand,
        ActionKind::SearchCodebase,
        ActionKind::AnalyzeCode,
        ActionKind::RefactorCode,
        ActionKind::GenerateCode,
        ActionKind::RunTests,
        ActionKind::GitCommit,
        ActionKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ReadFile => "read_file",
            ActionKind::WriteFile => "write_file",
            ActionKind::EditFile => "edit_file",
            ActionKind::DeleteFile => "delete_file",
            ActionKind::CreateDirectory => "create_directory",
            ActionKind::RunCommand => "run_command",
            ActionKind::SearchCodebase => "search_codebase",
            ActionKind::AnalyzeCode => "analyze_code",
            ActionKind::RefactorCode => "refactor_code",
            ActionKind::GenerateCode => "generate_code",
            ActionKind::RunTests => "run_tests",
            ActionKind::GitCommit => "git_commit",
            ActionKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<ActionKind> {
        ActionKind::ALL.iter().copied().find(|kind| kind.as_str() == s)
    }

    /// 不经确认就可能造成不可逆损失的动作
    pub fn is_destructive(&self) -> bool {
        matches!(self, ActionKind::DeleteFile)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤状态机：pending → (awaiting_approval →) running → completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    AwaitingApproval,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    /// 有步骤被拒批或被跳过，其余完成
    PartiallyCompleted,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: String,
    pub action: ActionKind,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    #[serde(default)]
    pub requires_approval: bool,
    /// 重试次数（首次执行不计）
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl TaskStep {
    pub fn new(id: impl Into<String>, action: ActionKind, params: Value) -> Self {
        Self {
            id: id.into(),
            action,
            params,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            requires_approval: false,
            retry_count: 0,
            description: None,
            error: None,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    pub id: String,
    pub title: String,
    pub steps: Vec<TaskStep>,
    /// 产生本计划的原始指令
    pub created_from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<PlanEstimate>,
}

impl TaskPlan {
    pub fn new(title: impl Into<String>, steps: Vec<TaskStep>, created_from: &str) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            title: title.into(),
            steps,
            created_from: created_from.to_string(),
            estimate: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn completed_step_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// 规划期的启发式估算，用于给调用方一个量级预期
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEstimate {
    pub duration_secs: u64,
    /// 0.0 ~ 1.0
    pub complexity: f32,
    pub risk: RiskLevel,
}

/// 可撤销的副作用。执行时入回滚日志，回滚时逆序应用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoAction {
    /// 撤销新建文件
    RemoveFile { path: String },
    /// 撤销覆写/编辑/删除：恢复先前内容
    RestoreFile { path: String, prior: String },
    /// 撤销新建目录
    RemoveDir { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedAction {
    pub step_id: String,
    pub undo: UndoAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackFailureEntry {
    pub step_id: String,
    pub error: String,
}

/// 回滚汇总：单步撤销失败不中断，记录在 failed 里
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub task_id: String,
    pub reversed: Vec<String>,
    pub failed: Vec<RollbackFailureEntry>,
}

/// 任务执行的最终答卷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub completed_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 有已应用的副作用可回滚
    pub rollback_available: bool,
    /// 各步骤的最终形态（含 retryCount 与错误）
    pub steps: Vec<TaskStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub user_request: String,
    pub total_steps: usize,
    pub completed_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
}

/// 落盘的任务快照，进程重启后据此恢复
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTaskState {
    pub id: String,
    pub original_task: TaskPlan,
    /// 第一个未完成步骤在 steps 里的下标
    pub current_step_index: usize,
    pub completed_steps: Vec<String>,
    /// Unix 毫秒
    pub timestamp: i64,
    pub metadata: TaskMetadata,
}

impl PersistedTaskState {
    pub fn capture(plan: &TaskPlan, completed: &[String], user_request: &str, workspace_root: Option<&str>) -> Self {
        let current_step_index = plan
            .steps
            .iter()
            .position(|s| s.status != StepStatus::Completed)
            .unwrap_or(plan.steps.len());
        Self {
            id: plan.id.clone(),
            original_task: plan.clone(),
            current_step_index,
            completed_steps: completed.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: TaskMetadata {
                user_request: user_request.to_string(),
                total_steps: plan.steps.len(),
                completed_count: completed.len(),
                workspace_root: workspace_root.map(String::from),
            },
        }
    }
}

/// 规划与选人时的工作区上下文
#[derive(Debug, Clone, Default)]
pub struct WorkspaceContext {
    pub root: String,
    /// 相关文件相对路径（来自调用方或目录扫描）
    pub files: Vec<String>,
}

impl WorkspaceContext {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            files: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_kind_round_trip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::parse("format_disk"), None);
    }

    #[test]
    fn test_step_serializes_camel_case() {
        let step = TaskStep::new("step-1", ActionKind::WriteFile, json!({"path": "a.txt"}))
            .after(&["step-0"])
            .with_approval();
        let raw = serde_json::to_value(&step).unwrap();

        assert_eq!(raw["action"], json!("write_file"));
        assert_eq!(raw["dependsOn"], json!(["step-0"]));
        assert_eq!(raw["requiresApproval"], json!(true));
        assert_eq!(raw["status"], json!("pending"));
        assert_eq!(raw["retryCount"], json!(0));
        assert!(raw.get("error").is_none());
    }

    #[test]
    fn test_persisted_state_index_points_at_first_incomplete() {
        let mut plan = TaskPlan::new(
            "demo",
            vec![
                TaskStep::new("step-1", ActionKind::ReadFile, json!({})),
                TaskStep::new("step-2", ActionKind::WriteFile, json!({})),
                TaskStep::new("step-3", ActionKind::RunTests, json!({})),
            ],
            "do things",
        );
        plan.steps[0].status = StepStatus::Completed;

        let state = PersistedTaskState::capture(&plan, &["step-1".to_string()], "do things", None);
        assert_eq!(state.current_step_index, 1);
        assert_eq!(state.metadata.total_steps, 3);
        assert_eq!(state.metadata.completed_count, 1);

        plan.steps[1].status = StepStatus::Completed;
        plan.steps[2].status = StepStatus::Completed;
        let state = PersistedTaskState::capture(&plan, &plan.completed_step_ids(), "do things", None);
        assert_eq!(state.current_step_index, 3);
    }

    #[test]
    fn test_undo_action_tagged_serialization() {
        let undo = UndoAction::RestoreFile {
            path: "src/lib.rs".into(),
            prior: "old".into(),
        };
        let raw = serde_json::to_value(&undo).unwrap();
        assert_eq!(raw["kind"], json!("restore_file"));
        assert_eq!(raw["path"], json!("src/lib.rs"));
    }
}
