//! 任务规划器
//!
//! 把自然语言指令交给生成后端，换回一份 JSON 计划。模型输出从不可信：
//! 宽松解析、重编步骤 id、建图校验，任何一环失败都退回单步 custom 计划，
//! 所以规划永远有结果。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::error::BridgeError;
use crate::llm::{extract_json, Message, TextGenerator};
use crate::task::graph::StepGraph;
use crate::task::types::{
    ActionKind, PlanEstimate, RiskLevel, TaskPlan, TaskStep, WorkspaceContext,
};

const PLANNING_PROMPT: &str = r#"You are a task planner for a coding assistant. Convert the user's instruction into an executable plan.

Respond with JSON only, no prose, following exactly this schema:
{
  "title": "short summary",
  "steps": [
    {
      "id": "step-1",
      "action": "<one of the actions below>",
      "params": {},
      "dependsOn": [],
      "description": "what this step does"
    }
  ]
}

Allowed actions and their params:
- read_file: {"path"}
- write_file: {"path", "content"}
- edit_file: {"path", "find", "replace"} or {"path", "instruction"}
- delete_file: {"path"}
- create_directory: {"path"}
- run_command: {"command"}
- search_codebase: {"query", "filePattern"?, "maxResults"?}
- analyze_code: {"path"} or {"code"}
- refactor_code: {"path", "instruction"}
- generate_code: {"instruction", "path"?}
- run_tests: {"command"?}
- git_commit: {"message"}
- custom: {"instruction"}

Rules:
- Use only the listed actions.
- Paths are relative to the workspace root.
- List a dependency only when a step truly needs another step's outcome.
- Keep the plan minimal. At most {max_steps} steps."#;

/// 命中即标记需人工确认的命令模式
const DANGEROUS_COMMAND_PATTERNS: &[&str] = &[
    r"(?i)\brm\b\s+(-[a-z]*[rf][a-z]*\b|.*\s-[a-z]*[rf][a-z]*\b)",
    r"(?i)\bsudo\b",
    r"(?i)\bmkfs\b",
    r"(?i)\bdd\b\s+if=",
    r"(?i)>\s*/dev/(sd|nvme|hd)",
    r"(?i)\bchmod\b\s+(-[a-z]+\s+)?777\b",
    r"(?i)\bdrop\s+(table|database)\b",
    r"(?i)\bgit\s+push\b.*(--force|-f\b)",
    r"(?i)\bgit\s+reset\b.*--hard",
    r"(?i)\bgit\s+clean\b.*-[a-z]*f",
    r"(?i)\btruncate\b\s+-s\s*0",
    r"(?i)\b(shutdown|reboot|halt|poweroff)\b",
    r"(?i)\bkill\b\s+-9\s+1\b",
];

/// 提交参数里出现这些词视为改写历史，必须过审
const HISTORY_REWRITE_MARKERS: &[&str] = &["--amend", "--force", "rebase", "reset --hard", "filter-branch"];

fn dangerous_regexes() -> &'static Vec<Regex> {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        DANGEROUS_COMMAND_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

pub fn command_is_dangerous(command: &str) -> bool {
    if command.trim().is_empty() {
        return false;
    }
    dangerous_regexes().iter().any(|re| re.is_match(command))
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub max_steps: usize,
    /// 全量过审模式，演示或高危环境用
    pub require_approval_all: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            require_approval_all: false,
        }
    }
}

/// 模型回包的宽松映射，字段能缺就缺
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    id: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    params: Value,
    #[serde(default, alias = "dependsOn")]
    depends_on: Vec<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "requiresApproval")]
    requires_approval: bool,
}

pub struct TaskPlanner {
    generator: Arc<dyn TextGenerator>,
    config: PlannerConfig,
}

impl TaskPlanner {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            config: PlannerConfig::default(),
        }
    }

    pub fn with_config(generator: Arc<dyn TextGenerator>, config: PlannerConfig) -> Self {
        Self { generator, config }
    }

    pub async fn create_plan(&self, instruction: &str, workspace: Option<&WorkspaceContext>) -> TaskPlan {
        self.create_plan_with_briefing(instruction, workspace, None).await
    }

    /// briefing 是编排器各分支的分析汇总，拼进提示词给规划参考
    pub async fn create_plan_with_briefing(
        &self,
        instruction: &str,
        workspace: Option<&WorkspaceContext>,
        briefing: Option<&str>,
    ) -> TaskPlan {
        let system = PLANNING_PROMPT.replace("{max_steps}", &self.config.max_steps.to_string());
        let mut user = format!("Instruction:\n{instruction}\n");
        if let Some(ws) = workspace {
            if !ws.root.is_empty() {
                user.push_str(&format!("\nWorkspace root: {}\n", ws.root));
            }
            if !ws.files.is_empty() {
                user.push_str("Relevant files:\n");
                for file in ws.files.iter().take(30) {
                    user.push_str(&format!("- {file}\n"));
                }
            }
        }
        if let Some(briefing) = briefing.filter(|b| !b.trim().is_empty()) {
            user.push_str(&format!("\nAnalysis from coordinating agents:\n{briefing}\n"));
        }

        let messages = vec![Message::system(system), Message::user(user)];
        let text = match self.generator.generate(&messages).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "plan generation failed, falling back to single step");
                return self.fallback_plan(instruction);
            }
        };

        match self.parse_plan(&text, instruction) {
            Ok(plan) => {
                debug!(task_id = %plan.id, steps = plan.steps.len(), "plan accepted");
                plan
            }
            Err(err) => {
                warn!(error = %err, "discarding invalid plan");
                self.fallback_plan(instruction)
            }
        }
    }

    fn parse_plan(&self, text: &str, instruction: &str) -> Result<TaskPlan, BridgeError> {
        let json_text = extract_json(text)
            .ok_or_else(|| BridgeError::Validation("no JSON object in model response".to_string()))?;
        let raw: RawPlan = serde_json::from_str(json_text)?;

        if raw.steps.is_empty() {
            return Err(BridgeError::Validation("plan has no steps".to_string()));
        }
        if raw.steps.len() > self.config.max_steps {
            return Err(BridgeError::Validation(format!(
                "plan exceeds {} steps",
                self.config.max_steps
            )));
        }

        // 模型起的 id 不可靠，统一重编成 step-1..n 再映射依赖
        let mut remap = HashMap::new();
        for (idx, raw_step) in raw.steps.iter().enumerate() {
            if !raw_step.id.is_empty() {
                remap.insert(raw_step.id.clone(), format!("step-{}", idx + 1));
            }
        }

        let mut steps = Vec::with_capacity(raw.steps.len());
        for (idx, raw_step) in raw.steps.into_iter().enumerate() {
            let action = ActionKind::parse(&raw_step.action).ok_or_else(|| {
                BridgeError::Validation(format!("unknown action: {}", raw_step.action))
            })?;
            let mut step = TaskStep::new(format!("step-{}", idx + 1), action, raw_step.params);
            step.depends_on = raw_step
                .depends_on
                .iter()
                .map(|dep| remap.get(dep).cloned().unwrap_or_else(|| dep.clone()))
                .collect();
            step.description = raw_step.description.filter(|d| !d.trim().is_empty());
            step.requires_approval = raw_step.requires_approval;
            self.mark_approval(&mut step);
            steps.push(step);
        }

        // 建图校验依赖与环，通不过的计划整份弃掉
        StepGraph::build(&steps)?;

        let title = raw
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| title_from(instruction));
        let mut plan = TaskPlan::new(title, steps, instruction);
        plan.estimate = Some(estimate_plan(&plan.steps));
        Ok(plan)
    }

    fn mark_approval(&self, step: &mut TaskStep) {
        if self.config.require_approval_all || step.action.is_destructive() {
            step.requires_approval = true;
            return;
        }
        match step.action {
            ActionKind::RunCommand => {
                let command = step
                    .params
                    .get("command")
                    .and_then(|v| v.as_str())
                    .or_else(|| step.params.get("cmd").and_then(|v| v.as_str()))
                    .unwrap_or("");
                if command_is_dangerous(command) {
                    step.requires_approval = true;
                }
            }
            ActionKind::GitCommit => {
                let text = step.params.to_string().to_lowercase();
                if HISTORY_REWRITE_MARKERS.iter().any(|m| text.contains(m)) {
                    step.requires_approval = true;
                }
            }
            _ => {}
        }
    }

    /// 规划失败的兜底：一步 custom，把原始指令原样带过去
    fn fallback_plan(&self, instruction: &str) -> TaskPlan {
        let mut step = TaskStep::new(
            "step-1",
            ActionKind::Custom,
            serde_json::json!({ "instruction": instruction }),
        );
        step.description = Some("execute the instruction directly".to_string());
        if self.config.require_approval_all {
            step.requires_approval = true;
        }
        let mut plan = TaskPlan::new(title_from(instruction), vec![step], instruction);
        plan.estimate = Some(estimate_plan(&plan.steps));
        plan
    }
}

fn title_from(instruction: &str) -> String {
    let first_line = instruction.lines().next().unwrap_or("").trim();
    let title: String = first_line.chars().take(60).collect();
    if title.is_empty() {
        "untitled task".to_string()
    } else {
        title
    }
}

fn estimate_plan(steps: &[TaskStep]) -> PlanEstimate {
    let complexity = (steps.len() as f32 / 10.0).min(1.0);
    let mut secs = (steps.len() as u64 * 30) as f32 * (1.0 + complexity);

    let distinct_files: HashSet<&str> = steps
        .iter()
        .filter_map(|s| s.params.get("path").and_then(|v| v.as_str()))
        .collect();
    if distinct_files.len() > 1 {
        secs *= 1.3;
    }
    if steps.iter().any(|s| s.action == ActionKind::RunTests) {
        secs *= 1.2;
    }

    let risk = if steps.iter().any(|s| s.requires_approval) {
        RiskLevel::High
    } else if steps.iter().any(|s| {
        matches!(
            s.action,
            ActionKind::WriteFile
                | ActionKind::EditFile
                | ActionKind::RefactorCode
                | ActionKind::RunCommand
                | ActionKind::GitCommit
        )
    }) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    PlanEstimate {
        duration_secs: (secs as u64).clamp(10, 300),
        complexity,
        risk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockGenerator;

    fn planner_with(response: &str) -> TaskPlanner {
        TaskPlanner::new(Arc::new(MockGenerator::with_responses(vec![response])))
    }

    #[tokio::test]
    async fn test_plan_parses_and_renumbers_ids() {
        let response = r#"```json
{
  "title": "add greeting",
  "steps": [
    {"id": "read", "action": "read_file", "params": {"path": "src/main.rs"}},
    {"id": "write", "action": "edit_file", "params": {"path": "src/main.rs", "instruction": "add greeting"}, "dependsOn": ["read"]}
  ]
}
```"#;
        let plan = planner_with(response).create_plan("add a greeting", None).await;

        assert_eq!(plan.title, "add greeting");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].id, "step-1");
        assert_eq!(plan.steps[1].id, "step-2");
        assert_eq!(plan.steps[1].depends_on, vec!["step-1"]);
        assert!(plan.id.starts_with("task_"));
        assert_eq!(plan.created_from, "add a greeting");
        assert!(plan.estimate.is_some());
    }

    #[tokio::test]
    async fn test_invalid_json_falls_back_to_custom_step() {
        let plan = planner_with("sorry, I cannot help with that")
            .create_plan("rename the module", None)
            .await;

        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, ActionKind::Custom);
        assert_eq!(plan.steps[0].params["instruction"], "rename the module");
    }

    #[tokio::test]
    async fn test_unknown_action_discards_whole_plan() {
        let response = r#"{"steps": [
            {"id": "s1", "action": "read_file", "params": {"path": "a.txt"}},
            {"id": "s2", "action": "summon_demon", "params": {}}
        ]}"#;
        let plan = planner_with(response).create_plan("do the thing", None).await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, ActionKind::Custom);
    }

    #[tokio::test]
    async fn test_cyclic_dependencies_discard_whole_plan() {
        let response = r#"{"steps": [
            {"id": "a", "action": "read_file", "params": {}, "dependsOn": ["b"]},
            {"id": "b", "action": "read_file", "params": {}, "dependsOn": ["a"]}
        ]}"#;
        let plan = planner_with(response).create_plan("loop", None).await;
        assert_eq!(plan.steps[0].action, ActionKind::Custom);
    }

    #[tokio::test]
    async fn test_destructive_steps_marked_for_approval() {
        let response = r#"{"steps": [
            {"id": "s1", "action": "delete_file", "params": {"path": "old.rs"}},
            {"id": "s2", "action": "run_command", "params": {"command": "rm -rf build"}},
            {"id": "s3", "action": "run_command", "params": {"command": "cargo fmt"}},
            {"id": "s4", "action": "git_commit", "params": {"message": "rebase onto main"}}
        ]}"#;
        let plan = planner_with(response).create_plan("clean up", None).await;

        assert!(plan.steps[0].requires_approval);
        assert!(plan.steps[1].requires_approval);
        assert!(!plan.steps[2].requires_approval);
        assert!(plan.steps[3].requires_approval);
        assert_eq!(plan.estimate.as_ref().map(|e| e.risk), Some(RiskLevel::High));
    }

    #[tokio::test]
    async fn test_require_approval_all_covers_every_step() {
        let generator = Arc::new(MockGenerator::with_responses(vec![
            r#"{"steps": [{"id": "s1", "action": "read_file", "params": {"path": "a"}}]}"#,
        ]));
        let planner = TaskPlanner::with_config(
            generator,
            PlannerConfig {
                max_steps: 20,
                require_approval_all: true,
            },
        );
        let plan = planner.create_plan("inspect", None).await;
        assert!(plan.steps[0].requires_approval);
    }

    #[test]
    fn test_dangerous_command_patterns() {
        assert!(command_is_dangerous("rm -rf /tmp/build"));
        assert!(command_is_dangerous("sudo apt install thing"));
        assert!(command_is_dangerous("git push origin main --force"));
        assert!(command_is_dangerous("GIT RESET --HARD HEAD~3"));
        assert!(command_is_dangerous("dd if=/dev/zero of=/dev/sda"));
        assert!(!command_is_dangerous("ls -la"));
        assert!(!command_is_dangerous("cargo test"));
        assert!(!command_is_dangerous(""));
    }

    #[test]
    fn test_title_truncates_to_sixty_chars() {
        let long = "x".repeat(200);
        assert_eq!(title_from(&long).chars().count(), 60);
        assert_eq!(title_from("  \n"), "untitled task");
    }
}
