//! 任务层：指令 → 计划 → 依赖调度执行 → 落盘与回滚

pub mod actions;
pub mod engine;
pub mod graph;
pub mod persistence;
pub mod planner;
pub mod types;

pub use actions::{ActionContext, ActionHandler, ActionOutcome, ActionRegistry};
pub use engine::{
    ApprovalConfig, ApprovalGate, ApprovalMode, EngineConfig, ExecutionEngine, StepEvent,
};
pub use graph::StepGraph;
pub use persistence::{create_task_store, FileTaskStore, MemoryTaskStore, TaskStore};
pub use planner::{PlannerConfig, TaskPlanner};
pub use types::{
    ActionKind, PersistedTaskState, RiskLevel, StepStatus, TaskPlan, TaskResult, TaskStatus,
    TaskStep, WorkspaceContext,
};
