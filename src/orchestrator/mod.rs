//! 多 agent 编排：花名册匹配、策略分类、协同执行与指标

pub mod agents;
pub mod session;
pub mod strategy;

pub use agents::{select_agents, AgentSpec, ScoredAgent, AGENT_ROSTER};
pub use session::{AgentMetrics, AgentSession, AgentState, MetricsBook, SubTask};
pub use strategy::{
    classify, BranchFailure, CoordinationOutcome, CoordinationStrategy, Orchestrator,
    OrchestratorConfig,
};
