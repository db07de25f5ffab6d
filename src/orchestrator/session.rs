//! Agent 会话与指标账本
//!
//! 一次编排里每个参与的 agent 挂一个会话，记阶段、token 用量和估算成本。
//! MetricsBook 跨编排累计每个 agent 的战绩，选择器用成功率微调置信度。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 每千 token 的估算单价（美元）
pub const COST_PER_1K_TOKENS: f64 = 0.002;

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Working,
    Completed,
    Failed,
}

/// 分派给单个 agent 的子任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub agent: String,
    pub description: String,
}

/// 一次编排中单个 agent 的会话记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub agent: String,
    pub state: AgentState,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    /// agent 的产出文本，失败时为 None
    pub output: Option<String>,
}

impl AgentSession {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            state: AgentState::Idle,
            tokens_used: 0,
            estimated_cost: 0.0,
            output: None,
        }
    }

    /// 记一笔 token 用量并重算成本
    pub fn add_usage(&mut self, tokens: u64) {
        self.tokens_used += tokens;
        self.estimated_cost = self.tokens_used as f64 / 1000.0 * COST_PER_1K_TOKENS;
    }
}

/// 单个 agent 的历史战绩
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub invocations: u64,
    pub successes: u64,
    pub total_tokens: u64,
}

impl AgentMetrics {
    /// 没有历史时按中性 0.5 计
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 0.5;
        }
        self.successes as f64 / self.invocations as f64
    }
}

/// 跨编排共享的指标账本
#[derive(Default)]
pub struct MetricsBook {
    inner: RwLock<HashMap<String, AgentMetrics>>,
}

impl MetricsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, agent: &str, success: bool, tokens: u64) {
        let mut book = self.inner.write().await;
        let entry = book.entry(agent.to_string()).or_default();
        entry.invocations += 1;
        if success {
            entry.successes += 1;
        }
        entry.total_tokens += tokens;
    }

    pub async fn success_rate(&self, agent: &str) -> Option<f64> {
        self.inner.read().await.get(agent).map(|m| m.success_rate())
    }

    pub async fn snapshot(&self) -> HashMap<String, AgentMetrics> {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates_cost() {
        let mut session = AgentSession::new("code-builder");
        session.add_usage(1_500);
        session.add_usage(500);
        assert_eq!(session.tokens_used, 2_000);
        assert!((session.estimated_cost - 0.004).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate_neutral_without_history() {
        let metrics = AgentMetrics::default();
        assert!((metrics.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_metrics_book_records_outcomes() {
        let book = MetricsBook::new();
        book.record("test-commander", true, 100).await;
        book.record("test-commander", true, 50).await;
        book.record("test-commander", false, 10).await;

        let rate = book.success_rate("test-commander").await.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(book.success_rate("unknown").await.is_none());

        let snapshot = book.snapshot().await;
        assert_eq!(snapshot["test-commander"].invocations, 3);
        assert_eq!(snapshot["test-commander"].total_tokens, 160);
    }
}
