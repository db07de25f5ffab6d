//! 协同策略
//!
//! 四种编排方式：顺序接力、并行分头、层级分派、多轮协商。
//! agent 产出的是分析笔记，汇总后交给规划器当上下文用。分支失败
//! 不中断编排，记进结果里继续。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::llm::{extract_json, Message, TextGenerator};
use crate::orchestrator::agents::{select_agents, AgentSpec, ScoredAgent};
use crate::orchestrator::session::{AgentSession, AgentState, MetricsBook, SubTask};

/// 协同策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStrategy {
    /// 一个接一个，后面的能看到前面的笔记
    Sequential,
    /// 各干各的，最后合并
    Parallel,
    /// 领队拆任务、分派、验收
    Hierarchical,
    /// 多轮互评直到收敛
    Collaborative,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 低于这个置信度的 agent 不出场
    pub selection_threshold: f32,
    pub max_agents: usize,
    pub max_parallel_tasks: usize,
    /// 协商策略的轮数上限
    pub max_rounds: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            selection_threshold: 0.3,
            max_agents: 3,
            max_parallel_tasks: 2,
            max_rounds: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BranchFailure {
    pub agent: String,
    pub error: String,
}

/// 一次编排的完整结果
#[derive(Debug, Clone)]
pub struct CoordinationOutcome {
    pub strategy: CoordinationStrategy,
    pub agents: Vec<String>,
    /// 合并后的分析简报，给规划器当上下文
    pub summary: String,
    pub sessions: Vec<AgentSession>,
    pub failures: Vec<BranchFailure>,
    pub rounds: usize,
}

/// 按指令措辞和 agent 数量挑策略
pub fn classify(instruction: &str, agent_count: usize) -> CoordinationStrategy {
    let lower = instruction.to_lowercase();

    const COLLABORATIVE_HINTS: [&str; 4] = ["review", "discuss", "consensus", "refine"];
    const SEQUENTIAL_HINTS: [&str; 4] = ["step by step", "one at a time", "in order", "then "];
    const HIERARCHICAL_HINTS: [&str; 4] = ["architecture", "redesign", "overhaul", "entire"];

    if COLLABORATIVE_HINTS.iter().any(|h| lower.contains(h)) {
        return CoordinationStrategy::Collaborative;
    }
    if SEQUENTIAL_HINTS.iter().any(|h| lower.contains(h)) {
        return CoordinationStrategy::Sequential;
    }
    if HIERARCHICAL_HINTS.iter().any(|h| lower.contains(h)) || agent_count >= 3 {
        return CoordinationStrategy::Hierarchical;
    }
    if agent_count <= 1 {
        CoordinationStrategy::Sequential
    } else {
        CoordinationStrategy::Parallel
    }
}

fn estimate_tokens(chars: usize) -> u64 {
    // 粗算：4 字符 1 token
    (chars / 4).max(1) as u64
}

fn agent_messages(spec: &AgentSpec, instruction: &str, notes: Option<&str>) -> Vec<Message> {
    let system = format!(
        "You are {}, a specialist agent. {}\n\
         Your capabilities: {}.\n\
         Analyze the request from your specialty's point of view and report, in a few \
         short paragraphs, what needs to happen in your area. Be concrete about files, \
         commands and risks.",
        spec.name,
        spec.description,
        spec.capabilities.join(", ")
    );
    let user = match notes {
        Some(notes) if !notes.is_empty() => {
            format!("Request: {instruction}\n\nNotes from other agents so far:\n{notes}")
        }
        _ => format!("Request: {instruction}"),
    };
    vec![Message::system(system), Message::user(user)]
}

fn parse_subtasks(text: &str, valid_agents: &[&str]) -> Vec<SubTask> {
    let Some(json) = extract_json(text) else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_str::<Vec<SubTask>>(json) else {
        return Vec::new();
    };
    parsed
        .into_iter()
        .filter(|t| {
            !t.description.trim().is_empty()
                && valid_agents.iter().any(|a| a.eq_ignore_ascii_case(&t.agent))
        })
        .collect()
}

struct BranchResult {
    idx: usize,
    agent: String,
    result: Result<String, String>,
    tokens: u64,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    generator: Arc<dyn TextGenerator>,
    metrics: Arc<MetricsBook>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            config,
            generator,
            metrics: Arc::new(MetricsBook::new()),
        }
    }

    pub fn metrics(&self) -> Arc<MetricsBook> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 选人、定策略、跑协同。没人接得住的指令返回 None
    pub async fn orchestrate(
        &self,
        instruction: &str,
        files: &[String],
    ) -> Option<CoordinationOutcome> {
        let selected = select_agents(
            instruction,
            files,
            &self.metrics,
            self.config.selection_threshold,
            self.config.max_agents,
        )
        .await;
        if selected.is_empty() {
            debug!("no agent matched the instruction, skipping coordination");
            return None;
        }
        let strategy = classify(instruction, selected.len());
        Some(self.coordinate(instruction, &selected, strategy).await)
    }

    pub async fn coordinate(
        &self,
        instruction: &str,
        agents: &[ScoredAgent],
        strategy: CoordinationStrategy,
    ) -> CoordinationOutcome {
        let names: Vec<String> = agents.iter().map(|a| a.spec.name.to_string()).collect();
        if agents.is_empty() {
            return CoordinationOutcome {
                strategy,
                agents: names,
                summary: String::new(),
                sessions: Vec::new(),
                failures: Vec::new(),
                rounds: 0,
            };
        }
        info!(?strategy, agents = ?names, "coordinating agents");

        let (sessions, failures, summary, rounds) = match strategy {
            CoordinationStrategy::Sequential => self.run_sequential(instruction, agents).await,
            CoordinationStrategy::Parallel => self.run_parallel(instruction, agents).await,
            CoordinationStrategy::Hierarchical => self.run_hierarchical(instruction, agents).await,
            CoordinationStrategy::Collaborative => self.run_collaborative(instruction, agents).await,
        };

        CoordinationOutcome {
            strategy,
            agents: names,
            summary,
            sessions,
            failures,
            rounds,
        }
    }

    async fn run_sequential(
        &self,
        instruction: &str,
        agents: &[ScoredAgent],
    ) -> (Vec<AgentSession>, Vec<BranchFailure>, String, usize) {
        let mut notes = String::new();
        let mut sessions = Vec::new();
        let mut failures = Vec::new();

        for scored in agents {
            let spec = scored.spec;
            let messages = agent_messages(
                spec,
                instruction,
                if notes.is_empty() { None } else { Some(&notes) },
            );
            let prompt_len: usize = messages.iter().map(|m| m.content.len()).sum();
            let mut session = AgentSession::new(spec.name);
            session.state = AgentState::Working;

            match self.generator.generate(&messages).await {
                Ok(output) => {
                    session.add_usage(estimate_tokens(prompt_len + output.len()));
                    session.state = AgentState::Completed;
                    self.metrics.record(spec.name, true, session.tokens_used).await;
                    notes.push_str(&format!("## {}\n{}\n\n", spec.name, output));
                    session.output = Some(output);
                }
                Err(err) => {
                    session.add_usage(estimate_tokens(prompt_len));
                    session.state = AgentState::Failed;
                    self.metrics.record(spec.name, false, session.tokens_used).await;
                    warn!(agent = spec.name, error = %err, "agent branch failed");
                    failures.push(BranchFailure {
                        agent: spec.name.to_string(),
                        error: err,
                    });
                }
            }
            sessions.push(session);
        }

        (sessions, failures, notes.trim().to_string(), 1)
    }

    async fn run_parallel(
        &self,
        instruction: &str,
        agents: &[ScoredAgent],
    ) -> (Vec<AgentSession>, Vec<BranchFailure>, String, usize) {
        let branches: Vec<(String, Vec<Message>)> = agents
            .iter()
            .map(|a| {
                (
                    a.spec.name.to_string(),
                    agent_messages(a.spec, instruction, None),
                )
            })
            .collect();
        let results = self.run_branches(branches).await;

        let mut sessions = Vec::new();
        let mut failures = Vec::new();
        for branch in results {
            let mut session = AgentSession::new(branch.agent.clone());
            session.add_usage(branch.tokens);
            match branch.result {
                Ok(output) => {
                    session.state = AgentState::Completed;
                    self.metrics.record(&branch.agent, true, branch.tokens).await;
                    session.output = Some(output);
                }
                Err(err) => {
                    session.state = AgentState::Failed;
                    self.metrics.record(&branch.agent, false, branch.tokens).await;
                    warn!(agent = %branch.agent, error = %err, "agent branch failed");
                    failures.push(BranchFailure {
                        agent: branch.agent,
                        error: err,
                    });
                }
            }
            sessions.push(session);
        }

        let summary = self.synthesize(instruction, &sessions).await;
        (sessions, failures, summary, 1)
    }

    async fn run_hierarchical(
        &self,
        instruction: &str,
        agents: &[ScoredAgent],
    ) -> (Vec<AgentSession>, Vec<BranchFailure>, String, usize) {
        let lead = agents[0].spec;
        let roster: Vec<&str> = agents.iter().map(|a| a.spec.name).collect();
        let mut failures = Vec::new();
        let mut lead_session = AgentSession::new(lead.name);
        lead_session.state = AgentState::Working;

        let decompose = vec![
            Message::system(format!(
                "You are {}, the lead agent. Split the request into subtasks for your team.\n\
                 Reply with ONLY a JSON array like \
                 [{{\"agent\": \"name\", \"description\": \"what to analyze\"}}].\n\
                 Valid agent names: {}.",
                lead.name,
                roster.join(", ")
            )),
            Message::user(instruction.to_string()),
        ];
        let prompt_len: usize = decompose.iter().map(|m| m.content.len()).sum();
        let assignments = match self.generator.generate(&decompose).await {
            Ok(text) => {
                lead_session.add_usage(estimate_tokens(prompt_len + text.len()));
                self.metrics.record(lead.name, true, lead_session.tokens_used).await;
                parse_subtasks(&text, &roster)
            }
            Err(err) => {
                lead_session.add_usage(estimate_tokens(prompt_len));
                self.metrics.record(lead.name, false, lead_session.tokens_used).await;
                warn!(agent = lead.name, error = %err, "lead decomposition failed");
                failures.push(BranchFailure {
                    agent: lead.name.to_string(),
                    error: err,
                });
                Vec::new()
            }
        };
        let assignments = if assignments.is_empty() {
            // 拆不出来就人人领整条指令
            debug!("decomposition unusable, assigning the whole request to every agent");
            agents
                .iter()
                .map(|a| SubTask {
                    agent: a.spec.name.to_string(),
                    description: instruction.to_string(),
                })
                .collect()
        } else {
            assignments
        };

        let branches: Vec<(String, Vec<Message>)> = assignments
            .iter()
            .filter_map(|task| {
                agents
                    .iter()
                    .find(|a| a.spec.name.eq_ignore_ascii_case(&task.agent))
                    .map(|a| {
                        (
                            a.spec.name.to_string(),
                            agent_messages(a.spec, &task.description, None),
                        )
                    })
            })
            .collect();
        let results = self.run_branches(branches).await;

        let mut sessions = vec![lead_session];
        let mut worker_notes = Vec::new();
        for branch in results {
            let mut session = AgentSession::new(branch.agent.clone());
            session.add_usage(branch.tokens);
            match branch.result {
                Ok(output) => {
                    session.state = AgentState::Completed;
                    self.metrics.record(&branch.agent, true, branch.tokens).await;
                    worker_notes.push(format!("## {}\n{}", branch.agent, output));
                    session.output = Some(output);
                }
                Err(err) => {
                    session.state = AgentState::Failed;
                    self.metrics.record(&branch.agent, false, branch.tokens).await;
                    warn!(agent = %branch.agent, error = %err, "agent branch failed");
                    failures.push(BranchFailure {
                        agent: branch.agent,
                        error: err,
                    });
                }
            }
            sessions.push(session);
        }

        // 领队验收一轮，合并出最终简报
        let joined = worker_notes.join("\n\n");
        let summary = if joined.is_empty() {
            String::new()
        } else {
            let review = vec![
                Message::system(format!(
                    "You are {}, the lead agent. Review your team's results and produce the \
                     final consolidated briefing. Fill gaps and resolve contradictions yourself.",
                    lead.name
                )),
                Message::user(format!("Request: {instruction}\n\nTeam results:\n{joined}")),
            ];
            let review_len: usize = review.iter().map(|m| m.content.len()).sum();
            match self.generator.generate(&review).await {
                Ok(merged) => {
                    sessions[0].add_usage(estimate_tokens(review_len + merged.len()));
                    sessions[0].state = AgentState::Completed;
                    merged
                }
                Err(err) => {
                    warn!(agent = lead.name, error = %err, "lead review failed, using raw notes");
                    sessions[0].state = AgentState::Completed;
                    joined
                }
            }
        };

        (sessions, failures, summary, 2)
    }

    async fn run_collaborative(
        &self,
        instruction: &str,
        agents: &[ScoredAgent],
    ) -> (Vec<AgentSession>, Vec<BranchFailure>, String, usize) {
        let mut by_agent: HashMap<String, AgentSession> = agents
            .iter()
            .map(|a| (a.spec.name.to_string(), AgentSession::new(a.spec.name)))
            .collect();
        let mut failures = Vec::new();
        let mut notes = String::new();
        let mut rounds = 0;

        for round in 1..=self.config.max_rounds.max(1) {
            rounds = round;
            let branches: Vec<(String, Vec<Message>)> = agents
                .iter()
                .map(|a| {
                    let system = format!(
                        "You are {}, a specialist agent. {}\n\
                         You are in round {round} of a joint analysis. Read the shared notes, \
                         add what is missing from your specialty, and challenge anything wrong.\n\
                         If the notes already cover your area adequately, reply with exactly \
                         CONSENSUS.",
                        a.spec.name, a.spec.description
                    );
                    let user = if notes.is_empty() {
                        format!("Request: {instruction}")
                    } else {
                        format!("Request: {instruction}\n\nShared notes:\n{notes}")
                    };
                    (
                        a.spec.name.to_string(),
                        vec![Message::system(system), Message::user(user)],
                    )
                })
                .collect();
            let results = self.run_branches(branches).await;

            let mut converged = true;
            let mut any_ok = false;
            for branch in results {
                if let Some(session) = by_agent.get_mut(&branch.agent) {
                    session.add_usage(branch.tokens);
                    match branch.result {
                        Ok(output) => {
                            any_ok = true;
                            session.state = AgentState::Completed;
                            self.metrics.record(&branch.agent, true, branch.tokens).await;
                            let settled = output.trim().eq_ignore_ascii_case("consensus");
                            if !settled {
                                converged = false;
                                notes.push_str(&format!(
                                    "### {} (round {round})\n{output}\n\n",
                                    branch.agent
                                ));
                                session.output = Some(output);
                            }
                        }
                        Err(err) => {
                            session.state = AgentState::Failed;
                            self.metrics.record(&branch.agent, false, branch.tokens).await;
                            warn!(agent = %branch.agent, error = %err, "agent branch failed");
                            failures.push(BranchFailure {
                                agent: branch.agent.clone(),
                                error: err,
                            });
                        }
                    }
                }
            }

            if converged || !any_ok {
                break;
            }
        }

        // 会话按出场顺序排
        let sessions: Vec<AgentSession> = agents
            .iter()
            .filter_map(|a| by_agent.remove(a.spec.name))
            .collect();
        let summary = self.synthesize(instruction, &sessions).await;
        (sessions, failures, summary, rounds)
    }

    async fn run_branches(&self, branches: Vec<(String, Vec<Message>)>) -> Vec<BranchResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_tasks.max(1)));
        let mut set = JoinSet::new();

        for (idx, (agent, messages)) in branches.into_iter().enumerate() {
            let generator = self.generator.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return BranchResult {
                            idx,
                            agent,
                            result: Err("coordination aborted".to_string()),
                            tokens: 0,
                        }
                    }
                };
                let prompt_len: usize = messages.iter().map(|m| m.content.len()).sum();
                let result = generator.generate(&messages).await;
                let reply_len = result.as_ref().map(|r| r.len()).unwrap_or(0);
                BranchResult {
                    idx,
                    agent,
                    result,
                    tokens: estimate_tokens(prompt_len + reply_len),
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(branch) => results.push(branch),
                Err(err) => warn!(error = %err, "agent branch task failed to join"),
            }
        }
        results.sort_by_key(|b| b.idx);
        results
    }

    /// 把各 agent 的产出并成一份简报。单份产出直接用，多份让模型合并,
    /// 合并失败退回拼接
    async fn synthesize(&self, instruction: &str, sessions: &[AgentSession]) -> String {
        let contributions: Vec<String> = sessions
            .iter()
            .filter_map(|s| s.output.as_ref().map(|o| format!("## {}\n{}", s.agent, o)))
            .collect();
        match contributions.len() {
            0 => String::new(),
            1 => contributions.into_iter().next().unwrap_or_default(),
            _ => {
                let joined = contributions.join("\n\n");
                let messages = vec![
                    Message::system(
                        "You merge analyses from several specialist agents into one coherent \
                         briefing. Keep every concrete requirement, drop repetition."
                            .to_string(),
                    ),
                    Message::user(format!("Request: {instruction}\n\nAgent analyses:\n{joined}")),
                ];
                match self.generator.generate(&messages).await {
                    Ok(merged) => merged,
                    Err(err) => {
                        warn!(error = %err, "synthesis failed, using raw notes");
                        joined
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockGenerator;
    use crate::orchestrator::agents::AGENT_ROSTER;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate(&self, _messages: &[Message]) -> Result<String, String> {
            Err("backend down".to_string())
        }
    }

    /// 包一层计数器量并发峰值，回复仍由里面的 mock 给
    struct GaugedGenerator {
        inner: MockGenerator,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for GaugedGenerator {
        async fn generate(&self, messages: &[Message]) -> Result<String, String> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = self.inner.generate(messages).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn scored(name: &str) -> ScoredAgent {
        ScoredAgent {
            spec: AGENT_ROSTER.iter().find(|s| s.name == name).unwrap(),
            confidence: 0.9,
        }
    }

    fn orchestrator(generator: Arc<dyn TextGenerator>) -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default(), generator)
    }

    #[test]
    fn test_classify_prefers_explicit_wording() {
        assert_eq!(
            classify("review the design together and reach consensus", 2),
            CoordinationStrategy::Collaborative
        );
        assert_eq!(
            classify("do this step by step", 2),
            CoordinationStrategy::Sequential
        );
        assert_eq!(
            classify("overhaul the entire storage layer", 2),
            CoordinationStrategy::Hierarchical
        );
    }

    #[test]
    fn test_classify_falls_back_on_agent_count() {
        assert_eq!(classify("add a cache", 1), CoordinationStrategy::Sequential);
        assert_eq!(classify("add a cache", 2), CoordinationStrategy::Parallel);
        assert_eq!(classify("add a cache", 3), CoordinationStrategy::Hierarchical);
    }

    #[test]
    fn test_parse_subtasks_filters_unknown_agents() {
        let text = r#"Here you go: [
            {"agent": "code-builder", "description": "build it"},
            {"agent": "stranger", "description": "???"},
            {"agent": "test-commander", "description": ""}
        ]"#;
        let tasks = parse_subtasks(text, &["code-builder", "test-commander"]);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].agent, "code-builder");
    }

    #[tokio::test]
    async fn test_sequential_threads_notes_through() {
        let mock = Arc::new(MockGenerator::with_responses(vec![
            "alpha notes",
            "beta notes",
        ]));
        let orch = orchestrator(mock);
        let agents = [scored("code-builder"), scored("state-manager")];

        let outcome = orch
            .coordinate("build it", &agents, CoordinationStrategy::Sequential)
            .await;

        assert_eq!(outcome.sessions.len(), 2);
        assert_eq!(outcome.sessions[0].output.as_deref(), Some("alpha notes"));
        assert_eq!(outcome.sessions[1].output.as_deref(), Some("beta notes"));
        assert!(outcome.summary.contains("alpha notes"));
        assert!(outcome.summary.contains("beta notes"));
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.rounds, 1);
        assert!(outcome.sessions[0].tokens_used > 0);

        let snapshot = orch.metrics().snapshot().await;
        assert_eq!(snapshot["code-builder"].successes, 1);
    }

    #[tokio::test]
    async fn test_parallel_synthesizes_summary() {
        let mock = Arc::new(MockGenerator::with_responses(vec![
            "analysis one",
            "analysis two",
            "merged briefing",
        ]));
        let orch = orchestrator(mock.clone());
        let agents = [scored("code-builder"), scored("api-integrator")];

        let outcome = orch
            .coordinate("wire the client", &agents, CoordinationStrategy::Parallel)
            .await;

        assert_eq!(outcome.summary, "merged briefing");
        assert_eq!(mock.calls(), 3);
        let outputs: Vec<&str> = outcome
            .sessions
            .iter()
            .filter_map(|s| s.output.as_deref())
            .collect();
        assert!(outputs.contains(&"analysis one"));
        assert!(outputs.contains(&"analysis two"));
    }

    #[tokio::test]
    async fn test_parallel_single_agent_skips_synthesis() {
        let mock = Arc::new(MockGenerator::with_responses(vec!["solo analysis"]));
        let orch = orchestrator(mock.clone());
        let agents = [scored("code-builder")];

        let outcome = orch
            .coordinate("build it", &agents, CoordinationStrategy::Parallel)
            .await;

        assert!(outcome.summary.contains("solo analysis"));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_branches_never_exceed_task_cap() {
        let gauge = Arc::new(GaugedGenerator {
            inner: MockGenerator::with_responses(vec![
                "area one",
                "area two",
                "area three",
                "area four",
                "merged briefing",
            ])
            .with_delay(100),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let config = OrchestratorConfig {
            max_parallel_tasks: 2,
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::new(config, gauge.clone());
        let agents = [
            scored("code-builder"),
            scored("state-manager"),
            scored("api-integrator"),
            scored("test-commander"),
        ];

        let outcome = orch
            .coordinate("audit all four areas", &agents, CoordinationStrategy::Parallel)
            .await;

        assert_eq!(outcome.sessions.len(), 4);
        assert!(outcome.failures.is_empty());
        // 四个分支挤两个并发位：上限封死，且确实吃满过
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hierarchical_dispatches_decomposed_subtasks() {
        let mock = Arc::new(MockGenerator::with_responses(vec![
            r#"[{"agent": "state-manager", "description": "model the cache"}]"#,
            "cache analysis",
            "final plan",
        ]));
        let orch = orchestrator(mock.clone());
        let agents = [scored("code-builder"), scored("state-manager")];

        let outcome = orch
            .coordinate("redesign storage", &agents, CoordinationStrategy::Hierarchical)
            .await;

        assert_eq!(outcome.summary, "final plan");
        assert_eq!(outcome.rounds, 2);
        // 只有 state-manager 领到了子任务
        assert_eq!(mock.calls(), 3);
        assert_eq!(outcome.sessions[0].agent, "code-builder");
        assert!(outcome
            .sessions
            .iter()
            .any(|s| s.agent == "state-manager" && s.output.as_deref() == Some("cache analysis")));
    }

    #[tokio::test]
    async fn test_hierarchical_falls_back_to_broadcast() {
        let mock = Arc::new(MockGenerator::with_responses(vec![
            "this is not json at all, sorry",
            "worker one",
            "worker two",
            "reviewed summary",
        ]));
        let orch = orchestrator(mock.clone());
        let agents = [scored("code-builder"), scored("state-manager")];

        let outcome = orch
            .coordinate("redesign storage", &agents, CoordinationStrategy::Hierarchical)
            .await;

        // 拆解失败后两个 agent 都领整条指令，再加验收
        assert_eq!(mock.calls(), 4);
        assert_eq!(outcome.summary, "reviewed summary");
    }

    #[tokio::test]
    async fn test_collaborative_stops_on_consensus() {
        let mock = Arc::new(MockGenerator::with_responses(vec![
            "my analysis",
            "CONSENSUS",
        ]));
        let orch = orchestrator(mock.clone());
        let agents = [scored("code-builder")];

        let outcome = orch
            .coordinate("build it", &agents, CoordinationStrategy::Collaborative)
            .await;

        assert_eq!(outcome.rounds, 2);
        assert_eq!(mock.calls(), 2);
        assert!(outcome.summary.contains("my analysis"));
    }

    #[tokio::test]
    async fn test_collaborative_respects_round_cap() {
        // 永不收敛，轮数到顶为止
        let mock = Arc::new(MockGenerator::with_responses(vec![
            "round one take",
            "round two take",
            "round three take",
        ]));
        let orch = orchestrator(mock.clone());
        let agents = [scored("code-builder")];

        let outcome = orch
            .coordinate("build it", &agents, CoordinationStrategy::Collaborative)
            .await;

        assert_eq!(outcome.rounds, 3);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_branch_failure_is_recorded_not_fatal() {
        let orch = orchestrator(Arc::new(FailingGenerator));
        let agents = [scored("code-builder")];

        let outcome = orch
            .coordinate("build it", &agents, CoordinationStrategy::Sequential)
            .await;

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].agent, "code-builder");
        assert!(outcome.failures[0].error.contains("backend down"));
        assert_eq!(outcome.sessions[0].state, AgentState::Failed);
        assert!(outcome.summary.is_empty());

        let snapshot = orch.metrics().snapshot().await;
        assert_eq!(snapshot["code-builder"].successes, 0);
        assert_eq!(snapshot["code-builder"].invocations, 1);
    }

    #[tokio::test]
    async fn test_orchestrate_selects_and_runs() {
        let orch = orchestrator(Arc::new(MockGenerator::new()));

        let outcome = orch
            .orchestrate("implement a websocket client module", &[])
            .await
            .unwrap();
        assert!(!outcome.agents.is_empty());
        assert!(!outcome.summary.is_empty());

        assert!(orch.orchestrate("zzz", &[]).await.is_none());
    }
}
