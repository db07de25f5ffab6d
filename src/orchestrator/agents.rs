//! 专职 agent 花名册与能力匹配
//!
//! 每个 agent 通过触发正则描述自己擅长的请求，选择器按命中比例算
//! 置信度，路径线索加分，历史成功率做小幅修正。正则在首次使用时
//! 编译一次后缓存。

use std::sync::OnceLock;

use regex::Regex;

use crate::orchestrator::session::MetricsBook;

/// 单个专职 agent 的静态描述
#[derive(Debug)]
pub struct AgentSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub capabilities: &'static [&'static str],
    /// 指令触发正则，全部带 (?i)
    pub patterns: &'static [&'static str],
    /// 工作区文件路径里出现这些片段时加分
    pub file_hints: &'static [&'static str],
    /// 并列时的出场顺序，数字小的在前
    pub priority: u8,
}

pub const AGENT_ROSTER: [AgentSpec; 6] = [
    AgentSpec {
        name: "code-builder",
        description: "Implements new features, modules and commands from scratch",
        capabilities: &["feature implementation", "scaffolding", "wiring modules together"],
        patterns: &[
            r"(?i)\b(implement|build|create|add|write)\b",
            r"(?i)\b(feature|function|module|component|command)\b",
            r"(?i)\b(develop|scaffold)\b",
        ],
        file_hints: &["src/"],
        priority: 1,
    },
    AgentSpec {
        name: "state-manager",
        description: "Designs state handling, caching and persistence layers",
        capabilities: &["state modelling", "cache policies", "persistence formats"],
        patterns: &[
            r"(?i)\b(state|store|cache|session)\b",
            r"(?i)\b(persist|persistence|storage|snapshot)\b",
            r"(?i)\b(queue|buffer|channel)\b",
        ],
        file_hints: &["store", "state", "cache", "persistence"],
        priority: 2,
    },
    AgentSpec {
        name: "type-guardian",
        description: "Keeps data models, schemas and trait boundaries sound",
        capabilities: &["type design", "schema evolution", "serialization formats"],
        patterns: &[
            r"(?i)\b(type|trait|schema|struct|enum)\b",
            r"(?i)\b(generic|lifetime|serializ)",
            r"(?i)\bdata model\b",
        ],
        file_hints: &["types", "schema", "model"],
        priority: 2,
    },
    AgentSpec {
        name: "api-integrator",
        description: "Connects external services, clients and wire protocols",
        capabilities: &["http clients", "websocket plumbing", "third party APIs"],
        patterns: &[
            r"(?i)\b(api|endpoint|rest|http|websocket)\b",
            r"(?i)\b(request|client|webhook|integration)\b",
            r"(?i)\b(protocol|sdk)\b",
        ],
        file_hints: &["api", "client", "bridge"],
        priority: 2,
    },
    AgentSpec {
        name: "test-commander",
        description: "Designs and hardens the test suite",
        capabilities: &["unit tests", "integration tests", "regression coverage"],
        patterns: &[
            r"(?i)\b(test|spec|coverage)\b",
            r"(?i)\b(unit|integration|regression)\b",
            r"(?i)\b(assert|mock|fixture)\b",
        ],
        file_hints: &["tests/", "_test"],
        priority: 3,
    },
    AgentSpec {
        name: "performance-optimizer",
        description: "Finds and removes latency, allocation and throughput problems",
        capabilities: &["profiling", "benchmarks", "hot path tuning"],
        patterns: &[
            r"(?i)\b(performance|optimi[sz]e|slow|latency)\b",
            r"(?i)\b(profil|benchmark|throughput)\b",
            r"(?i)\b(memory|alloc|cpu)\b",
        ],
        file_hints: &["bench"],
        priority: 3,
    },
];

fn roster_regexes() -> &'static Vec<Vec<Regex>> {
    static COMPILED: OnceLock<Vec<Vec<Regex>>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        AGENT_ROSTER
            .iter()
            .map(|spec| {
                spec.patterns
                    .iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .collect()
            })
            .collect()
    })
}

/// 带置信度的候选 agent
#[derive(Debug, Clone)]
pub struct ScoredAgent {
    pub spec: &'static AgentSpec,
    pub confidence: f32,
}

/// 根据指令、工作区文件和历史战绩挑 agent。
/// 置信度 = 正则命中比例，路径线索 +0.2，成功率相对中性值 ±0.1，
/// 低于阈值的淘汰，按置信度降序、优先级升序取前 max_agents 个。
pub async fn select_agents(
    instruction: &str,
    files: &[String],
    metrics: &MetricsBook,
    threshold: f32,
    max_agents: usize,
) -> Vec<ScoredAgent> {
    let mut scored = Vec::new();
    for (i, spec) in AGENT_ROSTER.iter().enumerate() {
        let regexes = &roster_regexes()[i];
        if regexes.is_empty() {
            continue;
        }
        let hits = regexes.iter().filter(|r| r.is_match(instruction)).count();
        if hits == 0 {
            // 指令没命中触发词的 agent 不靠文件线索出场
            continue;
        }
        let mut confidence = hits as f32 / regexes.len() as f32;
        if spec
            .file_hints
            .iter()
            .any(|h| files.iter().any(|f| f.contains(h)))
        {
            confidence += 0.2;
        }
        if let Some(rate) = metrics.success_rate(spec.name).await {
            confidence += (rate as f32 - 0.5) * 0.2;
        }
        let confidence = confidence.clamp(0.0, 1.0);
        if confidence >= threshold {
            scored.push(ScoredAgent { spec, confidence });
        }
    }

    scored.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.spec.priority.cmp(&b.spec.priority))
    });
    scored.truncate(max_agents);
    scored
}
