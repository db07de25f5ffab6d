//! 信封协议
//!
//! 桥接双方交换的统一消息格式。字段名走 camelCase 与既有对端保持兼容，
//! `type` 字段区分消息种类；未知种类原样保留并透传，不在本端丢弃。
//!
//! 命令类信封通过 `correlationId`（缺省退回 `messageId`）把请求和结果配对。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::BridgeError;

/// 消息种类。命令与心跳用 snake_case，事件通知沿用对端的连字符命名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "command_request")]
    CommandRequest,
    #[serde(rename = "command_execute")]
    CommandExecute,
    #[serde(rename = "command_result")]
    CommandResult,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "file-open")]
    FileOpen,
    #[serde(rename = "learning-sync")]
    LearningSync,
    #[serde(rename = "project-update")]
    ProjectUpdate,
    #[serde(rename = "notification")]
    Notification,
    /// 未收录的种类：保留原始字符串，路由时原样转发
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnvelopeKind::CommandRequest => "command_request",
            EnvelopeKind::CommandExecute => "command_execute",
            EnvelopeKind::CommandResult => "command_result",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::FileOpen => "file-open",
            EnvelopeKind::LearningSync => "learning-sync",
            EnvelopeKind::ProjectUpdate => "project-update",
            EnvelopeKind::Notification => "notification",
            EnvelopeKind::Other(s) => s.as_str(),
        };
        write!(f, "{}", name)
    }
}

/// 通用信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
    pub message_id: String,
    /// Unix 毫秒
    pub timestamp: u64,
    /// 发送方客户端名
    pub source: String,
    /// 目标客户端名；缺省表示广播
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// 命令配对 id；结果信封携带发起方的 messageId
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: Value, source: &str) -> Self {
        Self {
            kind,
            payload,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            source: source.to_string(),
            target: None,
            correlation_id: None,
            timeout_ms: None,
        }
    }

    /// 设定目标（定向路由）
    pub fn to(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn ping(source: &str) -> Self {
        Self::new(EnvelopeKind::Ping, Value::Null, source)
    }

    pub fn pong(source: &str, correlation_id: Option<String>) -> Self {
        let mut envelope = Self::new(EnvelopeKind::Pong, Value::Null, source);
        envelope.correlation_id = correlation_id;
        envelope
    }

    pub fn command_result(source: &str, target: &str, correlation_id: &str, payload: Value) -> Self {
        let mut envelope = Self::new(EnvelopeKind::CommandResult, payload, source).to(target);
        envelope.correlation_id = Some(correlation_id.to_string());
        envelope
    }

    pub fn notification(source: &str, payload: Value) -> Self {
        Self::new(EnvelopeKind::Notification, payload, source)
    }

    /// 命令结果的配对键：优先 correlationId，缺省回退到 messageId
    pub fn correlation_key(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.message_id)
    }

    /// 入站信封在路由前做最小校验，不合格的直接丢弃
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.message_id.trim().is_empty() {
            return Err(BridgeError::Validation("envelope missing messageId".into()));
        }
        if self.source.trim().is_empty() {
            return Err(BridgeError::Validation("envelope missing source".into()));
        }
        Ok(())
    }
}
