//! 文本生成后端抽象
//!
//! 规划器、代码类动作处理器和编排器共用 TextGenerator：
//! generate（非流式）、generate_stream（流式，默认退化为单块）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};

/// 消息角色（与 OpenAI 兼容 API 一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 单条提示消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 文本生成后端 trait
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// 非流式生成
    async fn generate(&self, messages: &[Message]) -> Result<String, String>;

    /// 流式生成。默认实现先整体生成再作为单块返回，具体后端可覆盖
    async fn generate_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>, String> {
        let content = self.generate(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
