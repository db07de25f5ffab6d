//! Mock 生成后端
//!
//! 测试用：按脚本顺序吐回复，脚本耗尽后回落为「mock: <最后一条用户消息>」。
//! 可加固定延迟，用来测并发上限之类的时序性质。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::traits::{Message, Role, TextGenerator};

pub struct MockGenerator {
    responses: Mutex<VecDeque<String>>,
    delay_ms: u64,
    calls: AtomicUsize,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            delay_ms: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_responses<T: Into<String>>(responses: Vec<T>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            delay_ms: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub async fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().await.push_back(response.into());
    }

    /// 已处理的 generate 调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if let Some(scripted) = self.responses.lock().await.pop_front() {
            return Ok(scripted);
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        Ok(format!("mock: {}", last_user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let mock = MockGenerator::with_responses(vec!["first", "second"]);
        let messages = [Message::user("q")];
        assert_eq!(mock.generate(&messages).await.unwrap(), "first");
        assert_eq!(mock.generate(&messages).await.unwrap(), "second");
        assert_eq!(mock.generate(&messages).await.unwrap(), "mock: q");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_push_response_appends() {
        let mock = MockGenerator::new();
        mock.push_response("late addition").await;
        assert_eq!(mock.generate(&[Message::user("x")]).await.unwrap(), "late addition");
    }
}
