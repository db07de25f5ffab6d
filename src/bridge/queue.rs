//! 离线消息队列
//!
//! 连接断开期间积压出站消息，重连后按 FIFO 一次性排空。
//! 有界，满了丢最旧的一条（最新状态比陈旧消息值钱）。

use std::collections::VecDeque;

pub struct OfflineQueue {
    buf: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// 入队；满了先挤掉最旧的
    pub fn enqueue(&mut self, raw: String) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
            self.dropped += 1;
            tracing::debug!(dropped_total = self.dropped, "offline queue full, dropping oldest message");
        }
        self.buf.push_back(raw);
    }

    /// 原子排空：按入队顺序取出全部积压
    pub fn flush(&mut self) -> Vec<String> {
        self.buf.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 自队列创建以来被挤掉的消息条数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_preserved() {
        let mut queue = OfflineQueue::new(10);
        queue.enqueue("a".into());
        queue.enqueue("b".into());
        queue.enqueue("c".into());
        assert_eq!(queue.flush(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let mut queue = OfflineQueue::new(3);
        for raw in ["1", "2", "3", "4", "5"] {
            queue.enqueue(raw.into());
        }
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.flush(), vec!["3", "4", "5"]);
    }

    #[test]
    fn test_flush_is_one_shot() {
        let mut queue = OfflineQueue::new(4);
        queue.enqueue("x".into());
        assert_eq!(queue.flush().len(), 1);
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut queue = OfflineQueue::new(0);
        queue.enqueue("only".into());
        assert_eq!(queue.size(), 1);
        queue.enqueue("next".into());
        assert_eq!(queue.flush(), vec!["next"]);
    }
}
