//! 错误类型定义
//!
//! 桥接与任务执行共用一个错误分类：连接断开、超时、校验失败、
//! 审批拒绝、执行失败、回滚失败。Clone 是必须的，断线时要把同一个
//! 错误批量发给所有挂起命令的等待方。

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// 连接断开（挂起命令批量拒绝、结果通道被丢弃时使用）
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Timeout: {0}")]
    Timeout(String),

    /// 信封、计划或参数校验失败。格式错误的入站消息在边界丢弃并记日志
    #[error("Validation error: {0}")]
    Validation(String),

    /// 审批被拒绝。这是破坏性步骤的正常终态，不当系统故障处理
    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Rollback failed: {0}")]
    RollbackFailure(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::Timeout("command cmd-1 exceeded 30000ms".to_string());
        assert!(err.to_string().contains("Timeout"));

        let err = BridgeError::ApprovalDenied("step-2".to_string());
        assert_eq!(err.to_string(), "Approval denied: step-2");
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = BridgeError::ConnectionLost;
        let copy = err.clone();
        assert_eq!(copy.to_string(), "Connection lost");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
