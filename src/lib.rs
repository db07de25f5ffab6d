//! Axon - 跨进程指令桥与自治任务执行引擎
//!
//! 模块划分：
//! - **bridge**: 指令桥（中心路由服务器 + 持久 WebSocket 连接器 + 指令服务）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与优雅关闭
//! - **llm**: 文本生成后端抽象（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **orchestrator**: 多 agent 协同（名册选择 + 四种协同策略）
//! - **task**: 任务规划、依赖调度、审批、重试与回滚、持久化
//! - **tools**: 受限文件系统与 shell 运行器

pub mod bridge;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod task;
pub mod tools;

pub use crate::core::BridgeError;
