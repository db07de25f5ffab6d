//! 客户端连接管理器
//!
//! 维护到桥接服务器的单条长连接：断线按指数退避重连（上限次数用尽
//! 进入终态 Failed），应用层 ping/pong 判活，断线期间出站消息进离线
//! 队列、重连后先排空再发新消息，命令经关联表配对结果。
//!
//! 结构上就是「一个后台 run 循环 + 全 Arc 字段的可克隆句柄」，
//! 所有公开方法都可以在任意任务里并发调用。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::bridge::correlator::CommandCorrelator;
use crate::bridge::envelope::{Envelope, EnvelopeKind};
use crate::bridge::queue::OfflineQueue;
use crate::core::BridgeError;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub url: String,
    /// 客户端名：信封 source，服务器据此登记会话
    pub name: String,
    /// 首次重试的退避基数
    pub reconnect_interval_ms: u64,
    /// 退避封顶
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_ms: u64,
    /// 超过该时长没有任何 ping/pong 即判连接死亡
    pub pong_grace_ms: u64,
    pub message_queue_max: usize,
    pub command_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000".to_string(),
            name: "client".to_string(),
            reconnect_interval_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            ping_interval_ms: 30_000,
            pong_grace_ms: 75_000,
            message_queue_max: 100,
            command_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// 重连次数用尽的终态，只有重新 connect() 才会离开
    Failed,
}

#[derive(Clone)]
pub struct BridgeConnector {
    config: Arc<ConnectorConfig>,
    correlator: CommandCorrelator,
    queue: Arc<Mutex<OfflineQueue>>,
    /// 当前连接的写通道；None 表示断开
    writer: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    last_heartbeat: Arc<watch::Sender<Option<Instant>>>,
    inbound_tx: broadcast::Sender<Envelope>,
    cancel: CancellationToken,
}

impl BridgeConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (heartbeat_tx, _) = watch::channel(None);
        let (inbound_tx, _) = broadcast::channel(256);
        Self {
            queue: Arc::new(Mutex::new(OfflineQueue::new(config.message_queue_max))),
            config: Arc::new(config),
            correlator: CommandCorrelator::new(),
            writer: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            last_heartbeat: Arc::new(heartbeat_tx),
            inbound_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// 启动后台连接循环
    pub fn connect(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// 主动断开：停循环、清写通道、拒绝所有挂起命令
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        *self.writer.lock().await = None;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        let rejected = self.correlator.reject_all(BridgeError::ConnectionLost).await;
        if rejected > 0 {
            tracing::info!(rejected, "rejected pending commands on disconnect");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// 订阅入站信封（心跳和命令结果在内部消化，不会出现在这里）
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Envelope> {
        self.inbound_tx.subscribe()
    }

    /// 距上次收到 ping/pong 的时长
    pub fn time_since_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat.borrow().map(|at| at.elapsed())
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.size()
    }

    pub fn correlator(&self) -> &CommandCorrelator {
        &self.correlator
    }

    /// 仅在连接打开时发送；断开返回 false，不入队
    pub async fn send(&self, envelope: &Envelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(raw) => self.send_raw(&raw).await,
            Err(e) => {
                tracing::warn!(error = %e, "envelope serialize failed");
                false
            }
        }
    }

    /// 发送，断开则进离线队列
    pub async fn send_or_queue(&self, envelope: &Envelope) {
        let raw = match serde_json::to_string(envelope) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "envelope serialize failed");
                return;
            }
        };
        if !self.send_raw(&raw).await {
            let mut queue = self.queue.lock().await;
            queue.enqueue(raw);
            tracing::debug!(queued = queue.size(), "connection closed, message queued");
        }
    }

    async fn send_raw(&self, raw: &str) -> bool {
        let guard = self.writer.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(raw.to_string()).is_ok(),
            None => false,
        }
    }

    /// 发出命令并等待配对结果。命令先登记再发送，断线时会被排队、
    /// 重连后重放；等待超时与连接状态无关，由关联表的定时器裁决。
    pub async fn send_command(
        &self,
        kind: EnvelopeKind,
        target: &str,
        payload: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, BridgeError> {
        let timeout = timeout_ms.unwrap_or(self.config.command_timeout_ms);
        let envelope = Envelope::new(kind, payload, &self.config.name)
            .to(target)
            .with_timeout(timeout);

        let rx = self.correlator.register_command(&envelope.message_id, timeout).await;
        self.send_or_queue(&envelope).await;

        match rx.await {
            Ok(result) => result,
            // 发送端整个被丢弃（disconnect 清表之外的路径），按断线处理
            Err(_) => Err(BridgeError::ConnectionLost),
        }
    }

    async fn run(&self) {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.state_tx.send_replace(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    attempt = 0;
                    tracing::info!(url = %self.config.url, name = %self.config.name, "bridge connection established");
                    self.drive(ws_stream).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                    let rejected = self.correlator.reject_all(BridgeError::ConnectionLost).await;
                    if rejected > 0 {
                        tracing::info!(rejected, "rejected pending commands after connection loss");
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.config.url, attempt, error = %e, "bridge connection failed");
                }
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                tracing::error!(
                    attempts = self.config.max_reconnect_attempts,
                    "reconnect attempts exhausted, giving up"
                );
                self.state_tx.send_replace(ConnectionState::Failed);
                return;
            }

            let delay = backoff_delay(
                self.config.reconnect_interval_ms,
                attempt - 1,
                self.config.max_reconnect_delay_ms,
            );
            tracing::info!(attempt, delay_ms = delay, "reconnecting after backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// 驱动一条已建立的连接直到断开
    async fn drive(&self, ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // 积压消息先进写通道，顺序保证在任何新消息之前
        let backlog = self.queue.lock().await.flush();
        if !backlog.is_empty() {
            tracing::info!(count = backlog.len(), "flushing queued messages");
            for raw in backlog {
                let _ = tx.send(raw);
            }
        }
        *self.writer.lock().await = Some(tx.clone());
        self.last_heartbeat.send_replace(Some(Instant::now()));
        self.state_tx.send_replace(ConnectionState::Connected);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                    break;
                }
            }
        });

        let mut ping_timer = tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms.max(1)));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ping_timer.tick() => {
                    let silent = self.time_since_heartbeat().unwrap_or_default();
                    if silent > Duration::from_millis(self.config.pong_grace_ms) {
                        tracing::warn!(
                            silent_ms = silent.as_millis() as u64,
                            "no heartbeat within grace window, treating connection as dead"
                        );
                        break;
                    }
                    let ping = Envelope::ping(&self.config.name);
                    if let Ok(raw) = serde_json::to_string(&ping) {
                        let _ = tx.send(raw);
                    }
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => self.handle_inbound(&text, &tx).await,
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::info!("bridge connection closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "websocket receive error");
                            break;
                        }
                    }
                }
            }
        }

        *self.writer.lock().await = None;
        self.last_heartbeat.send_replace(None);
        writer.abort();
    }

    async fn handle_inbound(&self, text: &str, tx: &mpsc::UnboundedSender<String>) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        if let Err(e) = envelope.validate() {
            tracing::warn!(error = %e, "dropping invalid envelope");
            return;
        }

        match &envelope.kind {
            EnvelopeKind::Ping => {
                self.last_heartbeat.send_replace(Some(Instant::now()));
                let pong = Envelope::pong(&self.config.name, Some(envelope.message_id.clone()));
                if let Ok(raw) = serde_json::to_string(&pong) {
                    let _ = tx.send(raw);
                }
            }
            EnvelopeKind::Pong => {
                self.last_heartbeat.send_replace(Some(Instant::now()));
            }
            EnvelopeKind::CommandResult => {
                let key = envelope.correlation_key().to_string();
                self.correlator.handle_result(&key, envelope.payload.clone()).await;
            }
            _ => {
                // 其余种类交给订阅方（命令服务、通知消费者）
                let _ = self.inbound_tx.send(envelope);
            }
        }
    }
}

/// 指数退避：base * 2^attempt，封顶 max
fn backoff_delay(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    let exp = attempt.min(16);
    base_ms.saturating_mul(1u64 << exp).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(url: &str) -> ConnectorConfig {
        ConnectorConfig {
            url: url.to_string(),
            name: "test-client".to_string(),
            reconnect_interval_ms: 10,
            max_reconnect_delay_ms: 40,
            max_reconnect_attempts: 2,
            ping_interval_ms: 100,
            pong_grace_ms: 1_000,
            message_queue_max: 4,
            command_timeout_ms: 100,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1_000, 0, 30_000), 1_000);
        assert_eq!(backoff_delay(1_000, 1, 30_000), 2_000);
        assert_eq!(backoff_delay(1_000, 3, 30_000), 8_000);
        assert_eq!(backoff_delay(1_000, 10, 30_000), 30_000);
        // 大指数不溢出
        assert_eq!(backoff_delay(u64::MAX / 2, 16, u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_send_fails_closed_and_send_or_queue_buffers() {
        let connector = BridgeConnector::new(test_config("ws://127.0.0.1:1"));

        let envelope = Envelope::notification("test-client", json!({"n": 1}));
        assert!(!connector.send(&envelope).await);
        assert_eq!(connector.queued().await, 0);

        connector.send_or_queue(&envelope).await;
        connector.send_or_queue(&envelope).await;
        assert_eq!(connector.queued().await, 2);
    }

    #[tokio::test]
    async fn test_command_times_out_while_disconnected() {
        let connector = BridgeConnector::new(test_config("ws://127.0.0.1:1"));

        let err = connector
            .send_command(EnvelopeKind::CommandRequest, "worker", json!({"x": 1}), Some(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        // 命令信封进了离线队列等待重连
        assert_eq!(connector.queued().await, 1);
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_end_in_failed_state() {
        // 先拿一个确定无人监听的端口
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = BridgeConnector::new(test_config(&format!("ws://{}", addr)));
        let mut state_rx = connector.subscribe_state();
        connector.connect();

        let reached_failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *state_rx.borrow() == ConnectionState::Failed {
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(reached_failed.is_ok(), "connector never reached Failed state");
    }
}
