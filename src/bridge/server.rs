//! 桥接服务器
//!
//! 中枢路由：接受 WebSocket 连接，按首条信封的 source 登记会话
//! （同名后到者顶替先到者），按 target 定向转发原文、无 target 广播
//! 给除发送方外的所有会话。周期性服务端 ping 兼清理超时会话。
//!
//! 就绪的定义是监听 socket 真正绑定成功；local_addr 在 bind 之后
//! 才可见，集成测试靠它拿随机端口。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::bridge::envelope::{Envelope, EnvelopeKind};
use crate::core::BridgeError;

/// 服务器在信封里使用的 source 名
pub const SERVER_NAME: &str = "bridge";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// 服务端 ping 与清理巡检的周期
    pub ping_interval_secs: u64,
    /// 超过该时长无任何活动的会话被关闭
    pub session_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            ping_interval_secs: 30,
            session_timeout_secs: 90,
        }
    }
}

#[allow(dead_code)]
struct ClientSession {
    name: String,
    /// 物理连接标识；同名顶替后用它区分新旧连接
    conn_id: String,
    tx: mpsc::UnboundedSender<String>,
    /// 取消它就关掉对应 socket 的读循环
    cancel: CancellationToken,
    last_seen: Instant,
    connected_at: Instant,
}

#[derive(Clone)]
pub struct BridgeServer {
    config: Arc<ServerConfig>,
    sessions: Arc<RwLock<HashMap<String, ClientSession>>>,
    ready: Arc<watch::Sender<Option<SocketAddr>>>,
    cancel: CancellationToken,
}

impl BridgeServer {
    pub fn new(config: ServerConfig) -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(ready),
            cancel: CancellationToken::new(),
        }
    }

    /// 绑定监听地址并启动接受循环，返回实际绑定地址（支持端口 0）
    pub async fn start(&self) -> Result<SocketAddr, BridgeError> {
        let addr: SocketAddr = self.config.bind_addr.parse().map_err(|e| {
            BridgeError::Validation(format!("invalid bind address {}: {}", self.config.bind_addr, e))
        })?;
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        self.ready.send_replace(Some(local));
        tracing::info!("bridge listening on ws://{}", local);

        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(listener).await });
        Ok(local)
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.ready.send_replace(None);
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for session in sessions.values() {
            session.cancel.cancel();
        }
        sessions.clear();
        if count > 0 {
            tracing::info!(sessions = count, "closed all sessions");
        }
        tracing::info!("bridge server stopped");
    }

    /// 实际监听地址；未启动（或已停止）为 None
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.ready.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.ready.subscribe()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut sweep = tokio::time::interval(Duration::from_secs(self.config.ping_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep_sessions().await,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_connection(stream, peer).await {
                                    tracing::warn!(peer = %peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "accept error"),
                    }
                }
            }
        }
    }

    /// 巡检：给活跃会话发服务端 ping，关掉超时没动静的
    async fn sweep_sessions(&self) {
        let timeout = Duration::from_secs(self.config.session_timeout_secs);
        let mut stale = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (name, session) in sessions.iter() {
                if session.last_seen.elapsed() > timeout {
                    stale.push(name.clone());
                } else if let Ok(raw) = serde_json::to_string(&Envelope::ping(SERVER_NAME)) {
                    let _ = session.tx.send(raw);
                }
            }
        }
        if !stale.is_empty() {
            let mut sessions = self.sessions.write().await;
            for name in stale {
                // 写锁前可能刚有活动，再确认一次
                let expired = sessions
                    .get(&name)
                    .map(|s| s.last_seen.elapsed() > timeout)
                    .unwrap_or(false);
                if expired {
                    tracing::info!(client = %name, "closing silent session");
                    if let Some(session) = sessions.remove(&name) {
                        session.cancel.cancel();
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| BridgeError::Io(format!("websocket handshake failed: {}", e)))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let conn_id = uuid::Uuid::new_v4().to_string();
        let conn_cancel = CancellationToken::new();
        let mut bound_name: Option<String> = None;

        tracing::info!(peer = %peer, "new bridge connection");

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = conn_cancel.cancelled() => {
                    tracing::info!(peer = %peer, "closing displaced or expired connection");
                    break;
                }
                incoming = ws_rx.next() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            let msg = match incoming {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "websocket receive error");
                    break;
                }
            };
            match msg {
                WsMessage::Text(text) => {
                    let envelope: Envelope = match serde_json::from_str(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "dropping malformed envelope");
                            continue;
                        }
                    };
                    if let Err(e) = envelope.validate() {
                        tracing::warn!(peer = %peer, error = %e, "dropping invalid envelope");
                        continue;
                    }

                    // 首条信封即握手：source 绑定本连接
                    let sender = match &bound_name {
                        Some(name) => name.clone(),
                        None => {
                            self.register_session(&envelope.source, &conn_id, tx.clone(), conn_cancel.clone())
                                .await;
                            bound_name = Some(envelope.source.clone());
                            envelope.source.clone()
                        }
                    };
                    self.touch(&sender).await;

                    match &envelope.kind {
                        EnvelopeKind::Ping => {
                            let pong = Envelope::pong(SERVER_NAME, Some(envelope.message_id.clone()));
                            if let Ok(raw) = serde_json::to_string(&pong) {
                                let _ = tx.send(raw);
                            }
                        }
                        // pong 只刷新 last_seen
                        EnvelopeKind::Pong => {}
                        _ => self.route(&envelope, &sender, &text).await,
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        if let Some(name) = bound_name {
            let mut sessions = self.sessions.write().await;
            // 同名新连接可能已顶替本会话，只在仍指向本连接时移除
            let owned = sessions.get(&name).map(|s| s.conn_id == conn_id).unwrap_or(false);
            if owned {
                sessions.remove(&name);
                tracing::info!(client = %name, "session closed");
            }
        }
        // 写通道全部释放后让 writer 排空残留（顶替通知等），不中途掐断
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_millis(200), writer).await;
        tracing::info!(peer = %peer, "bridge connection closed");
        Ok(())
    }

    async fn register_session(
        &self,
        name: &str,
        conn_id: &str,
        tx: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.remove(name) {
            // 后到者获胜：先通知旧连接，再关掉它的 socket
            tracing::info!(
                client = %name,
                uptime_secs = old.connected_at.elapsed().as_secs(),
                "replacing existing session for duplicate client name"
            );
            let notice = Envelope::notification(
                SERVER_NAME,
                serde_json::json!({ "reason": "session-replaced", "client": name }),
            );
            if let Ok(raw) = serde_json::to_string(&notice) {
                let _ = old.tx.send(raw);
            }
            old.cancel.cancel();
        }
        sessions.insert(
            name.to_string(),
            ClientSession {
                name: name.to_string(),
                conn_id: conn_id.to_string(),
                tx,
                cancel,
                last_seen: Instant::now(),
                connected_at: Instant::now(),
            },
        );
        tracing::info!(client = %name, "session registered");
    }

    async fn touch(&self, name: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(name) {
            session.last_seen = Instant::now();
        }
    }

    /// 定向转发原文（不重新序列化），目标未知丢弃；无 target 广播给其他会话
    async fn route(&self, envelope: &Envelope, sender: &str, raw: &str) {
        let sessions = self.sessions.read().await;
        match envelope.target.as_deref() {
            Some(target) => match sessions.get(target) {
                Some(session) => {
                    if session.tx.send(raw.to_string()).is_err() {
                        tracing::warn!(target = %target, "forward failed, session channel closed");
                    } else {
                        tracing::debug!(from = %sender, to = %target, kind = %envelope.kind, "forwarded");
                    }
                }
                None => {
                    tracing::warn!(target = %target, kind = %envelope.kind, "dropping envelope for unknown target");
                }
            },
            None => {
                let mut delivered = 0;
                for (name, session) in sessions.iter() {
                    if name != sender && session.tx.send(raw.to_string()).is_ok() {
                        delivered += 1;
                    }
                }
                tracing::debug!(from = %sender, kind = %envelope.kind, delivered, "broadcast");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.session_timeout_secs, 90);
    }

    #[tokio::test]
    async fn test_not_ready_before_start() {
        let server = BridgeServer::new(ServerConfig::default());
        assert!(server.local_addr().is_none());
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_on_ephemeral_port_reports_real_addr() {
        let server = BridgeServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        });
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        server.stop().await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_invalid_bind_addr_rejected() {
        let server = BridgeServer::new(ServerConfig {
            bind_addr: "not-an-addr".to_string(),
            ..Default::default()
        });
        assert!(matches!(server.start().await, Err(BridgeError::Validation(_))));
    }
}
