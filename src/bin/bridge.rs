//! Axon 桥接服务器
//!
//! 启动: cargo run --bin axon-bridge [config.toml]
//! 所有连接器接到同一地址，信封按 target 路由，同名后到者顶掉先到者。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use axon::bridge::server::BridgeServer;
use axon::config::load_config;
use axon::core::shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager};
use axon::observability;

struct ServerCleanup {
    server: Arc<BridgeServer>,
}

#[async_trait::async_trait]
impl ShutdownCleanup for ServerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let open = self.server.session_count().await;
        if open > 0 {
            tracing::info!(sessions = open, "closing client sessions");
        }
        self.server.stop().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bridge-server"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_default();

    let server = Arc::new(BridgeServer::new(cfg.to_server_config()));
    let addr = server
        .start()
        .await
        .context("failed to start bridge server")?;
    tracing::info!(%addr, "bridge server listening");

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(ServerCleanup {
        server: Arc::clone(&server),
    });

    shutdown.wait_for_shutdown().await;
    coordinator.run_cleanup().await;

    Ok(())
}
