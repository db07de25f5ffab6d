//! 桥接层：信封协议、客户端连接器、中心路由服务器与命令服务

pub mod connector;
pub mod correlator;
pub mod envelope;
pub mod queue;
pub mod server;
pub mod service;

pub use connector::{BridgeConnector, ConnectionState, ConnectorConfig};
pub use correlator::CommandCorrelator;
pub use envelope::{Envelope, EnvelopeKind};
pub use queue::OfflineQueue;
pub use server::{BridgeServer, ServerConfig};
pub use service::CommandService;
