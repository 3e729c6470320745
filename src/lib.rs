pub mod access;
pub mod common;
pub mod config;
pub mod config_validation;
pub mod connect_handler;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod forward_proxy;
pub mod logging;
pub mod proxy;
pub mod request;
pub mod scheduler;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use connect_handler::ConnectHandler;
pub use error::ProxyError;
pub use forward_proxy::ForwardProxy;
pub use proxy::ProxyServer;
pub use scheduler::Scheduler;
pub use tunnel::TunnelRelay;
