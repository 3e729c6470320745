use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default bound on the outbound connect phase of a CONNECT or forwarded request.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
/// Default size of the buffer each side of a tunnel fills into.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Default bound on draining the remaining direction after one side half-closes.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 10;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    // Overrides connect_timeout_secs for sub-second timeouts
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    // Fill buffer size for each tunnel direction
    #[serde(default)]
    pub buffer_size: Option<usize>,
    // No tunnel idle timeout unless set
    #[serde(default)]
    pub tunnel_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
    // Idle timeout for pooled origin connections
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub connection_pool_enabled: Option<bool>,
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: Option<usize>,
    // Host patterns: "example.com", ".example.com", "*.example.com"
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub denied_hosts: Vec<String>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_max_header_size() -> Option<usize> {
    Some(DEFAULT_MAX_HEADER_SIZE)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: Some(1000),
            connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT_SECS),
            connect_timeout_ms: None,
            buffer_size: Some(DEFAULT_BUFFER_SIZE),
            tunnel_idle_timeout_secs: None,
            drain_timeout_secs: Some(DEFAULT_DRAIN_TIMEOUT_SECS),
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
            worker_threads: None,
            private_key: None,
            certificate: None,
            connection_pool_enabled: Some(true),
            pool_max_idle_per_host: Some(DEFAULT_POOL_MAX_IDLE_PER_HOST),
            max_header_size: default_max_header_size(),
            allowed_hosts: Vec::new(),
            denied_hosts: Vec::new(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        match self.connect_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    pub fn tunnel_idle_timeout(&self) -> Option<Duration> {
        self.tunnel_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs.unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size.unwrap_or(DEFAULT_MAX_HEADER_SIZE)
    }

    pub fn pool_enabled(&self) -> bool {
        self.connection_pool_enabled.unwrap_or(true)
    }

    pub fn pool_max_idle_per_host(&self) -> usize {
        self.pool_max_idle_per_host.unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST)
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get)
    }
}
