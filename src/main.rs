use bifrost_tunnel::{
    config::Config, config_validation::validate_config, logging, proxy::ProxyServer, scheduler::Scheduler,
};
use clap::Parser;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[clap(
    version = "0.1.0",
    author = "Bifrost Tunnel",
    about = "A forward HTTP proxy with CONNECT tunneling"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for connecting to an origin")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "MILLIS", conflicts_with = "connect_timeout", help = "Connect timeout in milliseconds")]
    connect_timeout_ms: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Buffer size for each tunnel direction")]
    buffer_size: Option<usize>,

    #[clap(long, value_name = "SECONDS", help = "Close tunnels idle for this long (default: never)")]
    tunnel_idle_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "How long to keep draining after one side half-closes")]
    drain_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Number of runtime worker threads")]
    worker_threads: Option<usize>,

    #[clap(long, help = "Disable origin connection pooling")]
    no_connection_pool: bool,

    #[clap(long, value_name = "NUM", help = "Maximum idle origin connections per host")]
    pool_max_idle: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "NUM", help = "Maximum concurrent client connections")]
    max_connections: Option<usize>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(long, value_name = "PATTERN", help = "Only allow these hosts (can be used multiple times)")]
    allow_host: Vec<String>,

    #[clap(long, value_name = "PATTERN", help = "Deny these hosts (can be used multiple times)")]
    deny_host: Vec<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    apply_args(&mut config, &args)?;

    logging::init_from_config(&config, args.log_level.as_deref(), args.log_format.as_deref())?;

    let validation = validate_config(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("Suggestion: {}", suggestion);
    }
    if !validation.is_valid {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err(format!("Invalid configuration: {}", validation.errors.join("; ")).into());
    }

    let runtime = Scheduler::build_runtime(config.worker_threads())?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Scheduler::new();
    let server = ProxyServer::bind(&config, scheduler.clone()).await?;
    info!("Starting forward proxy on {}", server.local_addr());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Proxy server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    scheduler.shutdown(SHUTDOWN_GRACE).await;
    info!("Proxy stopped");
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.logging = Some(Default::default());
    config.to_file(file_path)
}

fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse::<SocketAddr>()?;
    }
    if args.connect_timeout.is_some() {
        config.connect_timeout_secs = args.connect_timeout;
        config.connect_timeout_ms = None;
    }
    if args.connect_timeout_ms.is_some() {
        config.connect_timeout_ms = args.connect_timeout_ms;
    }
    if args.buffer_size.is_some() {
        config.buffer_size = args.buffer_size;
    }
    if args.tunnel_idle_timeout.is_some() {
        config.tunnel_idle_timeout_secs = args.tunnel_idle_timeout;
    }
    if args.drain_timeout.is_some() {
        config.drain_timeout_secs = args.drain_timeout;
    }
    if args.worker_threads.is_some() {
        config.worker_threads = args.worker_threads;
    }
    if args.no_connection_pool {
        config.connection_pool_enabled = Some(false);
    }
    if args.pool_max_idle.is_some() {
        config.pool_max_idle_per_host = args.pool_max_idle;
    }
    if args.max_header_size.is_some() {
        config.max_header_size = args.max_header_size;
    }
    if args.max_connections.is_some() {
        config.max_connections = args.max_connections;
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }
    config.allowed_hosts.extend(args.allow_host.iter().cloned());
    config.denied_hosts.extend(args.deny_host.iter().cloned());
    Ok(())
}
