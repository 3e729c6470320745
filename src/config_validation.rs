//! Startup validation of the proxy configuration.
//!
//! Errors stop the binary from starting; warnings and suggestions are logged.

use crate::config::Config;
use std::net::IpAddr;

/// Comprehensive validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::success();

    validate_listen_address(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_buffers(config, &mut result);
    validate_pool(config, &mut result);
    validate_tls(config, &mut result);
    validate_access_rules(config, &mut result);

    result
}

fn validate_listen_address(config: &Config, result: &mut ValidationResult) {
    let addr = config.listen_addr;
    if addr.port() != 0 && addr.port() < 1024 {
        result.add_warning(format!(
            "Using privileged port {} - may require elevated privileges",
            addr.port()
        ));
    }

    if addr.ip().is_unspecified() {
        result.add_warning(format!(
            "Binding to all interfaces ({}) exposes the proxy to external networks",
            addr.ip()
        ));
        if config.allowed_hosts.is_empty() {
            result.add_suggestion(
                "Consider restricting reachable hosts with allowed_hosts when listening publicly".to_string(),
            );
        }
    }

    if let Some(0) = config.max_connections {
        result.add_error("max_connections must be greater than 0".to_string());
    }
    if let Some(0) = config.worker_threads {
        result.add_error("worker_threads must be greater than 0".to_string());
    }
}

fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
    if let Some(0) = config.connect_timeout_secs {
        result.add_error("connect_timeout_secs must be greater than 0".to_string());
    }
    if let Some(0) = config.connect_timeout_ms {
        result.add_error("connect_timeout_ms must be greater than 0 when set".to_string());
    }
    if let Some(secs) = config.connect_timeout_secs {
        if secs > 120 {
            result.add_warning(format!(
                "Long connect timeout ({}s) keeps clients waiting on unreachable targets",
                secs
            ));
        }
    }

    if let Some(0) = config.drain_timeout_secs {
        result.add_warning(
            "drain_timeout_secs of 0 closes a tunnel as soon as either side half-closes".to_string(),
        );
    }

    if let Some(0) = config.tunnel_idle_timeout_secs {
        result.add_error("tunnel_idle_timeout_secs must be greater than 0 when set".to_string());
    }

    if let Some(0) = config.idle_timeout_secs {
        result.add_error("idle_timeout_secs must be greater than 0".to_string());
    }
}

fn validate_buffers(config: &Config, result: &mut ValidationResult) {
    match config.buffer_size {
        Some(0) => result.add_error("buffer_size must be greater than 0".to_string()),
        Some(size) if size < 512 => result.add_suggestion(format!(
            "buffer_size of {} bytes causes many small reads; 4096 or more is typical",
            size
        )),
        Some(size) if size > 1024 * 1024 => result.add_warning(format!(
            "buffer_size of {} bytes is allocated per tunnel direction",
            size
        )),
        _ => {}
    }

    if let Some(size) = config.max_header_size {
        if size < 1024 {
            result.add_error(format!(
                "max_header_size of {} bytes is too small for real request heads",
                size
            ));
        }
    }
}

fn validate_pool(config: &Config, result: &mut ValidationResult) {
    let pooling = config.pool_enabled();
    match config.pool_max_idle_per_host {
        Some(idle) if idle > 0 && !pooling => result.add_warning(format!(
            "pool_max_idle_per_host is {} but connection pooling is disabled",
            idle
        )),
        Some(0) if pooling => result.add_suggestion(
            "pool_max_idle_per_host of 0 disables pooling; set connection_pool_enabled to false instead".to_string(),
        ),
        _ => {}
    }
}

fn validate_tls(config: &Config, result: &mut ValidationResult) {
    match (&config.private_key, &config.certificate) {
        (Some(_), None) => result.add_error("private_key is set without certificate".to_string()),
        (None, Some(_)) => result.add_error("certificate is set without private_key".to_string()),
        (Some(key), Some(cert)) => {
            for (name, path) in [("private_key", key), ("certificate", cert)] {
                if !std::path::Path::new(path).exists() {
                    result.add_error(format!("{} file not found: {}", name, path));
                }
            }
        }
        (None, None) => {}
    }
}

fn validate_access_rules(config: &Config, result: &mut ValidationResult) {
    for pattern in config.allowed_hosts.iter().chain(&config.denied_hosts) {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            result.add_warning("Empty host pattern is ignored".to_string());
        } else if trimmed.contains(':') && trimmed.parse::<IpAddr>().is_err() {
            result.add_warning(format!(
                "Host pattern '{}' contains a port; patterns match host names only",
                pattern
            ));
        } else if trimmed.contains('*') && trimmed != "*" && !trimmed.starts_with("*.") {
            result.add_warning(format!(
                "Host pattern '{}' uses '*' outside a leading '*.'; it only matches literally",
                pattern
            ));
        }
    }

    for denied in &config.denied_hosts {
        if config.allowed_hosts.iter().any(|allowed| allowed.eq_ignore_ascii_case(denied)) {
            result.add_warning(format!(
                "Host pattern '{}' is both allowed and denied; deny wins",
                denied
            ));
        }
    }
}
