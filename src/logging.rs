use crate::config::{Config, LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

pub struct CustomLogger {
    level: LevelFilter,
    targets: Vec<LogTarget>,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let level = config.level.unwrap_or_default().to_level_filter();
        let format = config.format.unwrap_or_default();
        let targets = config.targets.unwrap_or_default();

        let mut writers = Vec::new();

        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or("File output type requires path")?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            level,
            targets,
            format,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        // The most verbose target decides what reaches `log` at all.
        let max_level = logger
            .targets
            .iter()
            .map(|target| target.level.as_ref().map_or(logger.level, LogLevel::to_level_filter))
            .max()
            .unwrap_or(logger.level);
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn target_level(&self, target: &LogTarget) -> LevelFilter {
        target
            .level
            .as_ref()
            .map_or(self.level, LogLevel::to_level_filter)
    }

    fn should_log(&self, metadata: &Metadata, target: &LogTarget) -> bool {
        metadata.level() <= self.target_level(target)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] [{}:{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().to_string().to_uppercase(),
            record.target(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        json_line(record)
    }
}

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "file": record.file().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| self.should_log(metadata, target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if self.should_log(record.metadata(), target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

// Fallback to env_logger if custom logging configuration is not provided
pub fn init_fallback(log_level: Option<&str>, log_format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let level = log_level.unwrap_or("info");
    let format = parse_log_format(log_format.unwrap_or("text"))?;

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    // Connection-level chatter from hyper is rarely useful at info.
    builder.filter_module("hyper", LevelFilter::Warn);
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }
    builder.try_init()?;

    Ok(())
}

/// Installs the configured logger; CLI values override the config file.
pub fn init_from_config(
    config: &Config,
    cli_level: Option<&str>,
    cli_format: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    match config.logging.clone() {
        Some(mut logging) if logging.targets.as_ref().is_some_and(|t| !t.is_empty()) => {
            if let Some(level) = cli_level {
                logging.level = Some(parse_log_level(level)?);
            }
            if let Some(format) = cli_format {
                logging.format = Some(parse_log_format(format)?);
            }
            CustomLogger::init(logging)
        }
        logging => {
            let level = cli_level
                .map(str::to_string)
                .or_else(|| logging.as_ref().and_then(|l| l.level.as_ref()).map(LogLevel::to_string));
            let format = cli_format.map(str::to_string).or_else(|| {
                logging.as_ref().and_then(|l| l.format.as_ref()).map(|f| match f {
                    LogFormat::Text => "text".to_string(),
                    LogFormat::Json => "json".to_string(),
                })
            });
            init_fallback(level.as_deref(), format.as_deref())
        }
    }
}

// Parse string to LogLevel
pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

// Parse string to LogFormat
pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn logger(level: LogLevel, target_level: Option<LogLevel>) -> CustomLogger {
        CustomLogger::new(LoggingConfig {
            level: Some(level),
            format: Some(LogFormat::Json),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: target_level,
            }]),
        })
        .unwrap()
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), LogLevel::Debug);
        assert!(parse_log_level("loud").is_err());
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_target_level_overrides_global() {
        let metadata = |level| Metadata::builder().level(level).target("bifrost_tunnel").build();

        let global_only = logger(LogLevel::Info, None);
        assert!(log::Log::enabled(&global_only, &metadata(Level::Warn)));
        assert!(!log::Log::enabled(&global_only, &metadata(Level::Debug)));

        let verbose_target = logger(LogLevel::Info, Some(LogLevel::Trace));
        assert!(log::Log::enabled(&verbose_target, &metadata(Level::Trace)));
    }

    #[test]
    fn test_json_line_shape() {
        let logger = logger(LogLevel::Info, None);
        let line = logger.format_json(
            &Record::builder()
                .args(format_args!("tunnel closed"))
                .level(Level::Info)
                .target("bifrost_tunnel::tunnel")
                .build(),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "info");
        assert_eq!(value["message"], "tunnel closed");
        assert_eq!(value["target"], "bifrost_tunnel::tunnel");
    }

    #[test]
    fn test_file_target_requires_path() {
        let result = CustomLogger::new(LoggingConfig {
            level: None,
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        });
        assert!(result.is_err());
    }
}
