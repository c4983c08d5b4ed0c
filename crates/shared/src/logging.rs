use std::env;
use std::str::FromStr;

use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset. libsql traces every statement below warn.
pub const DEFAULT_LOG_FILTER: &str = "info,libsql=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!(
                "unknown LOG_FORMAT '{other}', expected text or json"
            )),
        }
    }
}

fn env_filter(directives: Option<&str>) -> Result<EnvFilter, anyhow::Error> {
    Ok(EnvFilter::from_str(directives.unwrap_or(DEFAULT_LOG_FILTER))?)
}

/// Install the global subscriber, configured by `RUST_LOG` and `LOG_FORMAT`.
/// Logs go to stderr; stdout carries command output.
pub fn configure_logging() -> Result<(), anyhow::Error> {
    let filter = env_filter(env::var("RUST_LOG").ok().as_deref())?;
    let format = match env::var("LOG_FORMAT") {
        Ok(value) => value.parse::<LogFormat>()?,
        Err(_) => LogFormat::default(),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Text => subscriber.try_init(),
    };
    if let Err(e) = result {
        warn!("logging already initialized, keeping the existing subscriber: {}", e);
    }
    Ok(())
}
