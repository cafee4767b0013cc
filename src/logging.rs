//! tracing initialization shared by the binaries.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// Initialize the global subscriber from config: `RUST_LOG` wins over
/// `LOG_LEVEL`, format is json or console, and output goes to the
/// configured log file when one is set.
pub fn init(config: &Config) -> anyhow::Result<()> {
    let default_level = if config.debug {
        "debug".to_string()
    } else {
        config.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bookwatch={default_level},info")));

    match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let writer = Mutex::new(file);
            match config.log_format {
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init(),
                LogFormat::Console => tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(writer)
                    .init(),
            }
        }
        None => match config.log_format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init(),
            LogFormat::Console => tracing_subscriber::fmt().with_env_filter(filter).init(),
        },
    }

    Ok(())
}
