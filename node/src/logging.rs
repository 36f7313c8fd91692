//! # Structured Logging
//!
//! Installs the `tracing` subscriber described by the `[log]` section.
//! `RUST_LOG` wins over the configured level when set.
//!
//! All log output is written to stderr.

use pod_protocol::config::{LogConfig, LogFormat};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber. Call once, early in `main()`.
///
/// A bare level such as `"info"` applies to the node and the protocol
/// library; anything else is taken as a full filter directive.
pub fn init_logging(config: &LogConfig) {
    let default = if config.level.contains('=') {
        config.level.clone()
    } else {
        format!("pod_node={0},pod_protocol={0}", config.level)
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
                .init();
        }
    }

    tracing::info!(format = ?config.format, "logging initialized");
}
