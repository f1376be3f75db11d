use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging.
///
/// - File output: `{log_dir}/barbaric.<date>.log`, daily rotation, latest 5 kept.
/// - Console output on stderr. Stdout carries the host protocol and must
///   never receive log lines.
/// - `RUST_LOG` overrides the default `info` filter.
pub fn init(log_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("barbaric")
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)
        .context("creating log file appender")?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    // cpal and reqwest are chatty at debug.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,cpal=warn,reqwest=warn,hyper=warn,mio=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("tracing subscriber already set")?;

    tracing::info!(log_dir = %log_dir.display(), "Logger initialized");
    Ok(())
}
