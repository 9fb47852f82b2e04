use std::{io::IsTerminal as _, path::PathBuf};

use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing::{
        self,
        metadata::LevelFilter,
        subscriber::{EnvFilter, filter::Directive, fmt::writer::BoxMakeWriter},
    },
};

use super::env::project_name;

#[derive(Debug, Clone, Default)]
/// Logging options, usually sourced from the command line.
pub struct TelemetryConfig {
    /// debug logging as default instead of info,
    /// and trace logging (e.g. chaos decisions) for the fake services
    pub verbose: bool,
    /// pretty (multi-line) log output
    pub pretty: bool,
    /// append logs to this file instead of stderr
    pub output: Option<PathBuf>,
}

/// Configures structured logging with runtime control via `RUST_LOG` environment variable.
///
/// Defaults to INFO level. Verbose mode logs at DEBUG level,
/// except for the fake services themselves which log every chaos decision at TRACE level.
pub fn init_tracing(cfg: &TelemetryConfig) -> Result<(), BoxError> {
    let default_directive = if cfg.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
    .into();

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();
    if cfg.verbose {
        env_filter = env_filter.add_directive(fakes_trace_directive()?);
    }

    let subscriber = tracing::subscriber::fmt()
        .with_ansi(cfg.output.is_none() && std::io::stderr().is_terminal())
        .with_env_filter(env_filter)
        .with_writer(make_writer(cfg)?);

    if cfg.pretty {
        subscriber.pretty().try_init()?;
    } else {
        subscriber.try_init()?;
    }

    tracing::info!("Tracing is set up");
    Ok(())
}

fn fakes_trace_directive() -> Result<Directive, BoxError> {
    format!("{}=trace", project_name())
        .parse()
        .context("parse fake services trace directive")
}

fn make_writer(cfg: &TelemetryConfig) -> Result<BoxMakeWriter, BoxError> {
    match cfg.output.as_deref() {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .context("open log file")
                .with_context_debug_field("path", || path.to_path_buf())?;

            Ok(BoxMakeWriter::new(file))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}
