use anyhow::Context;
use clap::ValueEnum;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    /// Where to write hourly rolling diagnostic logs.
    /// When None, diagnostics go to stderr.
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl<'a> LoggingConfig<'a> {
    /// The filter directive to use: the environment takes
    /// precedence over `default_filter`
    pub fn filter_directive(&self) -> String {
        std::env::var(self.filter_env_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.default_filter.to_string())
    }

    /// Install the global subscriber.
    /// When logging to a directory, the returned guard must be kept
    /// alive for as long as logs should be flushed to disk.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let mut guard = None;
        let log_writer = if let Some(log_dir) = &self.log_dir {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("creating log dir {}", log_dir.display()))?;
            let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
            let (non_blocking, flusher) = tracing_appender::non_blocking(file_appender);
            guard.replace(flusher);
            BoxMakeWriter::new(non_blocking)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let directive = self.filter_directive();
        let env_filter = EnvFilter::try_new(&directive)
            .with_context(|| format!("parsing log filter '{directive}'"))?;

        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .try_init()
            .context("installing diagnostic logger")?;

        Ok(guard)
    }
}
