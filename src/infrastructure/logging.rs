//! Tracing setup for the bridge binary.
//!
//! Console output and an optional rolling log file, both behind one level
//! filter. `RUST_LOG` overrides the configured level.

use crate::domain::settings::LogSettings;
use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the file writer alive. Buffered lines are flushed on drop.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = level_filter(env.as_deref(), &settings.level);

    let console = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(settings.ansi_colors)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
    });

    let (file, guard) = if settings.file_logging_enabled {
        let appender = RollingFileAppender::builder()
            .rotation(rotation(&settings.rotation))
            .filename_prefix(&settings.file_name_prefix)
            .build(&settings.log_dir)
            .with_context(|| format!("Cannot log to {}", settings.log_dir))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Tracing subscriber already installed")?;

    tracing::info!(
        "Logging at {} (console: {}, file: {})",
        settings.level,
        settings.console_logging_enabled,
        settings.file_logging_enabled
    );
    Ok(LoggingGuard { _file: guard })
}

/// Directives from the environment win, then the configured level, then info.
fn level_filter(env: Option<&str>, level: &str) -> EnvFilter {
    env.and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Unknown names rotate daily.
fn rotation(name: &str) -> Rotation {
    match name.trim().to_ascii_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation(" Minutely "), Rotation::MINUTELY);
        assert_eq!(rotation("NEVER"), Rotation::NEVER);
        assert_eq!(rotation("daily"), Rotation::DAILY);
        assert_eq!(rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_configured_level_used_without_env() {
        assert_eq!(level_filter(None, "debug").to_string(), "debug");
    }

    #[test]
    fn test_env_directives_override_level() {
        assert_eq!(level_filter(Some("warn"), "debug").to_string(), "warn");
    }

    #[test]
    fn test_bad_directives_fall_back() {
        assert_eq!(level_filter(Some("x=loud"), "trace").to_string(), "trace");
        assert_eq!(level_filter(None, "x=loud").to_string(), "info");
    }
}
