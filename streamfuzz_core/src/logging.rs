//! Global logger setup.

use anyhow::{Context, Result};
use fern::colors::{Color, ColoredLevelConfig};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Parses a level name such as `info` or `TRACE`.
pub fn parse_level(log_level: &str) -> Result<log::LevelFilter> {
    log::LevelFilter::from_str(log_level)
        .with_context(|| format!("'{log_level}' is not a valid log level"))
}

/// Installs the global logger. Messages at `log_level` or above go to stderr and,
/// when `log_path` is set, are also written (uncolored) to that file.
pub fn setup_logger(log_path: Option<&Path>, log_level: &str) -> Result<()> {
    let level = parse_level(log_level)?;
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Blue)
        .debug(Color::White)
        .trace(Color::BrightBlack);

    let console = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.target().split("::").next().unwrap_or("?"),
                colors.color(record.level()),
                message
            ))
        })
        .chain(std::io::stderr());

    let mut dispatch = fern::Dispatch::new().level(level).chain(console);

    if let Some(log_path) = log_path {
        let log_file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(log_path)
            .with_context(|| format!("Failed to open log file {log_path:?}"))?;
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "{} [{}][{}:{}][{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                        record.target(),
                        record.file().unwrap_or("?"),
                        record.line().unwrap_or(0),
                        record.level(),
                        message
                    ))
                })
                .chain(log_file),
        );
    }

    dispatch.apply().context("A global logger is already installed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level("info").unwrap(), log::LevelFilter::Info);
        assert_eq!(parse_level("TRACE").unwrap(), log::LevelFilter::Trace);
        assert_eq!(parse_level("off").unwrap(), log::LevelFilter::Off);
        assert!(parse_level("loud").is_err());
        assert!(setup_logger(None, "loud").is_err());
    }
}
