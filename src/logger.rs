//! Logging backend for the `log` facade.  Records are timestamped and
//! written to stderr, or to a log file when one is configured; debug
//! and trace records carry their source position.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Where log records end up.
enum Sink {
    Stderr,
    File(Mutex<File>),
}

pub struct SchrootLogger {
    level: LevelFilter,
    sink: Sink,
}

/// Install the logger.  The level comes from `SCHROOT_LOG_LEVEL`
/// (error, warn, info, debug, trace); unset or unparsable values mean
/// warn.
pub fn init(log_file: Option<PathBuf>) -> Result<()> {
    let level = std::env::var("SCHROOT_LOG_LEVEL")
        .ok()
        .and_then(|value| LevelFilter::from_str(&value).ok())
        .unwrap_or(LevelFilter::Warn);

    let sink = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Sink::File(Mutex::new(file))
        }
        None => Sink::Stderr,
    };

    log::set_boxed_logger(Box::new(SchrootLogger { level, sink }))
        .context("logger already installed")?;
    log::set_max_level(level);
    Ok(())
}

impl SchrootLogger {
    fn render(record: &Record) -> String {
        let timestamp = chrono::Local::now().to_rfc3339();
        match (record.level() >= Level::Debug, record.file(), record.line()) {
            (true, Some(file), Some(line)) => format!(
                "{} {:<5} {} ({}:{})",
                timestamp,
                record.level(),
                record.args(),
                file,
                line
            ),
            _ => format!("{} {:<5} {}", timestamp, record.level(), record.args()),
        }
    }
}

impl Log for SchrootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = Self::render(record);
        match &self.sink {
            Sink::Stderr => eprintln!("{}", message),
            Sink::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{}", message);
                }
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(file) = &self.sink {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}
