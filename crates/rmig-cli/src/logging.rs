use crate::config::LoggingSection;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "MIGRATOR_LOG_LEVEL";
pub const LOG_FILE_NAME: &str = "runtime-migrator.log";

/// Keeps the optional log file handle alive for the lifetime of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<fs::File>>>,
}

pub fn resolve_level(env_level: Option<String>, config: &LoggingSection) -> String {
    env_level
        .filter(|level| !level.trim().is_empty())
        .or_else(|| config.level.clone())
        .unwrap_or_else(|| "info".to_string())
}

pub fn init_logging(config: &LoggingSection) -> Option<LogGuard> {
    let level = resolve_level(std::env::var(LOG_LEVEL_ENV).ok(), config);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = match config.directory.as_deref() {
        Some(directory) => match open_log_file(directory) {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("log_file_error: {err}");
                LogGuard { file: None }
            }
        },
        None => LogGuard { file: None },
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(directory: &Path) -> io::Result<LogGuard> {
    fs::create_dir_all(directory)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(directory.join(LOG_FILE_NAME))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

/// Tees log output to stderr and the optional log file.
struct MultiWriter {
    stderr: io::Stderr,
    file: Option<Arc<Mutex<fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<fs::File>>>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn environment_level_wins_over_config() {
        let config = LoggingSection {
            level: Some("warn".to_string()),
            directory: None,
        };
        assert_eq!(resolve_level(Some("trace".to_string()), &config), "trace");
        assert_eq!(resolve_level(Some("  ".to_string()), &config), "warn");
        assert_eq!(resolve_level(None, &LoggingSection::default()), "info");
    }

    #[test]
    fn multi_writer_tees_into_the_log_file() {
        let dir = TempDir::new().expect("tempdir");
        let guard = open_log_file(&dir.path().join("logs")).expect("log file");
        let mut writer = MultiWriter::new(guard.file.clone());
        writer.write_all(b"mapping ready\n").expect("write");
        writer.flush().expect("flush");

        let contents =
            fs::read_to_string(dir.path().join("logs").join(LOG_FILE_NAME)).expect("read log");
        assert_eq!(contents, "mapping ready\n");
    }
}
