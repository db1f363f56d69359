//! Tracing setup shared by every footfall subcommand.
//!
//! Events go to stderr and to `<log_dir>/<app>.log`, which rolls over at
//! [`ROLL_AT_BYTES`] keeping [`KEPT_GENERATIONS`] files in total.
//! `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`].

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str =
    "footfall=info,footfall_etl=info,footfall_sinks=info,footfall_query=info,footfall_db=warn";
pub const ROLL_AT_BYTES: u64 = 10 * 1024 * 1024;
pub const KEPT_GENERATIONS: usize = 5;

pub struct LogConfig<'a> {
    /// Log file stem, one per subcommand (`run-etl`, `serve`, ...).
    pub app_name: &'a str,
    /// Console shows `debug` regardless of `RUST_LOG`.
    pub verbose: bool,
    pub log_dir: PathBuf,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber. Only fails if one is already installed;
/// an unusable log directory just leaves the file layer out.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        env_filter()
    };

    let log_file = LogFile::open(
        &config.log_dir,
        config.app_name,
        ROLL_AT_BYTES,
        KEPT_GENERATIONS,
    );
    let file_layer = match log_file {
        Ok(file) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(env_filter()),
        ),
        Err(err) => {
            eprintln!(
                "warning: logging to console only, {} is unusable: {}",
                config.log_dir.display(),
                err
            );
            None
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")
}

/// Append-only log file that renames itself to `<stem>.log.1` (shifting
/// older generations up) once the next write would pass `roll_at`.
struct LogFile {
    dir: PathBuf,
    stem: String,
    roll_at: u64,
    generations: usize,
    file: File,
    written: u64,
}

impl LogFile {
    fn open(dir: &Path, app_name: &str, roll_at: u64, generations: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stem: String = app_name
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        let (file, written) = append_to(&dir.join(format!("{}.log", stem)))?;
        let mut log = Self {
            dir: dir.to_path_buf(),
            stem,
            roll_at,
            generations: generations.max(1),
            file,
            written,
        };
        if log.written > log.roll_at {
            log.roll()?;
        }
        Ok(log)
    }

    /// `generation` 0 is the live file.
    fn path(&self, generation: usize) -> PathBuf {
        match generation {
            0 => self.dir.join(format!("{}.log", self.stem)),
            n => self.dir.join(format!("{}.log.{}", self.stem, n)),
        }
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let last = self.generations - 1;
        remove_if_present(&self.path(last))?;
        for generation in (0..last).rev() {
            let from = self.path(generation);
            if from.exists() {
                fs::rename(&from, self.path(generation + 1))?;
            }
        }
        let (file, written) = append_to(&self.path(0))?;
        self.file = file;
        self.written = written;
        Ok(())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.roll_at {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn append_to(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read(dir: &TempDir, name: &str) -> String {
        fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn stem_is_made_filename_safe() {
        let dir = TempDir::new().unwrap();
        let log = LogFile::open(dir.path(), "run/etl v2", 1024, 2).unwrap();
        assert_eq!(log.path(0), dir.path().join("run_etl_v2.log"));
        assert_eq!(log.path(1), dir.path().join("run_etl_v2.log.1"));
    }

    #[test]
    fn rolls_over_and_shifts_generations() {
        let dir = TempDir::new().unwrap();
        let mut log = LogFile::open(dir.path(), "run-etl", 16, 3).unwrap();
        for line in [b"first line\n", b"secnd line\n", b"third line\n"] {
            log.write_all(line).unwrap();
        }
        log.flush().unwrap();

        assert_eq!(read(&dir, "run-etl.log"), "third line\n");
        assert_eq!(read(&dir, "run-etl.log.1"), "secnd line\n");
        assert_eq!(read(&dir, "run-etl.log.2"), "first line\n");
        assert!(!dir.path().join("run-etl.log.3").exists());
    }

    #[test]
    fn oldest_generation_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut log = LogFile::open(dir.path(), "serve", 4, 2).unwrap();
        for chunk in [b"aaaa", b"bbbb", b"cccc", b"dddd"] {
            log.write_all(chunk).unwrap();
        }

        assert_eq!(read(&dir, "serve.log"), "dddd");
        assert_eq!(read(&dir, "serve.log.1"), "cccc");
        assert!(!dir.path().join("serve.log.2").exists());
    }

    #[test]
    fn oversized_file_rolls_on_open() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("serve.log"), "0123456789").unwrap();
        let log = LogFile::open(dir.path(), "serve", 4, 2).unwrap();
        assert_eq!(log.written, 0);
        assert_eq!(read(&dir, "serve.log.1"), "0123456789");
    }
}
