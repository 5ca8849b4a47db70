// Copyright 2024 Oxide Computer Company
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use slog::{o, Drain, Level, Logger};
use tempfile::NamedTempFile;

mod error;
pub use error::{E2eError, Result};

/// Build the default logger used by the harness and its binaries.
pub fn build_logger() -> Logger {
    build_logger_with_level(Level::Info)
}

/// Terminal output when attached to a tty, bunyan JSON otherwise.
pub fn build_logger_with_level(level: Level) -> Logger {
    if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain.filter_level(level).fuse(), o!())
    } else {
        let drain = slog_bunyan::with_name("e2e", std::io::stdout())
            .build()
            .fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain.filter_level(level).fuse(), o!())
    }
}

/// A logger that drops everything, for tests.
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Write `data` to `file` exactly once.
///
/// The contents land in a temporary file in the same directory first and
/// are then persisted without clobbering, so readers never observe a
/// partial file and an existing file is never replaced.
pub fn write_once<P>(file: P, data: &[u8]) -> Result<()>
where
    P: AsRef<Path>,
{
    let file = file.as_ref();
    let parent = file.parent().ok_or_else(|| {
        E2eError::Configuration(format!("{:?} has no parent directory", file))
    })?;
    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }

    let mut tmpf = NamedTempFile::new_in(parent)?;
    tmpf.write_all(data)?;
    tmpf.flush()?;

    match tmpf.persist_noclobber(file) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Err(
            E2eError::Configuration(format!("{:?} was already written", file)),
        ),
        Err(e) => Err(e.error.into()),
    }
}
