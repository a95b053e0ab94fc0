use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Size past which the log file is moved aside before a run appends to it.
pub const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

const CRATES: [&str; 5] = [
    "isorun",
    "isorun_cli",
    "isorun_core",
    "isorun_store",
    "isorun_domain",
];

fn crate_filter(level: &str) -> EnvFilter {
    let directives = CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

pub fn console_level(trace: bool, verbose: u8, quiet: bool) -> &'static str {
    if trace {
        "trace"
    } else if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Console output on stderr at `level`, plus a debug log appended to
/// `log_file` when one is given.
pub fn init_tracing(level: &str, log_file: Option<&Path>) {
    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .with_filter(crate_filter(level));

    let (file, open_error) = match log_file.map(open_log_file) {
        Some(Ok(handle)) => (Some(handle), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };
    let file_layer = file.map(|handle| {
        fmt::layer()
            .with_writer(Mutex::new(handle))
            .with_ansi(false)
            .with_filter(crate_filter("debug"))
    });

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();

    if let (Some(path), Some(err)) = (log_file, open_error) {
        tracing::warn!(path = %path.display(), %err, "log file unavailable");
    }
}

/// Open `path` for appending, first moving an oversized file to `<path>.1`.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    match fs::metadata(path) {
        Ok(meta) if meta.len() > LOG_ROTATE_BYTES => fs::rename(path, rotated_path(path))?,
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn levels_follow_flags() {
        assert_eq!(console_level(false, 0, false), "info");
        assert_eq!(console_level(false, 1, false), "debug");
        assert_eq!(console_level(false, 2, false), "trace");
        assert_eq!(console_level(false, 0, true), "error");
        assert_eq!(console_level(true, 0, true), "trace");
    }

    #[test]
    fn small_log_files_are_appended() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("logs").join("isorun.log");
        open_log_file(&path).unwrap().write_all(b"one\n").unwrap();
        open_log_file(&path).unwrap().write_all(b"two\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert!(!rotated_path(&path).exists());
    }

    #[test]
    fn oversized_log_file_is_rotated() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("isorun.log");
        let old = vec![b'x'; usize::try_from(LOG_ROTATE_BYTES).unwrap() + 1];
        fs::write(&path, &old).unwrap();
        fs::write(rotated_path(&path), b"older").unwrap();

        open_log_file(&path).unwrap().write_all(b"fresh\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
        assert_eq!(fs::metadata(rotated_path(&path)).unwrap().len(), old.len() as u64);
    }
}
