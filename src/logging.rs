use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level.trim().to_ascii_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `RUST_LOG` wins over the configured level. The file layer is skipped when
/// the log file cannot be opened; a second call is a no-op.
pub fn init(level: &str, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let file_layer = log_file.and_then(open_log_file).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_file_is_created_with_parents() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("logs/lookout.log");
        assert!(open_log_file(&path).is_some());
        assert!(path.is_file());
    }
}
