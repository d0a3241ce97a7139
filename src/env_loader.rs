use std::env;
use std::path::{Path, PathBuf};

fn fallback_dotenv_path(data_dir: Option<PathBuf>) -> Option<PathBuf> {
    Some(data_dir?.join(".env"))
}

/// Load `.env` from the working directory, then from `$DATA_DIR/.env`.
/// Variables already set are never overwritten.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();

    let Some(path) = fallback_dotenv_path(env::var_os("DATA_DIR").map(PathBuf::from)) else {
        return;
    };
    load_if_present(&path);
}

fn load_if_present(path: &Path) {
    if path.is_file() {
        let _ = dotenvy::from_path(path);
    }
}
