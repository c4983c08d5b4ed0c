use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Loaded in this order. Variables already set, in the process or by an earlier
/// file, are never overridden.
pub const ENV_FILES: [&str; 2] = [".env", ".env.secrets"];

/// Nearest `file_name` in `start` or one of its ancestors.
pub fn find_env_file(start: &Path, file_name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// Load `.env` and `.env.secrets` (key and partition passwords during local
/// development) from the working directory or the nearest ancestor holding them.
/// Returns the files that were loaded.
pub fn configure_env() -> Result<Vec<PathBuf>, anyhow::Error> {
    let cwd = std::env::current_dir()?;

    let mut loaded = Vec::new();
    for file_name in ENV_FILES {
        let Some(path) = find_env_file(&cwd, file_name) else {
            debug!("no {} found from {}", file_name, cwd.display());
            continue;
        };
        match dotenv::from_path(&path) {
            Ok(()) => {
                debug!("loaded environment variables from {}", path.display());
                loaded.push(path);
            }
            Err(e) => warn!("failed to load {}: {}", path.display(), e),
        }
    }
    Ok(loaded)
}
