use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Loads `.env` from the working directory or one of its parents.
///
/// Variables already set in the environment win over the file.
pub fn load_dotenvy_vars_if_present() {
    settle(dotenvy::dotenv());
}

/// Loads the variables in `path`, returning whether the file was applied.
pub fn load_env_file(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    settle(dotenvy::from_path(path).map(|()| path.to_path_buf()))
}

fn settle(loaded: Result<PathBuf, dotenvy::Error>) -> bool {
    match loaded {
        Ok(path) => {
            debug!(path = %path.display(), "loaded environment file");
            true
        }
        Err(e) if e.not_found() => false,
        Err(e) => {
            warn!("ignoring environment file that could not be read: {e}");
            false
        }
    }
}
