//! Location of the queue database.

use anyhow::Context;
use std::path::{Path, PathBuf};

const DEFAULT_DIR: &str = ".queuectl";
const DB_FILE: &str = "queue.db";

/// The queue home: `--home`/`QUEUECTL_HOME` if given, else `~/.queuectl`.
pub fn resolve_home(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(home) => Ok(home),
        None => dirs::home_dir()
            .map(|dir| dir.join(DEFAULT_DIR))
            .context("could not determine the home directory; pass --home or set QUEUECTL_HOME"),
    }
}

pub fn database_path(home: &Path) -> PathBuf {
    home.join(DB_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_home_wins() {
        let home = resolve_home(Some(PathBuf::from("/srv/queue"))).unwrap();
        assert_eq!(home, PathBuf::from("/srv/queue"));
        assert_eq!(database_path(&home), PathBuf::from("/srv/queue/queue.db"));
    }

    #[test]
    fn test_default_home_is_under_user_home() {
        if let Some(user_home) = dirs::home_dir() {
            assert_eq!(resolve_home(None).unwrap(), user_home.join(".queuectl"));
        }
    }
}
