//! Centralized home-based storage paths for all quota-watch persistence.
//!
//! Everything lives under `~/.quota-watch/`:
//! - `accounts.json` - Stored account identities and credentials
//! - `config.yaml` - Optional settings file
//! - `watch.lock` - Single-instance lock for watch mode
//!
//! The base directory can be overridden with the `QUOTA_WATCH_HOME`
//! environment variable.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// The name of the quota-watch directory under the user's home.
const QUOTA_WATCH_DIR: &str = ".quota-watch";

/// Environment variable overriding the base directory.
const HOME_ENV_VAR: &str = "QUOTA_WATCH_HOME";

#[cfg(test)]
thread_local! {
    static TEST_HOME: std::cell::RefCell<Option<PathBuf>> =
        const { std::cell::RefCell::new(None) };
}

/// Guard returned by [`set_home_for_test`]; restores the real home on drop.
#[cfg(test)]
pub struct TestHomeGuard;

/// Overrides the home directory for the current test thread.
///
/// Thread-local, so plain `#[test]` and current-thread `#[tokio::test]`
/// functions are isolated from each other without serialization.
#[cfg(test)]
pub fn set_home_for_test(path: PathBuf) -> TestHomeGuard {
    TEST_HOME.with(|home| *home.borrow_mut() = Some(path));
    TestHomeGuard
}

#[cfg(test)]
impl Drop for TestHomeGuard {
    fn drop(&mut self) {
        TEST_HOME.with(|home| *home.borrow_mut() = None);
    }
}

fn base_home_dir() -> Result<PathBuf> {
    #[cfg(test)]
    if let Some(home) = TEST_HOME.with(|home| home.borrow().clone()) {
        return Ok(home);
    }

    if let Ok(dir) = std::env::var(HOME_ENV_VAR) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    dirs::home_dir().context("Could not determine home directory for quota-watch storage")
}

/// Returns the quota-watch directory: `~/.quota-watch/`
///
/// Creates the directory if it doesn't exist.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn quota_watch_home_dir() -> Result<PathBuf> {
    let base = base_home_dir()?;
    let dir = base.join(QUOTA_WATCH_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create quota-watch directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the account store path: `~/.quota-watch/accounts.json`
pub fn accounts_path() -> Result<PathBuf> {
    Ok(quota_watch_home_dir()?.join("accounts.json"))
}

/// Returns the settings file path: `~/.quota-watch/config.yaml`
pub fn config_path() -> Result<PathBuf> {
    Ok(quota_watch_home_dir()?.join("config.yaml"))
}

/// Returns the watch-mode lock file path: `~/.quota-watch/watch.lock`
pub fn watch_lock_path() -> Result<PathBuf> {
    Ok(quota_watch_home_dir()?.join("watch.lock"))
}
