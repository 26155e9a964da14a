//! Default locations for the socket, the database and the config file.
//!
//! Everything resolves under the invoking user's XDG directories, so the
//! daemon runs without root. `CURFEW_SOCKET` and `CURFEW_DATA_DIR` override
//! the first two.

use std::path::{Path, PathBuf};

pub const CURFEW_SOCKET_ENV: &str = "CURFEW_SOCKET";
pub const CURFEW_DATA_DIR_ENV: &str = "CURFEW_DATA_DIR";

const APP_DIR: &str = "curfew";
const SOCKET_FILENAME: &str = "curfewd.sock";
const CONFIG_FILENAME: &str = "config.toml";
const DATABASE_FILENAME: &str = "curfew.db";

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// `$HOME/<rest...>/curfew`, if HOME is set
fn under_home(rest: &[&str]) -> Option<PathBuf> {
    env_path("HOME").map(|home| rest.iter().fold(home, |p, part| p.join(part)).join(APP_DIR))
}

/// Socket path honoring `CURFEW_SOCKET`
pub fn default_socket_path() -> PathBuf {
    env_path(CURFEW_SOCKET_ENV).unwrap_or_else(xdg_socket_path)
}

/// `$XDG_RUNTIME_DIR/curfew/curfewd.sock`, or a per-user directory in /tmp
pub fn xdg_socket_path() -> PathBuf {
    let dir = env_path("XDG_RUNTIME_DIR")
        .map(|runtime| runtime.join(APP_DIR))
        .unwrap_or_else(|| {
            let user = std::env::var("USER").unwrap_or_else(|_| "nobody".into());
            PathBuf::from(format!("/tmp/{APP_DIR}-{user}"))
        });
    dir.join(SOCKET_FILENAME)
}

/// Data directory honoring `CURFEW_DATA_DIR`
pub fn default_data_dir() -> PathBuf {
    env_path(CURFEW_DATA_DIR_ENV).unwrap_or_else(xdg_data_dir)
}

/// `$XDG_DATA_HOME/curfew`, falling back to `~/.local/share/curfew`
pub fn xdg_data_dir() -> PathBuf {
    env_path("XDG_DATA_HOME")
        .map(|data| data.join(APP_DIR))
        .or_else(|| under_home(&[".local", "share"]))
        .unwrap_or_else(|| Path::new("/var/lib").join(APP_DIR))
}

/// `$XDG_CONFIG_HOME/curfew/config.toml`, then `~/.config`, then `/etc`
pub fn default_config_path() -> PathBuf {
    env_path("XDG_CONFIG_HOME")
        .map(|config| config.join(APP_DIR))
        .or_else(|| under_home(&[".config"]))
        .unwrap_or_else(|| Path::new("/etc").join(APP_DIR))
        .join(CONFIG_FILENAME)
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DATABASE_FILENAME)
}
