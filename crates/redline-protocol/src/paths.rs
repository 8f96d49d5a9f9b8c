use std::path::PathBuf;

/// Returns the runtime directory that holds the socket and PID file.
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("redline")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/redline-{uid}"))
    }
}

/// Returns the default socket path for the redline daemon.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("REDLINE_SOCKET") {
        return PathBuf::from(p);
    }
    default_runtime_dir().join("redline.sock")
}

/// Returns the config/data directory path for redline.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("redline")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("redline")
    } else {
        PathBuf::from("/tmp/redline")
    }
}

/// Returns the default state directory (checkpoints, audit log).
pub fn default_state_dir() -> PathBuf {
    if let Ok(data_dir) = std::env::var("XDG_STATE_HOME") {
        PathBuf::from(data_dir).join("redline")
    } else {
        dirs_path().join("state")
    }
}

/// Returns the config file path for the redline daemon.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
