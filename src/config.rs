//! Channel settings and pipe location.

use aether_proto::MAX_FRAME_LEN;
use std::path::PathBuf;
use std::time::Duration;

/// Well-known pipe name shared with the backend.
pub const DEFAULT_PIPE_NAME: &str = "AetherVisor_Session_Pipe";

/// Default `connect` timeout: 5s
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default socket read buffer: 64KB
const DEFAULT_READ_BUFFER_SIZE: usize = 65536;

/// Where pipes live unless overridden.
/// `$AETHER_PIPE_DIR`, then `$XDG_RUNTIME_DIR/aether`, then `/tmp/aether-<uid>`.
pub fn default_pipe_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AETHER_PIPE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("aether");
    }
    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/aether-{}", uid))
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub pipe_name: String,
    pub pipe_dir: PathBuf,
    pub connect_timeout: Duration,
    pub max_frame_len: u32,
    pub read_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            pipe_dir: default_pipe_dir(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ChannelConfig {
    /// Defaults overridden by `AETHER_PIPE_NAME` and `AETHER_CONNECT_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("AETHER_PIPE_NAME") {
            if name.is_empty() {
                log::warn!("Ignoring empty AETHER_PIPE_NAME");
            } else {
                config.pipe_name = name;
            }
        }
        if let Ok(raw) = std::env::var("AETHER_CONNECT_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.connect_timeout = Duration::from_millis(ms),
                Err(_) => log::warn!("Ignoring invalid AETHER_CONNECT_TIMEOUT_MS: {:?}", raw),
            }
        }
        config
    }

    pub fn pipe_name(mut self, name: impl Into<String>) -> Self {
        self.pipe_name = name.into();
        self
    }

    pub fn pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipe_dir = dir.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Frames above the protocol maximum are never accepted, whatever is set here.
    pub fn max_frame_len(mut self, max: u32) -> Self {
        self.max_frame_len = max.clamp(1, MAX_FRAME_LEN);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Resolve the socket path: `<pipe_dir>/<pipe_name>`
    pub fn pipe_path(&self) -> PathBuf {
        self.pipe_dir.join(&self.pipe_name)
    }
}
