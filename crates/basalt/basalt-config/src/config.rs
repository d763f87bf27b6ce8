use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BasaltConfig {
    #[serde(default = "defaults::shm_file_path")]
    pub shm_file_path: String,
    #[serde(default = "defaults::arena_size")]
    pub arena_size: u64,
    #[serde(default = "defaults::workers")]
    pub workers: usize,
    #[serde(default = "defaults::socket_dir")]
    pub socket_dir: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "defaults::lock_spin")]
    pub lock_spin: u32,
    /// JSON file installed by the master before any worker starts.
    #[serde(default)]
    pub initial_config: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn shm_file_path() -> String {
        "/tmp/basalt_conf".into()
    }

    pub fn arena_size() -> u64 {
        1 << 20
    }

    pub fn workers() -> usize {
        4
    }

    pub fn socket_dir() -> String {
        "/tmp/basalt".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn poll_timeout_ms() -> u64 {
        100
    }

    pub fn lock_spin() -> u32 {
        2048
    }
}

/// One page.
const MIN_ARENA_SIZE: u64 = 4096;

impl Default for BasaltConfig {
    fn default() -> Self {
        Self {
            shm_file_path: defaults::shm_file_path(),
            arena_size: defaults::arena_size(),
            workers: defaults::workers(),
            socket_dir: defaults::socket_dir(),
            log_level: defaults::log_level(),
            poll_timeout_ms: defaults::poll_timeout_ms(),
            lock_spin: defaults::lock_spin(),
            initial_config: None,
        }
    }
}

impl BasaltConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: BasaltConfig = toml::from_str(&toml_to_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.arena_size < MIN_ARENA_SIZE {
            return Err(ConfigError::Invalid(format!(
                "arena_size must be at least {MIN_ARENA_SIZE} bytes"
            )));
        }
        if self.lock_spin == 0 {
            return Err(ConfigError::Invalid("lock_spin must be at least 1".into()));
        }
        Ok(())
    }

    /// Socket worker `worker` accepts control connections on.
    pub fn control_socket(&self, worker: usize) -> PathBuf {
        Path::new(&self.socket_dir).join(format!("worker-{worker}.sock"))
    }

    /// Socket worker `worker` serves configuration requests on.
    pub fn admin_socket(&self, worker: usize) -> PathBuf {
        Path::new(&self.socket_dir).join(format!("admin-{worker}.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn missing_keys_take_defaults() {
        let f = write_toml("workers = 2\n");
        let cfg = BasaltConfig::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(
            cfg,
            BasaltConfig {
                workers: 2,
                ..BasaltConfig::default()
            }
        );
    }

    #[test]
    fn full_file_round_trips_every_key() {
        let f = write_toml(
            r#"
            shm_file_path = "/dev/shm/b"
            arena_size = 65536
            workers = 8
            socket_dir = "/run/basalt"
            log_level = "debug"
            poll_timeout_ms = 5
            lock_spin = 64
            initial_config = "/etc/basalt/conf.json"
            "#,
        );
        let cfg = BasaltConfig::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.arena_size, 65536);
        assert_eq!(cfg.initial_config.as_deref(), Some("/etc/basalt/conf.json"));
        assert_eq!(cfg.control_socket(3), PathBuf::from("/run/basalt/worker-3.sock"));
        assert_eq!(cfg.admin_socket(0), PathBuf::from("/run/basalt/admin-0.sock"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for body in ["workers = 0", "arena_size = 100", "lock_spin = 0"] {
            let f = write_toml(body);
            let err = BasaltConfig::load(f.path().to_str().unwrap()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{body}");
        }
    }

    #[test]
    fn read_and_parse_failures() {
        let err = BasaltConfig::load("/nonexistent/basalt.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let f = write_toml("workers = \"many\"");
        let err = BasaltConfig::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
