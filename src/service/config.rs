extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::HEADER_SIZE;

/// Prefix of environment variables overriding file settings,
/// e.g. `STONENET__NETWORK__PORT=9000`.
pub const ENV_PREFIX: &str = "STONENET";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// upper bound on concurrently served connections
    pub max_connection: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 7070,
            max_connection: u16::MAX as usize,
        }
    }
}

/// Receive-side buffer policy.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BufferConfig {
    /// starting capacity of every session's accumulator
    pub initial_buffer_size: usize,
    /// largest payload length a frame header may declare, 0 disables the cap
    pub max_frame_size: usize,
    /// largest capacity an accumulator may grow to, 0 disables the cap
    pub max_buffer_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            initial_buffer_size: 1024,
            max_frame_size: 16 * 1024 * 1024,
            max_buffer_size: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub accumulator_pool_size: usize,
    pub send_buffer_pool_size: usize,
    pub send_buffer_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            accumulator_pool_size: 64,
            send_buffer_pool_size: 256,
            send_buffer_capacity: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// send `MsgNetStat` with the session id right after accept
    pub announce: bool,
    /// evict sessions silent for this long, 0 disables eviction
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            announce: true,
            idle_timeout_ms: 0,
            reap_interval_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// tokio worker threads, 0 means one per cpu
    pub worker_threads: usize,
}

impl RuntimeConfig {
    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub buffer: BufferConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub runtime: RuntimeConfig,
}

impl ServerConfig {
    /// Load the configuration from `path` (optional) layered under
    /// `STONENET__*` environment variables.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.buffer.initial_buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "buffer.initial_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".to_string(),
            ));
        }
        if self.buffer.max_buffer_size != 0
            && self.buffer.max_buffer_size < self.buffer.initial_buffer_size
        {
            return Err(AppError::InvalidValue(format!(
                "buffer.max_buffer_size {} is smaller than buffer.initial_buffer_size {}",
                self.buffer.max_buffer_size, self.buffer.initial_buffer_size
            )));
        }
        // the largest accepted frame, header included, has to fit in the buffer
        if self.buffer.max_frame_size != 0
            && self.buffer.max_buffer_size != 0
            && self.buffer.max_frame_size.saturating_add(HEADER_SIZE) > self.buffer.max_buffer_size
        {
            return Err(AppError::InvalidValue(format!(
                "buffer.max_frame_size {} plus the {} byte header exceeds buffer.max_buffer_size {}",
                self.buffer.max_frame_size, HEADER_SIZE, self.buffer.max_buffer_size
            )));
        }
        if self.session.idle_timeout_ms > 0 && self.session.reap_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "session.reap_interval_ms must be greater than 0 when idle eviction is on"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address(), "0.0.0.0:7070");
        assert!(config.session.announce);
        assert!(config.session.idle_timeout().is_none());
        assert!(config.runtime.worker_threads() >= 1);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[network]
ip = "127.0.0.1"
port = 9100

[buffer]
initial_buffer_size = 256

[session]
idle_timeout_ms = 5000
"#
        )
        .unwrap();

        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.listen_address(), "127.0.0.1:9100");
        assert_eq!(config.buffer.initial_buffer_size, 256);
        // untouched sections keep their defaults
        assert_eq!(config.buffer.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.pool.send_buffer_pool_size, 256);
        assert_eq!(
            config.session.idle_timeout(),
            Some(Duration::from_millis(5000))
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::set_up_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network.max_connection, u16::MAX as usize);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.buffer.initial_buffer_size = 0;
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));

        let mut config = ServerConfig::default();
        config.buffer.max_buffer_size = 16;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.session.idle_timeout_ms = 10;
        config.session.reap_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.buffer.max_buffer_size = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_frame_must_fit_buffer() {
        let mut config = ServerConfig::default();
        config.buffer.max_buffer_size = 1024;
        config.buffer.max_frame_size = 1024;
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));

        config.buffer.max_frame_size = 1024 - HEADER_SIZE;
        assert!(config.validate().is_ok());

        // an uncapped frame size leaves the buffer cap as the only bound
        config.buffer.max_frame_size = 0;
        assert!(config.validate().is_ok());
    }
}
