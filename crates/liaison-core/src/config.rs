/*!
 * Layered configuration for Liaison.
 *
 * Defaults are overlaid by an optional TOML file and then by
 * `<PREFIX>__SECTION__KEY` environment variables.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for Liaison
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// RPC server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Device layer configuration
    #[serde(default)]
    pub devices: DevicesConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 means use number of available CPU cores)
    #[serde(default)]
    pub worker_threads: usize,

    /// Timeout for blocking device operations in milliseconds (0 means no timeout)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// RPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound for a single remote method call in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Number of event notifications buffered per connection before new ones are dropped
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Device layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Device spec file (JSON or YAML) loaded at start-up; empty means none
    #[serde(default)]
    pub spec_file: String,

    /// How long one dispatch cycle waits for serial input, in milliseconds
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Settle interval after each command sent to a device, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Whether serial devices get a background poll worker
    #[serde(default = "default_poll")]
    pub poll: bool,
}

impl ServerConfig {
    /// The socket address string (`host:port`)
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The call timeout as a duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl DevicesConfig {
    /// The dispatch timeout as a duration
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// The settle interval as a duration
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl RuntimeConfig {
    /// The operation timeout, if one is configured
    pub fn operation_timeout(&self) -> Option<Duration> {
        match self.operation_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0, // Use number of available CPU cores
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            call_timeout_ms: default_call_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            spec_file: String::new(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            settle_ms: default_settle_ms(),
            poll: default_poll(),
        }
    }
}

fn default_app_name() -> String {
    "liaison".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8100
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_outbound_queue_capacity() -> usize {
    64
}

// one frame at 30Hz
fn default_dispatch_timeout_ms() -> u64 {
    33
}

// one frame at 60Hz
fn default_settle_ms() -> u64 {
    16
}

fn default_poll() -> bool {
    true
}

impl Config {
    /// Validate settings that serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        if self.server.outbound_queue_capacity == 0 {
            return Err(Error::config("server.outbound_queue_capacity must be at least 1"));
        }
        if self.server.call_timeout_ms == 0 {
            return Err(Error::config("server.call_timeout_ms must be greater than 0"));
        }
        if self.devices.dispatch_timeout_ms == 0 {
            return Err(Error::config("devices.dispatch_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let mut config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if let Some(override_config) = self.override_with {
            config = override_config;
        }

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}
