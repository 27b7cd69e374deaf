//! Config loading, merging, validation, and derived settings.

use super::model::Config;
use crate::cli::Cli;
use crate::error::{LockrunError, Result};
use crate::locks::LockOptions;
use std::path::Path;
use std::time::Duration;

impl Config {
    /// Merge the optional config file, then the command line, and validate.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Load config from a YAML file.
    ///
    /// The file may be partial; required settings can come from flags, so
    /// the result is not validated here.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            LockrunError::Usage(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string. Unknown fields are ignored.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| LockrunError::Usage(format!("failed to parse config YAML: {}", e)))
    }

    /// Serialize config to a YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| LockrunError::Usage(format!("failed to serialize config to YAML: {}", e)))
    }

    /// Override fields with whatever the command line (or its environment
    /// variables) provided.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ttl) = cli.ttl {
            self.ttl = ttl;
        }
        if let Some(refresh) = cli.refresh {
            self.refresh = Some(refresh);
        }
        if let Some(endpoint) = &cli.endpoint {
            self.endpoint = endpoint.clone();
        }
        if let Some(key) = &cli.key {
            self.key = key.clone();
        }
        if let Some(owner) = &cli.owner {
            self.owner = owner.clone();
        }
        if let Some(timeout) = cli.request_timeout_ms {
            self.request_timeout_ms = timeout;
        }
        if let Some(timeout) = cli.kill_timeout {
            self.kill_timeout_secs = timeout;
        }
        if !cli.command.is_empty() {
            self.command = cli.command.clone();
        }
        if cli.heartbeat {
            self.heartbeat = true;
        }
        if let Some(interval) = cli.ping_interval_ms {
            self.ping_interval_ms = interval;
        }
        if let Some(max_wait) = cli.max_wait_ms {
            self.max_wait_ms = max_wait;
        }
    }

    /// Validate config values and return an error on invalid values.
    ///
    /// Validation rules:
    /// - `ttl` must be positive
    /// - `key` and `owner` must be non-empty
    /// - a command must be given
    /// - `refresh`, if set, must be positive and shorter than `ttl`
    /// - `request_timeout_ms` must be positive
    /// - with heartbeat on, `ping_interval_ms` must be positive and below `max_wait_ms`
    pub fn validate(&self) -> Result<()> {
        if self.ttl == 0 {
            return Err(usage("--ttl is required and must be greater than 0"));
        }

        if self.key.trim().is_empty() {
            return Err(usage("--key is required"));
        }

        if self.owner.is_empty() {
            return Err(usage(
                "--owner is required when the host name cannot be determined",
            ));
        }

        if self.command.is_empty() {
            return Err(usage("no command given"));
        }

        if let Some(refresh) = self.refresh
            && (refresh == 0 || refresh >= self.ttl)
        {
            return Err(usage(&format!(
                "--refresh must be greater than 0 and less than --ttl ({}), got {}",
                self.ttl, refresh
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(usage("request_timeout_ms must be greater than 0"));
        }

        if self.heartbeat
            && (self.ping_interval_ms == 0 || self.ping_interval_ms >= self.max_wait_ms)
        {
            return Err(usage(&format!(
                "--ping-interval-ms ({}) must be greater than 0 and less than --max-wait-ms ({})",
                self.ping_interval_ms, self.max_wait_ms
            )));
        }

        Ok(())
    }

    /// Identity and lease settings for the lock engine.
    pub fn lock_options(&self) -> LockOptions {
        let options = LockOptions::new(&self.key, &self.owner, self.ttl);
        match self.refresh {
            Some(secs) => options.refresh_interval(Duration::from_secs(secs)),
            None => options,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn usage(message: &str) -> LockrunError {
    LockrunError::Usage(format!("config validation failed: {}", message))
}
