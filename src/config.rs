use anyhow::{anyhow, Context, Result};

use crate::registry::Retention;

pub const HOST_VAR: &str = "MESSAGING_SERVICE_HOST";
pub const PORT_VAR: &str = "MESSAGING_SERVICE_PORT";
pub const QUIET_VAR: &str = "MESSAGING_SERVICE_QUIET";
pub const VERBOSE_VAR: &str = "MESSAGING_SERVICE_VERBOSE";
pub const LINK_WINDOW_VAR: &str = "MESSAGING_SERVICE_LINK_WINDOW";
pub const EVICT_IDLE_VAR: &str = "MESSAGING_SERVICE_EVICT_IDLE_QUEUES";

pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Standard AMQP port.
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_LINK_WINDOW: u32 = 1;

/// Broker settings, read once at startup from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Suppresses notice-level output.
    pub quiet: bool,
    /// Enables info-level output.
    pub verbose: bool,
    /// Number of messages a consumer link may hold in flight before it
    /// stops advertising credit to the broker core.
    pub link_window: u32,
    pub retention: Retention,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            quiet: false,
            verbose: true,
            link_window: DEFAULT_LINK_WINDOW,
            retention: Retention::Retain,
        }
    }
}

impl Config {
    /// Loads the configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary variable lookup.
    /// Unset variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(host) = lookup(HOST_VAR) {
            config.host = host;
        }
        if let Some(port) = lookup(PORT_VAR) {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("{PORT_VAR} is not a valid port: '{port}'"))?;
        }
        if let Some(value) = lookup(QUIET_VAR) {
            config.quiet = parse_flag(QUIET_VAR, &value)?;
        }
        if let Some(value) = lookup(VERBOSE_VAR) {
            config.verbose = parse_flag(VERBOSE_VAR, &value)?;
        }
        if let Some(window) = lookup(LINK_WINDOW_VAR) {
            let window: u32 = window
                .trim()
                .parse()
                .with_context(|| format!("{LINK_WINDOW_VAR} is not a number: '{window}'"))?;
            if window == 0 {
                return Err(anyhow!("{LINK_WINDOW_VAR} must be at least 1"));
            }
            config.link_window = window;
        }
        if let Some(value) = lookup(EVICT_IDLE_VAR) {
            if parse_flag(EVICT_IDLE_VAR, &value)? {
                config.retention = Retention::EvictIdle;
            }
        }

        Ok(config)
    }

    /// The `host:port` interface the listener binds to.
    pub fn interface(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("{name} is not a boolean: '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5672);
        assert!(!config.quiet);
        assert!(config.verbose);
        assert_eq!(config.link_window, 1);
        assert_eq!(config.retention, Retention::Retain);
        assert_eq!(config.interface(), "0.0.0.0:5672");
    }

    #[test]
    fn test_host_and_port_from_env() {
        let config = Config::from_lookup(lookup_from(&[
            (HOST_VAR, "127.0.0.1"),
            (PORT_VAR, "5673"),
        ]))
        .unwrap();
        assert_eq!(config.interface(), "127.0.0.1:5673");
    }

    #[test]
    fn test_invalid_port() {
        assert!(Config::from_lookup(lookup_from(&[(PORT_VAR, "amqp")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[(PORT_VAR, "70000")])).is_err());
    }

    #[test]
    fn test_flags() {
        let config = Config::from_lookup(lookup_from(&[
            (QUIET_VAR, "yes"),
            (VERBOSE_VAR, "0"),
            (EVICT_IDLE_VAR, "true"),
        ]))
        .unwrap();
        assert!(config.quiet);
        assert!(!config.verbose);
        assert_eq!(config.retention, Retention::EvictIdle);
    }

    #[test]
    fn test_invalid_flag() {
        assert!(Config::from_lookup(lookup_from(&[(QUIET_VAR, "maybe")])).is_err());
    }

    #[test]
    fn test_link_window() {
        let config = Config::from_lookup(lookup_from(&[(LINK_WINDOW_VAR, "16")])).unwrap();
        assert_eq!(config.link_window, 16);
        assert!(Config::from_lookup(lookup_from(&[(LINK_WINDOW_VAR, "0")])).is_err());
    }
}
