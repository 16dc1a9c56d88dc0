// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the `pgbouncer run` sidecar.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use poolvisor_core::runtime::DEFAULT_METRICS_PORT;

/// Sidecar configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Name of the Pooler resource this sidecar serves
    pub pooler_name: String,
    /// Namespace of the Pooler
    pub namespace: String,
    /// PgBouncer executable
    pub pgbouncer_binary: PathBuf,
    /// Directory PgBouncer reads its configuration from
    pub configs_dir: PathBuf,
    /// Directory PgBouncer creates its unix socket in
    pub socket_dir: PathBuf,
    /// Directory holding the rendered configuration files
    pub source_dir: PathBuf,
    /// Port of the metrics endpoint
    pub metrics_port: u16,
    /// Time between reconciliation passes
    pub reconcile_interval: Duration,
}

impl RunConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pooler_name =
            lookup("POOLER_NAME").ok_or(ConfigError::MissingEnvVar("POOLER_NAME"))?;
        let namespace = lookup("NAMESPACE").ok_or(ConfigError::MissingEnvVar("NAMESPACE"))?;

        let path_or = |name: &str, default: &str| {
            PathBuf::from(lookup(name).unwrap_or_else(|| default.to_string()))
        };
        let pgbouncer_binary = path_or("PGBOUNCER_BINARY", "/usr/bin/pgbouncer");
        let configs_dir = path_or("PGBOUNCER_CONFIGS_DIR", "/controller/configs");
        let socket_dir = path_or("PGBOUNCER_SOCKET_DIR", "/controller/run");
        let source_dir = path_or("PGBOUNCER_SOURCE_DIR", "/controller/source");

        let metrics_port: u16 = match lookup("POOLVISOR_METRICS_PORT") {
            Some(port) => port.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => DEFAULT_METRICS_PORT,
        };

        let secs: u64 = match lookup("POOLVISOR_RECONCILE_INTERVAL_SECS") {
            Some(secs) => secs
                .parse()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError::InvalidInterval(secs))?,
            None => 30,
        };

        Ok(Self {
            pooler_name,
            namespace,
            pgbouncer_binary,
            configs_dir,
            socket_dir,
            source_dir,
            metrics_port,
            reconcile_interval: Duration::from_secs(secs),
        })
    }

    /// Address the metrics endpoint binds to.
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }

    /// Main PgBouncer configuration file, passed as its only argument.
    pub fn config_path(&self) -> PathBuf {
        self.configs_dir.join("pgbouncer.ini")
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// The reconcile interval is not a positive number of seconds.
    #[error("Invalid reconcile interval: {0}")]
    InvalidInterval(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            RunConfig::from_lookup(lookup(&[("POOLER_NAME", "pooler-rw"), ("NAMESPACE", "db")]))
                .unwrap();

        assert_eq!(config.pooler_name, "pooler-rw");
        assert_eq!(config.pgbouncer_binary, PathBuf::from("/usr/bin/pgbouncer"));
        assert_eq!(
            config.config_path(),
            PathBuf::from("/controller/configs/pgbouncer.ini")
        );
        assert_eq!(config.socket_dir, PathBuf::from("/controller/run"));
        assert_eq!(config.metrics_addr().port(), 9127);
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_pooler_name() {
        let err = RunConfig::from_lookup(lookup(&[("NAMESPACE", "db")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("POOLER_NAME")));
    }

    #[test]
    fn test_invalid_port() {
        let err = RunConfig::from_lookup(lookup(&[
            ("POOLER_NAME", "p"),
            ("NAMESPACE", "db"),
            ("POOLVISOR_METRICS_PORT", "70000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = RunConfig::from_lookup(lookup(&[
            ("POOLER_NAME", "p"),
            ("NAMESPACE", "db"),
            ("POOLVISOR_RECONCILE_INTERVAL_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInterval(_)));
    }
}
