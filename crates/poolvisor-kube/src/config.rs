// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API server connection settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Errors while building the Kubernetes client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KubeError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// An environment variable holds an unusable value.
    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar {
        /// Variable name.
        name: &'static str,
        /// Rejected value.
        value: String,
    },

    /// Token or CA file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// CA bundle is not valid PEM.
    #[error("Invalid CA certificate: {0}")]
    InvalidCertificate(#[source] reqwest::Error),

    /// HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// How to reach the API server.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// Base URL such as `https://10.0.0.1:443`.
    pub api_url: String,
    /// Bearer token, if any.
    pub token: Option<String>,
    /// PEM bundle of CAs trusted for the API server.
    pub ca_pem: Option<Vec<u8>>,
    /// Skip server certificate verification.
    pub insecure: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl KubeConfig {
    /// Configuration pointing at `api_url` without credentials.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: None,
            ca_pem: None,
            insecure: false,
            timeout: Duration::from_secs(30),
        }
    }

    /// In-cluster configuration from the service account, with overrides:
    ///
    /// - `POOLVISOR_KUBE_API_URL` replaces `KUBERNETES_SERVICE_HOST`/`_PORT`
    /// - `POOLVISOR_KUBE_TOKEN_FILE` replaces the service account token
    /// - `POOLVISOR_KUBE_CA_FILE` replaces the service account CA bundle
    /// - `POOLVISOR_KUBE_INSECURE=true` disables certificate verification
    pub fn from_env() -> Result<Self, KubeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, KubeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = match lookup("POOLVISOR_KUBE_API_URL") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = lookup("KUBERNETES_SERVICE_HOST")
                    .ok_or(KubeError::MissingEnvVar("KUBERNETES_SERVICE_HOST"))?;
                let port = lookup("KUBERNETES_SERVICE_PORT").unwrap_or_else(|| "443".to_string());
                if host.contains(':') {
                    format!("https://[{}]:{}", host, port)
                } else {
                    format!("https://{}:{}", host, port)
                }
            }
        };

        let token = read_optional(lookup("POOLVISOR_KUBE_TOKEN_FILE"), "token")?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string());
        let ca_pem = read_optional(lookup("POOLVISOR_KUBE_CA_FILE"), "ca.crt")?;

        let insecure = match lookup("POOLVISOR_KUBE_INSECURE") {
            Some(value) => parse_env_bool("POOLVISOR_KUBE_INSECURE", &value)?,
            None => false,
        };

        Ok(Self {
            api_url,
            token,
            ca_pem,
            insecure,
            timeout: Duration::from_secs(30),
        })
    }
}

/// Reads an explicitly configured file, or the service account default if
/// it exists.
fn read_optional(configured: Option<String>, default_name: &str) -> Result<Option<Vec<u8>>, KubeError> {
    let (path, required) = match configured {
        Some(path) => (PathBuf::from(path), true),
        None => (Path::new(SERVICE_ACCOUNT_DIR).join(default_name), false),
    };

    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(KubeError::ReadFile { path, source }),
    }
}

fn parse_env_bool(name: &'static str, value: &str) -> Result<bool, KubeError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(KubeError::InvalidEnvVar {
            name,
            value: value.to_string(),
        }),
    }
}
