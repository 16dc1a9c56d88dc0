// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST client for `Cluster` and `Pod` objects.

use async_trait::async_trait;
use poolvisor_core::cluster::{ClusterState, ClusterStore, InstanceLookup, ObjectKey, StoreError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{KubeConfig, KubeError};
use crate::object::{ClusterObject, fenced_instances_patch, hibernation_patch, status_patch};

const CLUSTER_API: &str = "apis/postgresql.cnpg.io/v1";
const MERGE_PATCH: &str = "application/merge-patch+json";

/// Kubernetes `Status` body returned on failures.
#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

/// Cluster store backed by the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
}

impl KubeClient {
    /// Build a client from connection settings.
    pub fn new(config: &KubeConfig) -> Result<Self, KubeError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                KubeError::InvalidEnvVar {
                    name: "POOLVISOR_KUBE_TOKEN_FILE",
                    value: "<redacted>".to_string(),
                }
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure);

        if let Some(pem) = &config.ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(pem)
                .map_err(KubeError::InvalidCertificate)?
            {
                builder = builder.add_root_certificate(cert);
            }
        }

        let http = builder.build().map_err(KubeError::Client)?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn cluster_url(&self, key: &ObjectKey) -> String {
        format!(
            "{}/{}/namespaces/{}/clusters/{}",
            self.base_url, CLUSTER_API, key.namespace, key.name
        )
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods/{}", self.base_url, namespace, name)
    }

    async fn patch(
        &self,
        url: String,
        key: &ObjectKey,
        body: Value,
    ) -> Result<ClusterState, StoreError> {
        debug!(cluster = %key, url = %url, "Patching cluster");
        let response = self
            .http
            .patch(&url)
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body.to_string())
            .send()
            .await
            .map_err(transport_error)?;
        decode_cluster(response, key).await
    }
}

#[async_trait]
impl ClusterStore for KubeClient {
    async fn get(&self, key: &ObjectKey) -> Result<ClusterState, StoreError> {
        let response = self
            .http
            .get(self.cluster_url(key))
            .send()
            .await
            .map_err(transport_error)?;
        decode_cluster(response, key).await
    }

    async fn update_status(&self, state: &ClusterState) -> Result<ClusterState, StoreError> {
        let url = format!("{}/status", self.cluster_url(&state.key));
        self.patch(url, &state.key, status_patch(state)).await
    }

    async fn update_fenced_instances(
        &self,
        state: &ClusterState,
    ) -> Result<ClusterState, StoreError> {
        let url = self.cluster_url(&state.key);
        self.patch(url, &state.key, fenced_instances_patch(state))
            .await
    }

    async fn patch_hibernation(&self, state: &ClusterState) -> Result<ClusterState, StoreError> {
        let url = self.cluster_url(&state.key);
        self.patch(url, &state.key, hibernation_patch(state)).await
    }
}

#[async_trait]
impl InstanceLookup for KubeClient {
    async fn instance_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let response = self
            .http
            .get(self.pod_url(namespace, name))
            .send()
            .await
            .map_err(transport_error)?;

        match check_status(response).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

async fn decode_cluster(response: Response, key: &ObjectKey) -> Result<ClusterState, StoreError> {
    let response = check_status(response).await?;
    let object: ClusterObject = response
        .json()
        .await
        .map_err(|e| StoreError::Invalid(format!("cluster {}: {}", key, e)))?;
    object.into_state(key.clone())
}

/// Passes successful responses through and maps failures to [`StoreError`].
async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiStatus>(&body)
        .ok()
        .map(|s| s.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);

    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT => StoreError::Conflict(message),
        other => StoreError::Api {
            status: other.as_u16(),
            message,
        },
    })
}

fn transport_error(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}
