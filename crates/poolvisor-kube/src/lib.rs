// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poolvisor Kube - Kubernetes access for cluster state operations.
//!
//! Implements [`ClusterStore`](poolvisor_core::cluster::ClusterStore) and
//! [`InstanceLookup`](poolvisor_core::cluster::InstanceLookup) on top of the
//! Kubernetes REST API, talking to the `postgresql.cnpg.io/v1` `Cluster`
//! resource and to core `Pod` objects.
//!
//! ```ignore
//! use poolvisor_kube::{KubeClient, KubeConfig};
//!
//! let client = KubeClient::new(&KubeConfig::from_env()?)?;
//! ```

#![deny(missing_docs)]

mod client;
mod config;
mod object;

pub use client::KubeClient;
pub use config::{KubeConfig, KubeError};
pub use object::{FENCED_INSTANCES_ANNOTATION, HIBERNATION_ANNOTATION};
