// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `promote <cluster> <instance>`

use std::io::Write;

use poolvisor_core::cluster::{ClusterStateMutator, ObjectKey, PromoteOutcome};

use crate::CliError;

/// Request `instance` to become the primary of `key`.
pub async fn execute(
    mutator: &ClusterStateMutator,
    key: &ObjectKey,
    instance: &str,
    out: &mut (dyn Write + Send),
) -> Result<(), CliError> {
    match mutator.promote(key, instance).await? {
        PromoteOutcome::Promoted => writeln!(
            out,
            "Node {} in cluster {} will be promoted",
            instance, key.name
        )?,
        PromoteOutcome::AlreadyPrimary => writeln!(
            out,
            "{} is already the primary node in the cluster",
            instance
        )?,
    }
    Ok(())
}
