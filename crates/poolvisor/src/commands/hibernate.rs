// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `hibernate on|off <cluster>`

use std::io::Write;

use poolvisor_core::cluster::{ClusterStateMutator, HibernationMode, ObjectKey};

use crate::CliError;

/// Set the hibernation mode of `key`.
pub async fn execute(
    mutator: &ClusterStateMutator,
    key: &ObjectKey,
    mode: HibernationMode,
    out: &mut (dyn Write + Send),
) -> Result<(), CliError> {
    mutator.hibernate(key, mode).await?;
    writeln!(out, "cluster {} hibernation set to {}", key.name, mode)?;
    Ok(())
}
