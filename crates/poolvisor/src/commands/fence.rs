// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `fence on|off <cluster> <instance|*>`

use std::io::Write;

use poolvisor_core::cluster::{ClusterStateMutator, FenceTarget, ObjectKey};

use crate::CliError;

/// Fence (`enable`) or unfence `target` in `key`.
pub async fn execute(
    mutator: &ClusterStateMutator,
    key: &ObjectKey,
    target: &FenceTarget,
    enable: bool,
    out: &mut (dyn Write + Send),
) -> Result<(), CliError> {
    if enable {
        mutator.fence_on(key, target).await?;
        writeln!(out, "{} fenced", target)?;
    } else {
        mutator.fence_off(key, target).await?;
        writeln!(out, "{} unfenced", target)?;
    }
    Ok(())
}
