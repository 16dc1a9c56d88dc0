// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command implementations.
//!
//! Cluster commands print a single line on success and return the mutation
//! error unchanged otherwise.

pub mod fence;
pub mod hibernate;
pub mod promote;
pub mod run;
