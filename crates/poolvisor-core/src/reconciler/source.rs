// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sources of the desired PgBouncer configuration.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::ReconcileError;

/// Files that make up a PgBouncer configuration.
pub const CONFIG_FILES: [&str; 3] = ["pgbouncer.ini", "pg_hba.conf", "userlist.txt"];

/// One rendered configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    /// File name inside the configuration directory.
    pub name: String,
    /// Full file contents.
    pub contents: Vec<u8>,
}

impl ConfigFile {
    /// Create a file entry.
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// Provides the configuration PgBouncer should run with.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Current desired files.
    async fn desired_files(&self) -> Result<Vec<ConfigFile>, ReconcileError>;
}

/// Reads rendered files from a directory, such as a mounted secret.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    files: Vec<String>,
}

impl DirectorySource {
    /// Source reading [`CONFIG_FILES`] from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: CONFIG_FILES.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Replace the list of files to read.
    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Directory the files are read from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ConfigSource for DirectorySource {
    async fn desired_files(&self) -> Result<Vec<ConfigFile>, ReconcileError> {
        let mut files = Vec::with_capacity(self.files.len());
        for name in &self.files {
            let path = self.dir.join(name);
            let contents = tokio::fs::read(&path)
                .await
                .map_err(|source| ReconcileError::Source { path, source })?;
            files.push(ConfigFile::new(name.clone(), contents));
        }
        Ok(files)
    }
}
