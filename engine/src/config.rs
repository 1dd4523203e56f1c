// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::error;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One backing file of the data region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Location of the storage file.
    #[serde(rename = "Path")]
    pub path: PathBuf,
    /// Size of this file's data region in bytes.
    #[serde(rename = "StorageVolume")]
    pub storage_volume: u64,
    /// Block size of this file, which must match the engine's.
    #[serde(rename = "DataBlockSize")]
    pub data_block_size: u32,
}

impl StorageOptions {
    /// Number of block cells this storage contributes.
    pub fn capacity(&self) -> u64 {
        self.storage_volume / self.data_block_size as u64
    }
}

/// Engine settings, persisted as `config.json` in the engine directory. The
/// wire keys keep the names of the original on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Total logical capacity in slots.
    #[serde(rename = "TotalVolumn")]
    pub total_volume: u64,
    /// Fixed block size in bytes, a power of two.
    #[serde(rename = "DataBlockSize")]
    pub data_block_size: u32,
    /// Number of index ranges (`n`).
    #[serde(rename = "IndexTableRows")]
    pub index_table_rows: u32,
    /// Entries per index range (`m`).
    #[serde(rename = "IndexTableCols")]
    pub index_table_cols: u32,
    /// Ordered backing files of the data region.
    #[serde(rename = "Storages")]
    pub storages: Vec<StorageOptions>,
}

impl Options {
    /// Development defaults: 32 KiB blocks in a single 64 MiB storage file
    /// under `dir`.
    pub fn default_in(dir: impl AsRef<Path>) -> Self {
        const DATA_BLOCK_SIZE: u32 = 1 << 15;
        const STORAGE_VOLUME: u64 = 1 << 26;
        Self {
            total_volume: STORAGE_VOLUME / DATA_BLOCK_SIZE as u64,
            data_block_size: DATA_BLOCK_SIZE,
            index_table_rows: 64,
            index_table_cols: 64,
            storages: vec![StorageOptions {
                path: dir.as_ref().join("storage.ytfs"),
                storage_volume: STORAGE_VOLUME,
                data_block_size: DATA_BLOCK_SIZE,
            }],
        }
    }

    /// Checks the settings for internal consistency.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.data_block_size.is_power_of_two() {
            error!(
                "Data block size ({}) shall be a power of two",
                self.data_block_size
            );
            return Err(Error::ConfigD);
        }
        if self.index_table_rows == 0 || self.index_table_cols == 0 {
            error!(
                "Index geometry ({} x {}) shall be non-zero",
                self.index_table_rows, self.index_table_cols
            );
            return Err(Error::ConfigC);
        }
        if self.storages.is_empty() {
            error!("Settings shall declare at least one storage");
            return Err(Error::ConfigC);
        }
        for storage in &self.storages {
            if storage.data_block_size != self.data_block_size {
                error!(
                    "Storage block size ({}) shall match the engine block size ({})",
                    storage.data_block_size, self.data_block_size
                );
                return Err(Error::ConfigD);
            }
            if storage.storage_volume == 0
                || storage.storage_volume % self.data_block_size as u64 != 0
            {
                error!(
                    "Storage volume ({}) shall be a non-zero multiple of the block size",
                    storage.storage_volume
                );
                return Err(Error::ConfigC);
            }
        }
        Ok(())
    }

    /// Sum of the per-storage slot capacities.
    pub(crate) fn capacity(&self) -> u64 {
        self.storages.iter().map(StorageOptions::capacity).sum()
    }

    /// Sum of the per-storage volumes in bytes.
    pub(crate) fn total_size(&self) -> u64 {
        self.storages
            .iter()
            .map(|storage| storage.storage_volume)
            .sum()
    }

    /// Whether the persisted settings `self` permit reopening with `other`:
    /// the scalar settings must be unchanged, and storages may only be
    /// appended.
    pub(crate) fn compatible_with(&self, other: &Options) -> bool {
        self.total_volume == other.total_volume
            && self.data_block_size == other.data_block_size
            && self.index_table_rows == other.index_table_rows
            && self.index_table_cols == other.index_table_cols
            && other.storages.len() >= self.storages.len()
            && self.storages[..] == other.storages[..self.storages.len()]
    }

    pub(crate) fn load(path: &Path) -> Result<Options> {
        let raw = fs::read(path).map_err(|error| {
            if error.kind() == io::ErrorKind::NotFound {
                Error::EmptyDir
            } else {
                Error::Io(error)
            }
        })?;
        serde_json::from_slice(&raw).map_err(|error| {
            error!("Settings at {} shall parse: {error}", path.display());
            Error::SettingMismatch
        })
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self).map_err(io::Error::from)?;
        fs::write(path, raw)?;
        Ok(())
    }
}
