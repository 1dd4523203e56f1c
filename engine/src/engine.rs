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
    collections::HashMap,
    fmt,
    fs::{self, File},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use log::{debug, error, info};

use ytfs_ds::{BlockStorage, Context, STORAGE_HEADER_SIZE};
use ytfs_ds_file::FileStorage;
use ytfs_index::{Header, IndexItem, Key, KeyIndex, TableIndex};

use crate::{config::Options, Error, Result};

/// Name of the persisted settings inside the engine directory.
const CONFIG_NAME: &str = "config.json";
/// Name of the index file inside the engine directory.
const INDEX_NAME: &str = "index.db";
/// Arbitration marker created once the directory is fully opened.
const SAFE_NAME: &str = "dbsafe";
/// Upper bound on the number of pairs a single batch may carry.
const MAX_BATCH: usize = 1000;

/// Fixed-block content-addressed storage engine.
///
/// Maps 32-byte content hashes to fixed-size blocks stored across the
/// configured backing files. A key maps to at most one block; re-putting a
/// live key fails, the engine is not a multi-map.
///
/// The engine is safe for concurrent use: mutating calls serialize on an
/// engine-wide writer lock, readers run concurrently with each other and
/// with writers. It must be closed after use; dropping it closes it as a
/// fallback.
pub struct Ytfs<I: KeyIndex = TableIndex<FileStorage>> {
    options: Options,
    db: I,
    context: Context<FileStorage>,
    writer: Mutex<()>,
    closed: AtomicBool,
}

impl Ytfs {
    /// Opens or creates the engine rooted at `dir`.
    ///
    /// On first open the directory and every configured file are created and
    /// formatted. On reopen the persisted settings must match `options`,
    /// except that storages may be appended to grow the capacity; every
    /// pre-existing slot keeps its identity and new writes extend the
    /// frontier into the new files.
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<Ytfs> {
        let dir = dir.as_ref();
        options.validate()?;

        let mut first_open = true;
        match fs::metadata(dir) {
            Ok(metadata) if !metadata.is_dir() => return Err(Error::DirNameConflict),
            Ok(_) => match Options::load(&dir.join(CONFIG_NAME)) {
                Ok(persisted) => {
                    if !persisted.compatible_with(&options) {
                        return Err(Error::SettingMismatch);
                    }
                    first_open = false;
                }
                Err(Error::EmptyDir) => {}
                Err(error) => return Err(error),
            },
            Err(_) => fs::create_dir_all(dir)?,
        }
        if first_open && options.capacity() != options.total_volume {
            error!(
                "Storage capacities ({}) shall sum to the total volume ({})",
                options.capacity(),
                options.total_volume
            );
            return Err(Error::ConfigC);
        }
        options.save(&dir.join(CONFIG_NAME))?;

        let prototype = Header::new(
            options.total_volume,
            options.total_size(),
            options.data_block_size,
            options.index_table_rows,
            options.index_table_cols,
        );
        let db = TableIndex::open(
            FileStorage::open_or_create(dir.join(INDEX_NAME), prototype.table_end())?,
            prototype,
        )?;

        let mut storages = Vec::with_capacity(options.storages.len());
        for storage in &options.storages {
            storages.push(BlockStorage::open(
                FileStorage::open_or_create(
                    &storage.path,
                    STORAGE_HEADER_SIZE + storage.storage_volume,
                )?,
                options.data_block_size,
                storage.capacity(),
            )?);
        }
        let context = Context::new(storages, options.data_block_size, db.frontier())?;

        File::create(dir.join(SAFE_NAME))?;
        info!("YTFS opened at {}", dir.display());
        Ok(Ytfs {
            options,
            db,
            context,
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

impl<I: KeyIndex> Ytfs<I> {
    /// Returns a copy of the block stored under `key`.
    pub fn get(&self, key: &Key) -> Result<Vec<u8>> {
        self.check_open()?;
        let slot = self.db.get(key)?;
        self.context.get(slot as u64)
    }

    /// Stores `buffer` under `key`.
    pub fn put(&self, key: &Key, buffer: &[u8]) -> Result<()> {
        self.check_open()?;
        let _writer = self.writer.lock().unwrap();
        match self.db.get(key) {
            Ok(_) => return Err(Error::DataConflict),
            Err(Error::NotFound) => {}
            Err(error) => return Err(error),
        }
        if buffer.len() != self.options.data_block_size as usize {
            return Err(Error::InvalidBlockSize);
        }
        let slot = self.context.put(buffer)?;
        // an index failure past this point leaves the slot dead, not corrupt
        self.db.put(key, slot as u32)?;
        self.db.set_frontier(self.context.len())
    }

    /// Stores every `(key, block)` pair of `batch`, or none of them.
    ///
    /// Fails with [`Error::Conflict`] carrying exactly the keys that are
    /// already present; in that case, as on every other failure, the data
    /// frontier and the index are restored to their pre-batch state.
    pub fn batch_put(&self, batch: &[(Key, Vec<u8>)]) -> Result<()> {
        self.check_open()?;
        if batch.len() > MAX_BATCH {
            return Err(Error::BatchTooLarge);
        }
        let _writer = self.writer.lock().unwrap();

        let block_size = self.options.data_block_size as usize;
        let mut buffer = Vec::with_capacity(batch.len() * block_size);
        let mut items = Vec::with_capacity(batch.len());
        for (key, block) in batch {
            if block.len() != block_size {
                return Err(Error::InvalidBlockSize);
            }
            buffer.extend_from_slice(block);
            items.push(IndexItem {
                key: *key,
                value: 0,
            });
        }

        let checkpoint = self.context.save();
        let start = match self.context.batch_put(batch.len() as u64, &buffer) {
            Ok(start) => start,
            Err(error) => {
                self.context.restore(&checkpoint);
                return Err(error);
            }
        };
        for (index, item) in items.iter_mut().enumerate() {
            item.value = (start + index as u64) as u32;
        }

        match self.db.batch_put(&items) {
            Ok(()) => self.db.set_frontier(self.context.len()),
            Err(Error::Conflict(conflicts)) => {
                debug!(
                    "Rolling back a batch of {} after {} conflicts",
                    items.len(),
                    conflicts.len()
                );
                self.rollback(&items, &conflicts)?;
                self.context.restore(&checkpoint);
                Err(Error::Conflict(conflicts))
            }
            Err(error) => {
                debug!("Rolling back a batch of {}: {error}", items.len());
                self.rollback(&items, &[])?;
                self.context.restore(&checkpoint);
                Err(error)
            }
        }
    }

    /// Undoes the index inserts of a failed batch, skipping the keys that
    /// conflicted and were therefore never inserted by it.
    fn rollback(&self, items: &[IndexItem], conflicts: &[Key]) -> Result<()> {
        let mut sizes = HashMap::new();
        for item in items {
            if conflicts.contains(&item.key) {
                continue;
            }
            self.db.clear(&item.key, &mut sizes)?;
        }
        self.db.reset_sizes(&sizes)
    }

    /// Capacity of the data region in blocks.
    pub fn cap(&self) -> u64 {
        self.context.cap()
    }

    /// Number of blocks written so far.
    pub fn len(&self) -> u64 {
        self.context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed size in bytes of every stored block.
    pub fn block_size(&self) -> u32 {
        self.options.data_block_size
    }

    /// Total size in bytes of the backing files' data regions.
    pub fn total_size(&self) -> u64 {
        self.options.total_size()
    }

    /// A copy of the on-disk schema.
    pub fn meta(&self) -> Header {
        self.db.schema()
    }

    /// Quick format: drops every mapping and rewinds the frontier to zero.
    pub fn reset(&self) -> Result<()> {
        self.check_open()?;
        let _writer = self.writer.lock().unwrap();
        self.db.reset()?;
        self.context.reset();
        Ok(())
    }

    /// Persists the write frontier and syncs every file. Calling it more
    /// than once is valid; every other operation fails once it ran.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _writer = self.writer.lock().unwrap();
        self.db.set_frontier(self.context.len())?;
        self.db.sync()?;
        self.context.sync()?;
        info!("YTFS closed");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl<I: KeyIndex> Drop for Ytfs<I> {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            error!("Closing YTFS failed: {error}");
        }
    }
}

impl<I: KeyIndex> fmt::Display for Ytfs<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#?}", self.meta())
    }
}
