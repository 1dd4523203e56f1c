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

pub use ytfs_err::*;

mod schema;
mod table;

pub use schema::{Header, TableEntry, ENTRY_SIZE, HEADER_SIZE, KEY_SIZE, TAG, VERSION};
pub use table::TableIndex;

use std::collections::HashMap;

/// A 32-byte content hash.
pub type Key = [u8; KEY_SIZE];

/// One key → slot assignment handed to the index as part of a batch.
#[derive(Debug, Clone, Copy)]
pub struct IndexItem {
    pub key: Key,
    pub value: u32,
}

/// Backend seam of the hash → slot index.
///
/// [`TableIndex`] is the shipped file-backed implementation; an embedded
/// key-value store could slot in behind the same interface without touching
/// the engine. Implementations own the on-disk schema, including the data
/// write frontier persisted in its header.
///
/// Mutating calls are serialized by the engine's writer lock; `get` may run
/// concurrently with them.
pub trait KeyIndex {
    /// Returns the slot assigned to `key`, or [`Error::NotFound`].
    fn get(&self, key: &Key) -> Result<u32>;

    /// Assigns `key` to `value`. Fails with [`Error::Conflict`] if the key is
    /// already present and [`Error::RangeFull`] if its range is saturated.
    fn put(&self, key: &Key, value: u32) -> Result<()>;

    /// Inserts every item of the batch, or nothing.
    ///
    /// If any key is already present the whole batch is rejected with
    /// [`Error::Conflict`] carrying exactly the conflicting keys; if a range
    /// would overflow the batch is rejected with [`Error::RangeFull`]. Only
    /// an I/O failure can leave a partial tail behind, which the caller
    /// undoes with [`Self::clear`] and [`Self::reset_sizes`].
    fn batch_put(&self, items: &[IndexItem]) -> Result<()>;

    /// Rollback helper: compacts `key` out of its range and records the
    /// shrunken range size in `sizes`. A missing key is a no-op.
    fn clear(&self, key: &Key, sizes: &mut HashMap<u32, u32>) -> Result<()>;

    /// Persists the range sizes collected by a series of [`Self::clear`]
    /// calls, one write per affected range.
    fn reset_sizes(&self, sizes: &HashMap<u32, u32>) -> Result<()>;

    /// A copy of the on-disk schema.
    fn schema(&self) -> Header;

    /// The persisted data write frontier.
    fn frontier(&self) -> u64;

    /// Moves the data write frontier and persists the header.
    fn set_frontier(&self, frontier: u64) -> Result<()>;

    /// Quick format: fresh header with frontier zero, every range emptied.
    fn reset(&self) -> Result<()>;

    fn sync(&self) -> Result<()>;
}
