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
    collections::{hash_map::Entry, HashMap},
    sync::Mutex,
};

use log::error;
use zerocopy::{
    little_endian::{U32, U64},
    FromZeros, IntoBytes,
};

use ytfs_ds::DataStorage;

use crate::{Error, Header, IndexItem, Key, KeyIndex, Result, TableEntry, TAG, VERSION};

/// Cached image of one range: its full entry array and live-entry count.
///
/// The on-disk size counter is the source of truth for occupancy; the cache
/// is loaded from it and written through on every mutation, so the two agree
/// at every commit point. Entries at positions `size..` are dead bytes.
struct RangeState {
    size: u32,
    entries: Vec<TableEntry>,
}

impl RangeState {
    fn live(&self) -> &[TableEntry] {
        &self.entries[..self.size as usize]
    }

    fn find(&self, key: &Key) -> Option<usize> {
        self.live().iter().position(|entry| entry.key == *key)
    }
}

/// Hash-range-partitioned open-addressed on-disk index table.
///
/// Every range is a first-come-first-served log: entry `i` holds the `i`-th
/// key inserted into the range that has not been cleared since. Lookups scan
/// the live entries linearly; with `m` in the tens to low hundreds, bounded
/// by [`Error::RangeFull`], anything fancier would not pay for itself.
pub struct TableIndex<DS: DataStorage> {
    storage: DS,
    header: Mutex<Header>,
    cache: Mutex<HashMap<u32, RangeState>>,
}

impl<DS: DataStorage> TableIndex<DS> {
    /// Opens the index over `storage`, formatting it with `prototype` on
    /// first use and validating the persisted header against it otherwise.
    pub fn open(storage: DS, prototype: Header) -> Result<Self> {
        let mut header = Header::new_zeroed();
        storage.read(0, header.as_mut_bytes())?;
        if header.tag == [0; 4] {
            header = prototype;
            storage.write(0, header.as_bytes())?;
        } else {
            if header.tag != TAG || header.version != VERSION {
                error!("Index tag/version shall be {:?}/{:?}", TAG, VERSION);
                return Err(Error::ConfigIndexMismatch);
            }
            if header.ytfs_capability != prototype.ytfs_capability
                || header.data_block_size != prototype.data_block_size
                || header.range_capacity != prototype.range_capacity
                || header.range_coverage != prototype.range_coverage
            {
                error!("Index header shall match the configured geometry");
                return Err(Error::ConfigIndexMismatch);
            }
        }
        Ok(Self {
            storage,
            header: Mutex::new(header),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn load_range<'cache>(
        &self,
        header: &Header,
        cache: &'cache mut HashMap<u32, RangeState>,
        range: u32,
    ) -> Result<&'cache mut RangeState> {
        match cache.entry(range) {
            Entry::Occupied(state) => Ok(state.into_mut()),
            Entry::Vacant(slot) => {
                let coverage = header.range_coverage.get() as usize;
                let mut entries = vec![TableEntry::new_zeroed(); coverage];
                self.storage
                    .read(header.range_offset(range), entries.as_mut_bytes())?;
                let mut counter = U32::new(0);
                self.storage
                    .read(header.counter_offset(range), counter.as_mut_bytes())?;
                let size = counter.get();
                if size as usize > coverage {
                    error!("Range size ({size}) shall not exceed the range coverage ({coverage})");
                    return Err(Error::ConfigIndexMismatch);
                }
                Ok(slot.insert(RangeState { size, entries }))
            }
        }
    }

    fn write_counter(&self, header: &Header, range: u32, size: u32) -> Result<()> {
        self.storage
            .write(header.counter_offset(range), U32::new(size).as_bytes())
    }
}

impl<DS: DataStorage> KeyIndex for TableIndex<DS> {
    fn get(&self, key: &Key) -> Result<u32> {
        let header = *self.header.lock().unwrap();
        let range = header.range_of(key);
        let mut cache = self.cache.lock().unwrap();
        let state = self.load_range(&header, &mut cache, range)?;
        state
            .find(key)
            .map(|index| state.entries[index].value.get())
            .ok_or(Error::NotFound)
    }

    fn put(&self, key: &Key, value: u32) -> Result<()> {
        let header = *self.header.lock().unwrap();
        let range = header.range_of(key);
        let mut cache = self.cache.lock().unwrap();
        let state = self.load_range(&header, &mut cache, range)?;
        if state.find(key).is_some() {
            return Err(Error::Conflict(vec![*key]));
        }
        if state.size == header.range_coverage.get() {
            return Err(Error::RangeFull);
        }

        let index = state.size;
        let entry = TableEntry {
            key: *key,
            value: U32::new(value),
        };
        self.storage
            .write(header.entry_offset(range, index), entry.as_bytes())?;
        self.write_counter(&header, range, index + 1)?;
        state.entries[index as usize] = entry;
        state.size = index + 1;
        Ok(())
    }

    fn batch_put(&self, items: &[IndexItem]) -> Result<()> {
        let header = *self.header.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();

        let mut ranges: HashMap<u32, Vec<&IndexItem>> = HashMap::new();
        for item in items {
            ranges
                .entry(header.range_of(&item.key))
                .or_default()
                .push(item);
        }

        // first pass over every touched range: collect the complete conflict
        // set and check that the fresh entries fit
        let mut conflicts = Vec::new();
        let mut overflow = false;
        for (&range, batch) in &ranges {
            let state = self.load_range(&header, &mut cache, range)?;
            let mut fresh: Vec<&Key> = Vec::with_capacity(batch.len());
            for item in batch {
                if state.find(&item.key).is_some() || fresh.contains(&&item.key) {
                    conflicts.push(item.key);
                } else {
                    fresh.push(&item.key);
                }
            }
            if state.size as u64 + fresh.len() as u64 > header.range_coverage.get() as u64 {
                overflow = true;
            }
        }
        if !conflicts.is_empty() {
            return Err(Error::Conflict(conflicts));
        }
        if overflow {
            return Err(Error::RangeFull);
        }

        // second pass: append each range's entries and persist it once
        for (&range, batch) in &ranges {
            let state = self.load_range(&header, &mut cache, range)?;
            let start = state.size as usize;
            for (index, item) in batch.iter().enumerate() {
                state.entries[start + index] = TableEntry {
                    key: item.key,
                    value: U32::new(item.value),
                };
            }
            let size = start + batch.len();
            self.storage.write(
                header.entry_offset(range, start as u32),
                state.entries[start..size].as_bytes(),
            )?;
            self.write_counter(&header, range, size as u32)?;
            state.size = size as u32;
        }
        Ok(())
    }

    fn clear(&self, key: &Key, sizes: &mut HashMap<u32, u32>) -> Result<()> {
        let header = *self.header.lock().unwrap();
        let range = header.range_of(key);
        let mut cache = self.cache.lock().unwrap();
        let state = self.load_range(&header, &mut cache, range)?;
        let size = state.size as usize;
        let Some(index) = state.find(key) else {
            return Ok(());
        };

        state.entries.copy_within(index + 1..size, index);
        state.size -= 1;
        if index + 1 < size {
            // rewrite the shifted tail; the counter write is deferred to
            // reset_sizes
            self.storage.write(
                header.entry_offset(range, index as u32),
                state.entries[index..size - 1].as_bytes(),
            )?;
        }
        sizes.insert(range, state.size);
        Ok(())
    }

    fn reset_sizes(&self, sizes: &HashMap<u32, u32>) -> Result<()> {
        let header = *self.header.lock().unwrap();
        for (&range, &size) in sizes {
            self.write_counter(&header, range, size)?;
        }
        Ok(())
    }

    fn schema(&self) -> Header {
        *self.header.lock().unwrap()
    }

    fn frontier(&self) -> u64 {
        self.header.lock().unwrap().data_end_point.get()
    }

    fn set_frontier(&self, frontier: u64) -> Result<()> {
        let mut header = self.header.lock().unwrap();
        header.data_end_point = U64::new(frontier);
        self.storage.write(0, header.as_bytes())
    }

    fn reset(&self) -> Result<()> {
        let mut header = self.header.lock().unwrap();
        header.data_end_point = U64::new(0);
        self.storage.write(0, header.as_bytes())?;
        for range in 0..=header.range_capacity.get() {
            self.write_counter(&header, range, 0)?;
        }
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.storage.sync()
    }
}
