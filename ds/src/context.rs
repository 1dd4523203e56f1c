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

use std::sync::atomic::{AtomicU64, Ordering};

use log::error;

use crate::{BlockStorage, DataStorage, Error, Result};

/// Saved write-frontier position used to rewind after a failed batch.
///
/// Blocks beyond a restored frontier are not zeroed; they are logically dead
/// and will be overwritten by future appends.
pub struct Checkpoint {
    frontier: u64,
}

/// A sequence of storage files presented as one logical slot-indexed block
/// array with a monotonic write frontier.
///
/// Mutating calls are expected to be serialized by the owning engine; the
/// frontier itself is atomic so that readers never take the writer lock.
pub struct Context<DS: DataStorage> {
    storages: Vec<BlockStorage<DS>>,
    /// Cumulative cell capacity up to and including each storage.
    bounds: Vec<u64>,
    data_block_size: u32,
    capacity: u64,
    frontier: AtomicU64,
}

impl<DS: DataStorage> Context<DS> {
    pub fn new(
        storages: Vec<BlockStorage<DS>>,
        data_block_size: u32,
        frontier: u64,
    ) -> Result<Self> {
        let mut bounds = Vec::with_capacity(storages.len());
        let mut capacity = 0;
        for storage in &storages {
            capacity += storage.capacity();
            bounds.push(capacity);
        }
        if frontier > capacity {
            error!("Write frontier ({frontier}) shall not exceed the capacity ({capacity})");
            return Err(Error::ConfigIndexMismatch);
        }
        Ok(Self {
            storages,
            bounds,
            data_block_size,
            capacity,
            frontier: AtomicU64::new(frontier),
        })
    }

    /// Total capacity in blocks across every storage.
    pub fn cap(&self) -> u64 {
        self.capacity
    }

    /// Current write frontier: the lowest slot that has never been written.
    pub fn len(&self) -> u64 {
        self.frontier.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the block at `slot`.
    pub fn get(&self, slot: u64) -> Result<Vec<u8>> {
        if slot >= self.capacity {
            return Err(Error::DataOverflow);
        }
        if slot >= self.len() {
            return Err(Error::NotFound);
        }
        let (device, cell) = self.locate(slot);
        self.storages[device].read(cell)
    }

    /// Appends one block, returning the slot it occupies.
    pub fn put(&self, buffer: &[u8]) -> Result<u64> {
        if buffer.len() != self.data_block_size as usize {
            return Err(Error::InvalidBlockSize);
        }
        let slot = self.frontier.load(Ordering::Relaxed);
        if slot >= self.capacity {
            return Err(Error::DataOverflow);
        }
        let (device, cell) = self.locate(slot);
        self.storages[device].write_run(cell, buffer)?;
        self.frontier.store(slot + 1, Ordering::Release);
        Ok(slot)
    }

    /// Appends `count` blocks whose concatenated payloads are `buffer`,
    /// splitting the run at every storage boundary it crosses. Returns the
    /// first slot of the run.
    ///
    /// The frontier only advances once every sub-write has succeeded; an I/O
    /// failure leaves it untouched for the caller to [`Self::restore`].
    pub fn batch_put(&self, count: u64, buffer: &[u8]) -> Result<u64> {
        if buffer.len() as u64 != count * self.data_block_size as u64 {
            return Err(Error::InvalidBlockSize);
        }
        let start = self.frontier.load(Ordering::Relaxed);
        if start + count > self.capacity {
            return Err(Error::DataOverflow);
        }
        let mut slot = start;
        let mut offset = 0;
        while slot < start + count {
            let (device, cell) = self.locate(slot);
            let fit = (start + count - slot).min(self.storages[device].capacity() - cell);
            let length = fit as usize * self.data_block_size as usize;
            self.storages[device].write_run(cell, &buffer[offset..offset + length])?;
            slot += fit;
            offset += length;
        }
        self.frontier.store(start + count, Ordering::Release);
        Ok(start)
    }

    pub fn save(&self) -> Checkpoint {
        Checkpoint {
            frontier: self.len(),
        }
    }

    pub fn restore(&self, checkpoint: &Checkpoint) {
        self.frontier.store(checkpoint.frontier, Ordering::Release);
    }

    pub fn reset(&self) {
        self.frontier.store(0, Ordering::Release);
    }

    pub fn sync(&self) -> Result<()> {
        for storage in &self.storages {
            storage.sync()?;
        }
        Ok(())
    }

    fn locate(&self, slot: u64) -> (usize, u64) {
        let device = self.bounds.partition_point(|&bound| bound <= slot);
        let base = if device == 0 {
            0
        } else {
            self.bounds[device - 1]
        };
        (device, slot - base)
    }
}
