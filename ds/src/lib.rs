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

mod block;
mod context;

pub use block::{BlockStorage, StorageHeader, STORAGE_HEADER_SIZE};
pub use context::{Checkpoint, Context};

/// Byte-addressed storage medium with positional reads and writes.
pub trait DataStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;
}

impl<DS: DataStorage + ?Sized> DataStorage for &DS {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        (*self).read(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        (*self).write(offset, buffer)
    }

    fn sync(&self) -> Result<()> {
        (*self).sync()
    }
}
