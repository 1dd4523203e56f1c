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

use log::error;
use zerocopy::{
    little_endian::{U32, U64},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

use crate::{DataStorage, Error, Result};

/// Space reserved at the start of every storage file for its header.
pub const STORAGE_HEADER_SIZE: u64 = 512;

const STORAGE_TAG: [u8; 4] = *b"YTFB";
const STORAGE_VERSION: [u8; 4] = *b"0.03";

/// Self-describing record at offset 0 of every storage file, little-endian.
///
/// The block cell array follows at offset [`STORAGE_HEADER_SIZE`]; cell `j`
/// lives at byte `STORAGE_HEADER_SIZE + j * data_block_size`.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StorageHeader {
    /// Identifies the file as a block storage, always `YTFB`.
    tag: [u8; 4],
    /// On-disk format revision, currently `0.03`.
    version: [u8; 4],
    /// Size in bytes of every block cell of this file.
    data_block_size: U32,
    reserved0: [u8; 4],
    /// Number of block cells of this file.
    capacity: U64,
    /// Total file size in bytes, header included.
    storage_size: U64,
    /// Reserved, zero.
    reserved: [u8; 480],
}

/// One storage file: a contiguous array of `capacity` block-sized cells at
/// known byte offsets behind the header.
pub struct BlockStorage<DS: DataStorage> {
    storage: DS,
    data_block_size: u32,
    capacity: u64,
}

impl<DS: DataStorage> BlockStorage<DS> {
    /// Opens a storage file, writing a fresh header on first use and
    /// validating the persisted header against the engine geometry otherwise.
    ///
    /// The backing medium is expected to read as zeros where it has never
    /// been written, which is what a sparse file provides.
    pub fn open(storage: DS, data_block_size: u32, capacity: u64) -> Result<Self> {
        let mut header = StorageHeader::new_zeroed();
        storage.read(0, header.as_mut_bytes())?;
        if header.tag == [0; 4] {
            header = StorageHeader {
                tag: STORAGE_TAG,
                version: STORAGE_VERSION,
                data_block_size: U32::new(data_block_size),
                reserved0: [0; 4],
                capacity: U64::new(capacity),
                storage_size: U64::new(STORAGE_HEADER_SIZE + capacity * data_block_size as u64),
                reserved: [0; 480],
            };
            storage.write(0, header.as_bytes())?;
        } else {
            if header.tag != STORAGE_TAG || header.version != STORAGE_VERSION {
                error!(
                    "Storage tag/version shall be {:?}/{:?}",
                    STORAGE_TAG, STORAGE_VERSION
                );
                return Err(Error::ConfigC);
            }
            if header.data_block_size.get() != data_block_size {
                error!(
                    "Storage block size ({}) shall match the engine block size ({data_block_size})",
                    header.data_block_size.get()
                );
                return Err(Error::ConfigD);
            }
            if header.capacity.get() != capacity {
                error!(
                    "Storage capacity ({}) shall match the configured capacity ({capacity})",
                    header.capacity.get()
                );
                return Err(Error::ConfigC);
            }
        }
        Ok(Self {
            storage,
            data_block_size,
            capacity,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reads the block in cell `index`.
    pub fn read(&self, index: u64) -> Result<Vec<u8>> {
        if index >= self.capacity {
            return Err(Error::DataOverflow);
        }
        let mut buffer = vec![0; self.data_block_size as usize];
        self.storage.read(self.cell_offset(index), &mut buffer)?;
        Ok(buffer)
    }

    /// Writes a run of whole blocks starting at cell `index`. The buffer
    /// length must be a multiple of the block size.
    pub fn write_run(&self, index: u64, buffer: &[u8]) -> Result<()> {
        if buffer.len() % self.data_block_size as usize != 0 {
            return Err(Error::InvalidBlockSize);
        }
        let count = (buffer.len() / self.data_block_size as usize) as u64;
        if index + count > self.capacity {
            return Err(Error::DataOverflow);
        }
        self.storage.write(self.cell_offset(index), buffer)
    }

    pub fn sync(&self) -> Result<()> {
        self.storage.sync()
    }

    fn cell_offset(&self, index: u64) -> u64 {
        STORAGE_HEADER_SIZE + index * self.data_block_size as u64
    }
}
