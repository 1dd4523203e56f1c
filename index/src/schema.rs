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

use std::mem::size_of;

use zerocopy::{
    little_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Identifies an index file, always `YTFS`.
pub const TAG: [u8; 4] = *b"YTFS";
/// On-disk format revision, currently `0.03`.
pub const VERSION: [u8; 4] = *b"0.03";

/// Length of a content hash in bytes.
pub const KEY_SIZE: usize = 32;
/// Length of a table entry in bytes: a key followed by its slot.
pub const ENTRY_SIZE: usize = size_of::<TableEntry>();
/// Length of the header record in bytes, which is also where the hash table
/// region begins.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Marker filling the reserved header field.
pub const RESERVED_PATTERN: u64 = 0xCDCD_CDCD_CDCD_CDCD;

/// On-disk layout descriptor at offset 0 of the index file, little-endian.
///
/// The hash table region follows immediately at `hash_offset`: `(n + 1)`
/// ranges of `m` entries plus a 4-byte size counter each, where `n` is
/// `range_capacity` and `m` is `range_coverage`. Range `n` is a sentinel that
/// reserves space but is never selected by the key mapping. The recycle
/// region, reserved for future space reclamation, would begin at
/// `recycle_offset`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Header {
    /// Identifies the file as a YTFS index, always `YTFS`.
    pub tag: [u8; 4],
    /// On-disk format revision, currently `0.03`.
    pub version: [u8; 4],
    /// Total logical slot capacity of the data region.
    pub ytfs_capability: U64,
    /// Total backing-file capacity in bytes, summed over every storage.
    pub ytfs_size: U64,
    /// Fixed block size in bytes.
    pub data_block_size: U32,
    /// Number of ranges the key space is partitioned into (`n`).
    pub range_capacity: U32,
    /// Number of entries per range (`m`).
    pub range_coverage: U32,
    /// Byte offset of the hash table region, equal to the header size.
    pub hash_offset: U32,
    /// Data write frontier: the number of slots currently occupied.
    pub data_end_point: U64,
    /// Byte offset at which recycle data would begin.
    pub recycle_offset: U64,
    /// Reserved, always [`RESERVED_PATTERN`].
    pub reserved: U64,
}

/// One hash table entry: a key and the data slot it occupies.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TableEntry {
    pub key: [u8; KEY_SIZE],
    pub value: U32,
}

impl Header {
    /// Builds the header of a freshly formatted index.
    pub fn new(
        capacity: u64,
        total_size: u64,
        data_block_size: u32,
        range_capacity: u32,
        range_coverage: u32,
    ) -> Self {
        let hash_offset = HEADER_SIZE as u32;
        let range_size = Self::range_size_of(range_coverage);
        Self {
            tag: TAG,
            version: VERSION,
            ytfs_capability: U64::new(capacity),
            ytfs_size: U64::new(total_size),
            data_block_size: U32::new(data_block_size),
            range_capacity: U32::new(range_capacity),
            range_coverage: U32::new(range_coverage),
            hash_offset: U32::new(hash_offset),
            data_end_point: U64::new(0),
            recycle_offset: U64::new(hash_offset as u64 + (range_capacity as u64 + 1) * range_size),
            reserved: U64::new(RESERVED_PATTERN),
        }
    }

    fn range_size_of(range_coverage: u32) -> u64 {
        range_coverage as u64 * ENTRY_SIZE as u64 + size_of::<U32>() as u64
    }

    /// Bytes occupied by one range: `m` entries plus the size counter.
    pub fn range_size(&self) -> u64 {
        Self::range_size_of(self.range_coverage.get())
    }

    /// Range holding `key`: the first four bytes folded as a little-endian
    /// 32-bit integer, modulo the range count. This rule is frozen; an index
    /// written by any implementation honoring it stays readable.
    pub fn range_of(&self, key: &[u8; KEY_SIZE]) -> u32 {
        let fold = u32::from_le_bytes([key[0], key[1], key[2], key[3]]);
        fold % self.range_capacity.get()
    }

    /// Byte offset of range `range`'s entry array.
    pub fn range_offset(&self, range: u32) -> u64 {
        self.hash_offset.get() as u64 + range as u64 * self.range_size()
    }

    /// Byte offset of entry `index` within range `range`.
    pub fn entry_offset(&self, range: u32, index: u32) -> u64 {
        self.range_offset(range) + index as u64 * ENTRY_SIZE as u64
    }

    /// Byte offset of range `range`'s size counter, stored after its entries.
    pub fn counter_offset(&self, range: u32) -> u64 {
        self.range_offset(range) + self.range_coverage.get() as u64 * ENTRY_SIZE as u64
    }

    /// Total size in bytes of the index file: header, hash table region and
    /// sentinel range, with the empty recycle region behind them.
    pub fn table_end(&self) -> u64 {
        self.recycle_offset.get()
    }
}
