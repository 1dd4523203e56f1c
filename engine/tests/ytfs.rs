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

use std::{fs, thread};

use rand::RngCore;
use tempfile::TempDir;
use ytfs::{Error, Key, Options, StorageOptions, Ytfs};

const BLOCK_SIZE: u32 = 1 << 9;

/// Settings with one storage file per entry of `capacities`, each holding
/// that many blocks.
fn options(dir: &TempDir, capacities: &[u64], rows: u32, cols: u32) -> Options {
    Options {
        total_volume: capacities.iter().sum(),
        data_block_size: BLOCK_SIZE,
        index_table_rows: rows,
        index_table_cols: cols,
        storages: capacities
            .iter()
            .enumerate()
            .map(|(index, &capacity)| StorageOptions {
                path: dir.path().join(format!("{index:02}.storage")),
                storage_volume: capacity * BLOCK_SIZE as u64,
                data_block_size: BLOCK_SIZE,
            })
            .collect(),
    }
}

/// A key whose range is `fold % rows`, unique per `fold`.
fn key(fold: u64) -> Key {
    let mut key = [0; 32];
    key[..8].copy_from_slice(&fold.to_le_bytes());
    key
}

/// A deterministic block payload unique to `fold`.
fn block(fold: u64) -> Vec<u8> {
    let mut block = vec![fold as u8; BLOCK_SIZE as usize];
    block[..32].copy_from_slice(&key(fold));
    block
}

fn random_block(length: usize) -> Vec<u8> {
    let mut block = vec![0; length];
    rand::thread_rng().fill_bytes(&mut block);
    block
}

#[test]
fn put_then_get_with_default_options() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), Options::default_in(dir.path())).unwrap();
    assert_eq!(engine.block_size(), 1 << 15);

    let payload = random_block(1 << 15);
    engine.put(&key(1), &payload).unwrap();
    assert_eq!(engine.get(&key(1)).unwrap(), payload);
    engine.close().unwrap();
}

#[test]
fn get_of_a_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4], 4, 4)).unwrap();
    assert!(matches!(engine.get(&key(1)), Err(Error::NotFound)));
}

#[test]
fn put_rejects_foreign_block_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4], 4, 4)).unwrap();
    assert!(matches!(
        engine.put(&key(1), &[0; 100]),
        Err(Error::InvalidBlockSize)
    ));
    assert!(engine.is_empty());
}

#[test]
fn repeated_put_conflicts_and_keeps_the_first_block() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4], 4, 4)).unwrap();
    engine.put(&key(1), &block(1)).unwrap();
    assert!(matches!(
        engine.put(&key(1), &block(2)),
        Err(Error::DataConflict)
    ));
    assert_eq!(engine.get(&key(1)).unwrap(), block(1));
    assert_eq!(engine.len(), 1);
}

#[test]
fn fills_to_capacity_across_storages_then_overflows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4, 4], 8, 8)).unwrap();
    assert_eq!(engine.cap(), 8);

    for fold in 0..8 {
        engine.put(&key(fold), &block(fold)).unwrap();
    }
    assert_eq!(engine.len(), 8);
    assert!(matches!(
        engine.put(&key(8), &block(8)),
        Err(Error::DataOverflow)
    ));
    for fold in 0..8 {
        assert_eq!(engine.get(&key(fold)).unwrap(), block(fold));
    }
}

#[test]
fn batches_of_seven_fill_the_whole_data_region() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[5, 9], 16, 16)).unwrap();

    let mut batch = Vec::new();
    for fold in 0..engine.cap() {
        batch.push((key(fold), block(fold)));
        if batch.len() == 7 {
            engine.batch_put(&batch).unwrap();
            batch.clear();
        }
    }
    assert!(batch.is_empty());
    assert_eq!(engine.len(), engine.cap());

    for fold in 0..engine.cap() {
        assert_eq!(engine.get(&key(fold)).unwrap(), block(fold));
    }
}

#[test]
fn rejected_batch_reports_every_conflict_and_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[16], 16, 4)).unwrap();

    let batch: Vec<_> = (0..8).map(|fold| (key(fold), block(fold))).collect();
    engine.batch_put(&batch).unwrap();
    let frontier = engine.len();

    // retry without key 3 but with the brand-new key 8
    let mut batch: Vec<_> = batch.into_iter().filter(|(k, _)| *k != key(3)).collect();
    batch.push((key(8), block(8)));

    let Err(Error::Conflict(conflicts)) = engine.batch_put(&batch) else {
        panic!("expected a conflict");
    };
    assert_eq!(conflicts.len(), 7);
    assert!(!conflicts.contains(&key(8)));
    for (batch_key, _) in &batch[..7] {
        assert!(conflicts.contains(batch_key));
    }
    assert!(matches!(engine.get(&key(8)), Err(Error::NotFound)));
    assert_eq!(engine.len(), frontier);
}

#[test]
fn batch_overflowing_a_range_is_fully_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[32], 4, 4)).unwrap();

    // five keys folding into range 0, one more than it can hold
    let batch: Vec<_> = (0..5).map(|i| (key(i * 4), block(i * 4))).collect();
    assert!(matches!(engine.batch_put(&batch), Err(Error::RangeFull)));
    assert!(engine.is_empty());
    for (batch_key, _) in &batch {
        assert!(matches!(engine.get(batch_key), Err(Error::NotFound)));
    }
}

#[test]
fn batches_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4], 4, 4)).unwrap();
    let batch: Vec<_> = (0..1001).map(|fold| (key(fold), block(fold))).collect();
    assert!(matches!(engine.batch_put(&batch), Err(Error::BatchTooLarge)));
    assert!(engine.is_empty());
}

#[test]
fn two_ranges_fill_before_the_region_does() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[32], 4, 4)).unwrap();

    // folds alternating between ranges 0 and 1 until both are saturated
    for i in 0..4 {
        engine.put(&key(i * 4), &block(i * 4)).unwrap();
        engine.put(&key(i * 4 + 1), &block(i * 4 + 1)).unwrap();
    }
    assert!(matches!(
        engine.put(&key(16), &block(16)),
        Err(Error::RangeFull)
    ));
    // the remaining ranges stay writable
    engine.put(&key(2), &block(2)).unwrap();
}

#[test]
fn survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let settings = options(&dir, &[8], 8, 8);
    {
        let engine = Ytfs::open(dir.path(), settings.clone()).unwrap();
        for fold in 0..4 {
            engine.put(&key(fold), &block(fold)).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = Ytfs::open(dir.path(), settings).unwrap();
    assert_eq!(engine.len(), 4);
    for fold in 4..8 {
        engine.put(&key(fold), &block(fold)).unwrap();
    }
    for fold in 0..8 {
        assert_eq!(engine.get(&key(fold)).unwrap(), block(fold));
    }
}

#[test]
fn a_closed_engine_refuses_to_work() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4], 4, 4)).unwrap();
    engine.put(&key(1), &block(1)).unwrap();
    engine.close().unwrap();
    engine.close().unwrap();

    assert!(matches!(engine.get(&key(1)), Err(Error::Closed)));
    assert!(matches!(engine.put(&key(2), &block(2)), Err(Error::Closed)));
    assert!(matches!(engine.reset(), Err(Error::Closed)));
}

#[test]
fn reopening_with_changed_settings_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let settings = options(&dir, &[8], 8, 8);
    Ytfs::open(dir.path(), settings.clone())
        .unwrap()
        .close()
        .unwrap();

    // a doubled block size no longer matches the per-storage block size
    let mut changed = settings.clone();
    changed.data_block_size *= 2;
    assert!(matches!(
        Ytfs::open(dir.path(), changed),
        Err(Error::ConfigD)
    ));

    let mut changed = settings.clone();
    changed.index_table_rows *= 2;
    assert!(matches!(
        Ytfs::open(dir.path(), changed),
        Err(Error::SettingMismatch)
    ));

    let mut changed = settings.clone();
    changed.total_volume *= 2;
    assert!(matches!(
        Ytfs::open(dir.path(), changed),
        Err(Error::SettingMismatch)
    ));

    // appended storages must themselves be well-formed
    let mut changed = settings.clone();
    changed.storages.push(StorageOptions {
        path: dir.path().join("appended.storage"),
        storage_volume: changed.total_volume, // not a multiple of the block size
        data_block_size: BLOCK_SIZE,
    });
    assert!(matches!(
        Ytfs::open(dir.path(), changed),
        Err(Error::ConfigC)
    ));

    let mut changed = settings.clone();
    changed.storages.push(StorageOptions {
        path: dir.path().join("appended.storage"),
        storage_volume: 4 * (BLOCK_SIZE / 2) as u64,
        data_block_size: BLOCK_SIZE / 2,
    });
    assert!(matches!(
        Ytfs::open(dir.path(), changed),
        Err(Error::ConfigD)
    ));

    // the unchanged settings still open
    Ytfs::open(dir.path(), settings).unwrap();
}

#[test]
fn appending_a_storage_grows_the_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let settings = options(&dir, &[4], 16, 16);
    {
        let engine = Ytfs::open(dir.path(), settings.clone()).unwrap();
        for fold in 0..4 {
            engine.put(&key(fold), &block(fold)).unwrap();
        }
        assert!(matches!(
            engine.put(&key(4), &block(4)),
            Err(Error::DataOverflow)
        ));
        engine.close().unwrap();
    }

    let mut grown = settings;
    grown.storages.push(StorageOptions {
        path: dir.path().join("appended.storage"),
        storage_volume: 4 * BLOCK_SIZE as u64,
        data_block_size: BLOCK_SIZE,
    });
    let engine = Ytfs::open(dir.path(), grown).unwrap();
    assert_eq!(engine.cap(), 8);
    assert_eq!(engine.len(), 4);

    for fold in 4..8 {
        engine.put(&key(fold), &block(fold)).unwrap();
    }
    assert!(matches!(
        engine.put(&key(8), &block(8)),
        Err(Error::DataOverflow)
    ));
    for fold in 0..8 {
        assert_eq!(engine.get(&key(fold)).unwrap(), block(fold));
    }
}

#[test]
fn concurrent_puts_of_the_same_key_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[8], 8, 8)).unwrap();
    let payload = block(1);

    let results = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| engine.put(&key(1), &payload)))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|result| matches!(result, Err(Error::DataConflict)))
            .count(),
        7
    );
    assert_eq!(engine.get(&key(1)).unwrap(), payload);
}

#[test]
fn concurrent_puts_of_distinct_keys_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[8], 8, 8)).unwrap();

    let engine = &engine;
    thread::scope(|scope| {
        for fold in 0..8 {
            scope.spawn(move || engine.put(&key(fold), &block(fold)).unwrap());
        }
    });

    assert_eq!(engine.len(), 8);
    for fold in 0..8 {
        assert_eq!(engine.get(&key(fold)).unwrap(), block(fold));
    }
}

#[test]
fn reset_is_a_quick_format() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4], 4, 4)).unwrap();
    engine.put(&key(1), &block(1)).unwrap();
    engine.put(&key(2), &block(2)).unwrap();

    engine.reset().unwrap();
    assert!(engine.is_empty());
    assert!(matches!(engine.get(&key(1)), Err(Error::NotFound)));

    // the formatted engine starts over at slot zero
    engine.put(&key(1), &block(3)).unwrap();
    assert_eq!(engine.get(&key(1)).unwrap(), block(3));
    assert_eq!(engine.len(), 1);
}

#[test]
fn refuses_a_path_that_is_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("occupied");
    fs::write(&path, b"not a directory").unwrap();
    assert!(matches!(
        Ytfs::open(&path, options(&dir, &[4], 4, 4)),
        Err(Error::DirNameConflict)
    ));
}

#[test]
fn meta_mirrors_the_settings() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Ytfs::open(dir.path(), options(&dir, &[4], 4, 8)).unwrap();
    engine.put(&key(1), &block(1)).unwrap();

    let meta = engine.meta();
    assert_eq!(meta.ytfs_capability.get(), 4);
    assert_eq!(meta.data_block_size.get(), BLOCK_SIZE);
    assert_eq!(meta.range_capacity.get(), 4);
    assert_eq!(meta.range_coverage.get(), 8);
    assert_eq!(meta.data_end_point.get(), 1);
    assert_eq!(engine.total_size(), 4 * BLOCK_SIZE as u64);
    assert!(engine.to_string().contains("data_end_point"));

    // the sentinel marker exists once the directory is open
    assert!(dir.path().join("dbsafe").exists());
}
