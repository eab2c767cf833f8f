/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::TempDir;
use std::fs;
use store::{Progress, RecordFile, RecordFileOptions, RecordStore, RecordStoreConfig, Rekey};
use utils::codec::dumb::Value;

fn store_config(aes_key: Option<Vec<u8>>) -> RecordStoreConfig {
    RecordStoreConfig {
        aes_key,
        est_rec_size: 1024,
        target_file_size: 1_048_576,
        ..RecordStoreConfig::default()
    }
}

fn varied_value(i: u32) -> Value {
    match i % 4 {
        0 => Value::Text(format!("record number {i}")),
        1 => Value::Int(i as i64 * 7),
        2 => Value::Bytes(vec![i as u8; 600 + (i as usize % 100)]),
        _ => Value::List(vec![Value::Int(i as i64), Value::Text("x".repeat(i as usize % 64))]),
    }
}

#[test]
fn record_file_compaction_reclaims_space() {
    let dir = TempDir::new("compact-file", true);
    let path = dir.path.join("chunk");
    let mut rf = RecordFile::open(
        &path,
        "compactable",
        64,
        RecordFileOptions {
            create: true,
            ..RecordFileOptions::default()
        },
    )
    .unwrap();
    for slot in 0..64 {
        rf.set(slot, &format!("value {slot} {}", "pad".repeat(20))).unwrap();
    }
    for slot in (0..64).step_by(3) {
        rf.delete(slot).unwrap();
    }
    rf.flush().unwrap();
    let before = fs::metadata(&path).unwrap().len();
    let compacted_before = rf.compacted_time();

    let rf = rf.compact(Rekey::Keep, None, None, true, None).unwrap();
    let after = fs::metadata(&path).unwrap().len();
    assert!(after <= before, "{after} > {before}");
    assert!(rf.compacted_time() > compacted_before);

    for slot in 0..64u32 {
        let value = rf.get::<String>(slot as usize).unwrap();
        if slot % 3 == 0 {
            assert!(value.is_none());
        } else {
            assert_eq!(value.unwrap(), format!("value {slot} {}", "pad".repeat(20)));
        }
    }
    assert!(dir.path.join("chunk.old").exists());
    dir.delete();
}

#[test]
fn record_file_compaction_cancels_cleanly() {
    let dir = TempDir::new("compact-cancel", true);
    let path = dir.path.join("chunk");
    let mut rf = RecordFile::open(
        &path,
        "cancellable",
        512,
        RecordFileOptions {
            create: true,
            ..RecordFileOptions::default()
        },
    )
    .unwrap();
    for slot in 0..512 {
        rf.set(slot, &Value::Int(slot as i64)).unwrap();
    }
    let mut calls = 0;
    let mut cancel = |_: Progress| {
        calls += 1;
        calls < 3
    };
    let err = rf
        .compact(Rekey::Keep, None, None, true, Some(&mut cancel))
        .unwrap_err();
    assert!(err.matches(trc::StoreEvent::Cancelled), "{err}");

    // The original file is intact and the partial target is gone.
    let rf = RecordFile::open(&path, "cancellable", 512, RecordFileOptions::default()).unwrap();
    assert_eq!(rf.get::<Value>(511).unwrap().unwrap(), Value::Int(511));
    assert!(!dir.path.join("chunk.tmp").exists());
    dir.delete();
}

#[test]
fn store_compaction_roundtrip_with_rekey() {
    let dir = TempDir::new("compact-rekey", true);
    let workdir = dir.path.join("rs");
    let key1 = b"1234123412341234".to_vec();
    let key2 = b"4321432143214321".to_vec();

    let count = 2500u32;
    let mut expected = Vec::new();
    {
        let mut rs =
            RecordStore::open(&workdir, "testing", store_config(Some(key1.clone()))).unwrap();
        for i in 0..count {
            let value = varied_value(i);
            rs.append(&value, &[format!("key-{i}").as_str()]).unwrap();
            expected.push(value);
        }
        for i in (0..count).step_by(7) {
            rs.delete(i).unwrap();
        }
        let size_before: u64 = chunk_sizes(&workdir);
        rs.compact(Rekey::Key(key2.clone()), false).unwrap();
        assert!(chunk_sizes(&workdir) <= size_before);
    }

    // Everything reads back under the new key, including hashed keys.
    let mut rs = RecordStore::open(&workdir, "testing", store_config(Some(key2))).unwrap();
    assert_eq!(rs.len(), count);
    for (i, value) in expected.iter().enumerate() {
        let got = rs.get::<Value>(i as u32).unwrap();
        if i % 7 == 0 {
            assert!(got.is_none());
        } else {
            assert_eq!(got.as_ref(), Some(value));
            assert_eq!(rs.key_to_index(&format!("key-{i}")).unwrap(), i as u32);
        }
    }

    // The old key no longer opens the store.
    let err = RecordStore::open(&workdir, "testing", store_config(Some(key1))).unwrap_err();
    assert!(err.matches(trc::StoreEvent::ConfigMismatch), "{err}");
    dir.delete();
}

fn chunk_sizes(workdir: &std::path::Path) -> u64 {
    fs::read_dir(workdir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("chunk-") && !name.contains('.')
        })
        .map(|entry| entry.metadata().unwrap().len())
        .sum()
}
