/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::TempDir;
use std::{fs, io::Write};
use store::{RecordFile, RecordFileOptions, RecordStore, RecordStoreConfig, RecordStoreReadOnly};
use utils::codec::dumb::Value;

fn create() -> RecordFileOptions {
    RecordFileOptions {
        create: true,
        ..RecordFileOptions::default()
    }
}

fn store_config() -> RecordStoreConfig {
    RecordStoreConfig {
        est_rec_size: 1024,
        target_file_size: 1_048_576,
        ..RecordStoreConfig::default()
    }
}

#[test]
fn record_file_slots() {
    let dir = TempDir::new("record-file-slots", true);
    let path = dir.path.join("testing");
    let mut rf = RecordFile::open(&path, "test", 128, create()).unwrap();
    assert_eq!(rf.len(), 0);

    rf.set(0, &"hello1").unwrap();
    assert_eq!(rf.len(), 1);
    rf.set(1, &"hello2").unwrap();
    assert_eq!(rf.len(), 2);
    rf.set(2, &Value::Int(43)).unwrap();
    assert_eq!(rf.len(), 3);

    // Slot stability: the second write wins, slots keep their numbers.
    rf.set(0, &"hello world").unwrap();
    rf.set(1, &"shrt").unwrap();
    assert_eq!(rf.get::<String>(0).unwrap().unwrap(), "hello world");
    assert_eq!(rf.get::<String>(1).unwrap().unwrap(), "shrt");
    assert_eq!(rf.get::<Value>(2).unwrap().unwrap(), Value::Int(43));

    // A shrinking overwrite stays in place.
    let len_before = fs::metadata(&path).unwrap().len();
    rf.set(1, &"sh").unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
    assert_eq!(rf.get::<String>(1).unwrap().unwrap(), "sh");

    // Deleting clears the slot but not the file length accounting.
    rf.delete(0).unwrap();
    assert_eq!(rf.len(), 3);
    assert!(!rf.contains(0));
    assert!(rf.get::<String>(0).unwrap().is_none());
    rf.set(0, &"I am back again".to_string()).unwrap();
    assert!(rf.contains(0));

    // Mismatched type tags are corruption, not coercion.
    assert!(rf.get::<String>(2).is_err());

    // append_into always writes at EOF, even when the value would fit.
    let len_before = fs::metadata(&path).unwrap().len();
    rf.append_into(1, &"x").unwrap();
    assert!(fs::metadata(&path).unwrap().len() > len_before);
    assert_eq!(rf.get::<String>(1).unwrap().unwrap(), "x");

    dir.delete();
}

#[test]
fn record_file_self_offsets() {
    let dir = TempDir::new("record-file-offsets", true);
    let path = dir.path.join("testing");
    let capacity = 32usize;
    let mut rf = RecordFile::open(&path, "offsets", capacity, create()).unwrap();
    for slot in 0..10 {
        rf.set(slot, &format!("value-{slot}")).unwrap();
    }
    rf.set(3, &"replaced with something much longer than before".to_string())
        .unwrap();
    rf.flush().unwrap();
    drop(rf);

    // Every nonzero offset points at a record whose self-offset field
    // equals that offset.
    let bytes = fs::read(&path).unwrap();
    let prefix = format!("RecordFile: offsets, cr={capacity}, encrypted=no\r\n\r\n");
    assert!(bytes.starts_with(prefix.as_bytes()));
    let mut seen = 0;
    for slot in 0..capacity {
        let pos = prefix.len() + slot * 4;
        let ofs = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        if ofs > 0 {
            let stored = u32::from_le_bytes(bytes[ofs..ofs + 4].try_into().unwrap()) as usize;
            assert_eq!(stored, ofs);
            seen += 1;
        }
    }
    assert_eq!(seen, 10);
    dir.delete();
}

#[test]
fn record_file_crash_recovery() {
    let dir = TempDir::new("record-file-crash", true);
    let path = dir.path.join("testing");
    let mut rf = RecordFile::open(&path, "crash", 16, create()).unwrap();
    rf.set(0, &"stable").unwrap();
    rf.flush().unwrap();
    drop(rf);
    let expected_len = fs::metadata(&path).unwrap().len();

    // A torn append leaves the file longer than the expected-EOF word;
    // the open truncates it back.
    let mut fd = fs::OpenOptions::new().append(true).open(&path).unwrap();
    fd.write_all(b"torn garbage from a crash").unwrap();
    drop(fd);
    assert!(fs::metadata(&path).unwrap().len() > expected_len);
    let rf = RecordFile::open(&path, "crash", 16, RecordFileOptions::default()).unwrap();
    assert_eq!(rf.get::<String>(0).unwrap().unwrap(), "stable");
    drop(rf);
    assert_eq!(fs::metadata(&path).unwrap().len(), expected_len);

    // A file shorter than the expected-EOF word cannot be used.
    let fd = fs::OpenOptions::new().write(true).open(&path).unwrap();
    fd.set_len(expected_len - 1).unwrap();
    drop(fd);
    let err = RecordFile::open(&path, "crash", 16, RecordFileOptions::default()).unwrap_err();
    assert!(err.matches(trc::StoreEvent::DataCorruption), "{err}");
    dir.delete();
}

#[test]
fn record_file_encryption() {
    let dir = TempDir::new("record-file-aes", true);
    let path = dir.path.join("testing");
    let key = b"1234123412341234".to_vec();
    let mut rf = RecordFile::open(
        &path,
        "sealed",
        16,
        RecordFileOptions {
            aes_key: Some(key.clone()),
            create: true,
            ..RecordFileOptions::default()
        },
    )
    .unwrap();
    rf.set(0, &"sekrit payload").unwrap();
    assert_eq!(rf.get::<String>(0).unwrap().unwrap(), "sekrit payload");
    rf.flush().unwrap();
    drop(rf);

    let bytes = fs::read(&path).unwrap();
    assert!(
        !bytes
            .windows(b"sekrit payload".len())
            .any(|w| w == b"sekrit payload"),
        "plaintext leaked to disk"
    );

    // Wrong key: the fingerprint in the prefix fails fast.
    let err = RecordFile::open(
        &path,
        "sealed",
        16,
        RecordFileOptions {
            aes_key: Some(b"4321432143214321".to_vec()),
            ..RecordFileOptions::default()
        },
    )
    .unwrap_err();
    assert!(err.matches(trc::StoreEvent::ConfigMismatch), "{err}");

    // No key at all: same.
    let err = RecordFile::open(&path, "sealed", 16, RecordFileOptions::default()).unwrap_err();
    assert!(err.matches(trc::StoreEvent::ConfigMismatch), "{err}");
    dir.delete();
}

#[test]
fn record_store_append_contract() {
    let dir = TempDir::new("record-store-append", true);
    let mut rs = RecordStore::open(dir.path.join("rs"), "testing", store_config()).unwrap();
    assert_eq!(rs.chunk_records(), 1000);
    assert_eq!(rs.hash_key("hello").unwrap().len(), 32);
    assert!(rs.key_to_index("hello").unwrap_err().is_not_found());
    assert_eq!(rs.len(), 0);

    rs.set_with_key("hello", &"world").unwrap();
    assert_eq!(rs.get_by_key::<String>("hello").unwrap().unwrap(), "world");
    assert_eq!(rs.len(), 1);

    let before = rs.len();
    let idx = rs.append(&"ohai", &["greeting"]).unwrap();
    assert_eq!(rs.len(), before + 1);
    assert_eq!(rs.get::<String>(idx).unwrap().unwrap(), "ohai");
    assert_eq!(rs.get_by_key::<String>("greeting").unwrap().unwrap(), "ohai");

    // Overwriting under the same key keeps the index.
    rs.set_with_key("hello", &"again").unwrap();
    assert_eq!(rs.key_to_index("hello").unwrap(), 0);
    assert_eq!(rs.get_by_key::<String>("again_missing").unwrap(), None);

    // Large values survive the compression threshold.
    let zeros = vec![0u8; 10240];
    rs.set_with_key("zeros", &zeros.as_slice()).unwrap();
    assert_eq!(rs.get_by_key::<Vec<u8>>("zeros").unwrap().unwrap(), zeros);
    dir.delete();
}

#[test]
fn record_store_chunk_rollover() {
    let dir = TempDir::new("record-store-chunks", true);
    let mut rs = RecordStore::open(dir.path.join("rs"), "testing", store_config()).unwrap();
    for i in 0..2500u32 {
        rs.append(&Value::Int(i as i64), &[]).unwrap();
    }
    assert_eq!(rs.len(), 2500);
    assert_eq!(rs.get::<Value>(1500).unwrap().unwrap(), Value::Int(1500));
    assert_eq!(rs.get::<Value>(2499).unwrap().unwrap(), Value::Int(2499));
    assert!(dir.path.join("rs").join("chunk-2").exists());

    rs.delete(1500).unwrap();
    assert_eq!(rs.get::<Value>(1500).unwrap(), None);
    assert_eq!(rs.len(), 2500);
    drop(rs);

    // Reopening recovers next_idx from the chunk files.
    let rs = RecordStore::open(dir.path.join("rs"), "testing", store_config()).unwrap();
    assert_eq!(rs.len(), 2500);
    dir.delete();
}

#[test]
fn record_store_config_mismatch() {
    let dir = TempDir::new("record-store-mismatch", true);
    let rs = RecordStore::open(dir.path.join("rs"), "testing", store_config()).unwrap();
    drop(rs);
    let err = RecordStore::open(
        dir.path.join("rs"),
        "testing",
        RecordStoreConfig {
            target_file_size: 1_048_577,
            ..store_config()
        },
    )
    .unwrap_err();
    assert!(err.matches(trc::StoreEvent::ConfigMismatch), "{err}");
    dir.delete();
}

#[test]
fn read_only_peer_refreshes() {
    let dir = TempDir::new("record-store-peer", true);
    let mut rs = RecordStore::open(dir.path.join("rs"), "testing", store_config()).unwrap();
    rs.set_with_key("hello", &"world").unwrap();

    let mut peer =
        RecordStoreReadOnly::open(dir.path.join("rs"), "testing", store_config()).unwrap();
    assert_eq!(peer.get_by_key::<String>("hello").unwrap().unwrap(), "world");

    rs.set_with_key("synctest", &"out of sync").unwrap();
    assert!(!peer.contains_key("synctest"));
    peer.refresh().unwrap();
    assert_eq!(
        peer.get_by_key::<String>("synctest").unwrap().unwrap(),
        "out of sync"
    );
    dir.delete();
}
