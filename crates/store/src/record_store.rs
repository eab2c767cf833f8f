/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! A sharded collection of record files addressed by integer index or by
//! salted-hashed key. Integer key `k` lives in chunk `k / capacity` at
//! slot `k % capacity`; named keys are resolved through the append-only
//! `keys` file, replayed into memory on open (last write wins).

use crate::{
    HASH_LEN, Progress, ProgressFn, RecordFile, RecordFileOptions, Rekey,
    crypto::{derive_key, encryption_id, salted_hash},
    record_file::io_error,
};
use ahash::AHashMap;
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use utils::{
    U32_LEN,
    codec::{Deserialize, Serialize},
};

const DEFAULT_SALT: &[u8] = b"Symbolic Showmanship";

pub struct RecordStoreConfig {
    pub salt: Vec<u8>,
    /// Compression threshold; defaults to half the estimated record size.
    pub compress: Option<usize>,
    /// Create chunks on demand for writes at arbitrary indexes.
    pub sparse: bool,
    pub aes_key: Option<Vec<u8>>,
    pub est_rec_size: usize,
    pub target_file_size: usize,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        RecordStoreConfig {
            salt: Vec::new(),
            compress: None,
            sparse: false,
            aes_key: None,
            est_rec_size: 1024,
            target_file_size: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct RecordStore {
    workdir: PathBuf,
    store_id: String,
    prefix: Vec<u8>,
    salt: Vec<u8>,
    /// Store-derived key; chunks derive their own data keys from it.
    chunk_key: Option<Vec<u8>>,
    chunk_records: usize,
    compress: usize,
    sparse: bool,
    chunks: AHashMap<usize, RecordFile>,
    keys: AHashMap<[u8; HASH_LEN], (u64, u32)>,
    keys_file: File,
    keys_path: PathBuf,
    next_idx: u32,
    loaded: u64,
}

impl RecordStore {
    pub fn open(
        workdir: impl AsRef<Path>,
        store_id: &str,
        config: RecordStoreConfig,
    ) -> trc::Result<Self> {
        let workdir = workdir.as_ref().to_path_buf();
        let salt = if config.salt.is_empty() {
            DEFAULT_SALT.to_vec()
        } else {
            config.salt
        };
        if let Some(aes_key) = &config.aes_key {
            if *aes_key == salt {
                trc::event!(
                    Store(trc::StoreEvent::SaltReuse),
                    Id = store_id.to_string(),
                    Details = "salt and AES key are the same, cannot rekey",
                );
            }
        }

        let mut fp_salt = store_id.as_bytes().to_vec();
        fp_salt.extend_from_slice(&salt);
        let prefix = format!(
            "RecordStore: {store_id}, encrypted={}, ers={}, tfs={}\r\n\r\n",
            encryption_id(&fp_salt, config.aes_key.as_deref()),
            config.est_rec_size,
            config.target_file_size,
        )
        .into_bytes();

        if !workdir.exists() {
            create_workdir(&workdir)?;
        }

        let keys_path = workdir.join("keys");
        if !keys_path.exists() {
            File::create(&keys_path)
                .and_then(|mut fd| fd.write_all(&prefix))
                .map_err(|err| io_error(err, &keys_path))?;
        }
        let mut keys_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&keys_path)
            .map_err(|err| io_error(err, &keys_path))?;
        let mut head = vec![0u8; prefix.len()];
        if keys_file.read_exact(&mut head).is_err() || head != prefix {
            return Err(trc::StoreEvent::ConfigMismatch
                .caused_by(trc::location!())
                .ctx(trc::Key::Path, keys_path.display().to_string())
                .details("keys file prefix does not match store parameters"));
        }
        keys_file
            .seek(SeekFrom::End(0))
            .map_err(|err| io_error(err, &keys_path))?;

        let chunk_records = 1000 * (config.target_file_size / (1000 * config.est_rec_size));
        if chunk_records == 0 {
            return Err(trc::StoreEvent::ConfigMismatch
                .caused_by(trc::location!())
                .ctx(trc::Key::Id, store_id.to_string())
                .details("target file size too small for the estimated record size"));
        }

        let mut store = RecordStore {
            chunk_key: config
                .aes_key
                .as_deref()
                .map(|key| derive_key(&prefix, key).to_vec()),
            chunk_records,
            compress: config.compress.unwrap_or(config.est_rec_size / 2),
            sparse: config.sparse,
            store_id: store_id.to_string(),
            chunks: AHashMap::new(),
            keys: AHashMap::new(),
            next_idx: 0,
            loaded: 0,
            workdir,
            prefix,
            salt,
            keys_file,
            keys_path,
        };
        store.load_keys()?;
        store.next_idx = store.calculate_next_idx()?;
        store.loaded = store.modified_time();
        Ok(store)
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn chunk_records(&self) -> usize {
        self.chunk_records
    }

    /// Next integer index; also the number of appended records.
    pub fn len(&self) -> u32 {
        self.next_idx
    }

    pub fn is_empty(&self) -> bool {
        self.next_idx == 0
    }

    pub fn hash_key(&self, key: &str) -> trc::Result<[u8; HASH_LEN]> {
        Ok(salted_hash(&self.salt, &key.serialize()?))
    }

    /// In-memory lookup of an already-hashed key, for callers that need
    /// the hash for other purposes too.
    pub fn lookup_hashed(&self, hashed: &[u8; HASH_LEN]) -> Option<u32> {
        self.keys.get(hashed).map(|(_, idx)| *idx)
    }

    pub fn key_to_index(&self, key: &str) -> trc::Result<u32> {
        self.hash_key(key).and_then(|hashed| {
            self.lookup_hashed(&hashed).ok_or_else(|| {
                trc::StoreEvent::NotFound
                    .caused_by(trc::location!())
                    .ctx(trc::Key::Key, key.to_string())
            })
        })
    }

    fn load_keys(&mut self) -> trc::Result<()> {
        let rec_size = U32_LEN + HASH_LEN;
        let mut data = Vec::new();
        self.keys_file
            .seek(SeekFrom::Start(self.prefix.len() as u64))
            .and_then(|_| self.keys_file.read_to_end(&mut data))
            .map_err(|err| io_error(err, &self.keys_path))?;
        let mut pos = 0;
        let mut file_ofs = self.prefix.len() as u64;
        while pos + rec_size <= data.len() {
            let idx = u32::from_le_bytes(data[pos..pos + U32_LEN].try_into().unwrap());
            let hashed: [u8; HASH_LEN] = data[pos + U32_LEN..pos + rec_size].try_into().unwrap();
            if hashed != [0u8; HASH_LEN] {
                self.keys.insert(hashed, (file_ofs, idx));
            }
            pos += rec_size;
            file_ofs += rec_size as u64;
        }
        Ok(())
    }

    fn chunk_files(&self) -> trc::Result<Vec<(usize, PathBuf)>> {
        let mut chunks = Vec::new();
        let entries = fs::read_dir(&self.workdir).map_err(|err| io_error(err, &self.workdir))?;
        for entry in entries {
            let entry = entry.map_err(|err| io_error(err, &self.workdir))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(number) = name.strip_prefix("chunk-") {
                if let Ok(number) = number.parse::<usize>() {
                    chunks.push((number, entry.path()));
                }
            }
        }
        Ok(chunks)
    }

    fn modified_time(&self) -> u64 {
        let mut latest = 0;
        let mut paths = vec![self.keys_path.clone()];
        if let Ok(chunks) = self.chunk_files() {
            paths.extend(chunks.into_iter().map(|(_, path)| path));
        }
        for path in paths {
            if let Ok(mtime) = fs::metadata(&path).and_then(|meta| meta.modified()) {
                if let Ok(elapsed) = mtime.duration_since(UNIX_EPOCH) {
                    latest = latest.max(elapsed.as_nanos() as u64);
                }
            }
        }
        latest
    }

    fn calculate_next_idx(&mut self) -> trc::Result<u32> {
        let max_chunk = self
            .chunk_files()?
            .into_iter()
            .map(|(number, _)| number)
            .max();
        match max_chunk {
            Some(number) => {
                let base = number * self.chunk_records;
                let chunk = self.chunk(base as u32 + 1, false)?.1;
                Ok((base + chunk.len()) as u32)
            }
            None => Ok(0),
        }
    }

    fn chunk(&mut self, idx: u32, create: bool) -> trc::Result<(usize, &mut RecordFile)> {
        let number = idx as usize / self.chunk_records;
        if !self.chunks.contains_key(&number) {
            let path = self.workdir.join(format!("chunk-{number}"));
            let existed = path.exists();
            let chunk = RecordFile::open(
                &path,
                &format!("RecordStore({}), chunk {number}", self.store_id),
                self.chunk_records,
                RecordFileOptions {
                    compress: self.compress,
                    aes_key: self.chunk_key.clone(),
                    create,
                    ..RecordFileOptions::default()
                },
            )?;
            if !existed {
                trc::event!(
                    Store(trc::StoreEvent::ChunkCreated),
                    Id = self.store_id.clone(),
                    Index = number,
                );
            }
            self.chunks.insert(number, chunk);
        }
        Ok((
            idx as usize % self.chunk_records,
            self.chunks.get_mut(&number).unwrap(),
        ))
    }

    pub fn contains_index(&mut self, idx: u32) -> bool {
        self.chunk(idx, false)
            .map(|(slot, chunk)| chunk.contains(slot))
            .unwrap_or(false)
    }

    pub fn contains_key(&mut self, key: &str) -> bool {
        self.key_to_index(key)
            .map(|idx| self.contains_index(idx))
            .unwrap_or(false)
    }

    pub fn length(&mut self, idx: u32) -> trc::Result<usize> {
        let (slot, chunk) = self.chunk(idx, false)?;
        chunk.length(slot)
    }

    pub fn get<T: Deserialize>(&mut self, idx: u32) -> trc::Result<Option<T>> {
        match self.chunk(idx, false) {
            Ok((slot, chunk)) => chunk.get(slot),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get_by_key<T: Deserialize>(&mut self, key: &str) -> trc::Result<Option<T>> {
        match self.key_to_index(key) {
            Ok(idx) => self.get(idx),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Writes a record at an integer index. In sparse stores the target
    /// chunk is created on demand.
    pub fn set<T: Serialize + ?Sized>(&mut self, idx: u32, value: &T) -> trc::Result<u32> {
        let sparse = self.sparse;
        let (slot, chunk) = self.chunk(idx, sparse)?;
        chunk.set(slot, value)?;
        if idx >= self.next_idx {
            self.next_idx = idx + 1;
        }
        Ok(idx)
    }

    /// Writes a record under a named key: overwrites in place when the key
    /// is already mapped, appends a fresh record otherwise.
    pub fn set_with_key<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
    ) -> trc::Result<u32> {
        match self.key_to_index(key) {
            Ok(idx) => self.set(idx, value),
            Err(err) if err.is_not_found() => self.append(value, &[key]),
            Err(err) => Err(err),
        }
    }

    /// Appends a record at the next free index, registering any named keys
    /// for it. Returns the assigned index.
    pub fn append<T: Serialize + ?Sized>(&mut self, value: &T, keys: &[&str]) -> trc::Result<u32> {
        let idx = self.next_idx;
        let (slot, chunk) = self.chunk(idx, true)?;
        chunk.set(slot, value)?;
        self.next_idx = idx + 1;
        for key in keys {
            self.set_key(key, idx)?;
        }
        Ok(idx)
    }

    /// Appends a `(hashed key, index)` row; the in-memory map is updated so
    /// replay order keeps last-write-wins semantics.
    pub fn set_key(&mut self, key: &str, idx: u32) -> trc::Result<()> {
        let hashed = self.hash_key(key)?;
        let ofs = self
            .keys_file
            .seek(SeekFrom::End(0))
            .map_err(|err| io_error(err, &self.keys_path))?;
        let mut row = Vec::with_capacity(U32_LEN + HASH_LEN);
        row.extend_from_slice(&idx.to_le_bytes());
        row.extend_from_slice(&hashed);
        self.keys_file
            .write_all(&row)
            .map_err(|err| io_error(err, &self.keys_path))?;
        self.keys.insert(hashed, (ofs, idx));
        Ok(())
    }

    /// Deletes the record's slot. Stale key rows are left on disk; they
    /// resolve to an empty slot.
    pub fn delete(&mut self, idx: u32) -> trc::Result<()> {
        let (slot, chunk) = self.chunk(idx, false)?;
        chunk.delete(slot)
    }

    pub fn delete_by_key(&mut self, key: &str) -> trc::Result<()> {
        let idx = self.key_to_index(key)?;
        self.delete(idx)
    }

    pub fn flush(&mut self) -> trc::Result<()> {
        for chunk in self.chunks.values_mut() {
            chunk.flush()?;
        }
        self.chunks.clear();
        Ok(())
    }

    /// Drops caches and reloads the key map when any chunk or the keys
    /// file changed on disk. Used by read-only peers.
    pub fn refresh(&mut self) -> trc::Result<()> {
        let modified = self.modified_time();
        if modified != self.loaded {
            self.chunks.clear();
            self.keys.clear();
            self.load_keys()?;
            self.next_idx = self.calculate_next_idx()?;
            self.loaded = modified;
        }
        Ok(())
    }

    /// Recompacts every chunk, optionally under a new master key.
    pub fn compact(&mut self, rekey: Rekey, force: bool) -> trc::Result<()> {
        self.compact_with(rekey, force, &mut |_| true)
    }

    pub fn compact_with(
        &mut self,
        rekey: Rekey,
        force: bool,
        progress: ProgressFn<'_>,
    ) -> trc::Result<()> {
        let chunk_rekey = match &rekey {
            Rekey::Keep => Rekey::Keep,
            Rekey::Plain => Rekey::Plain,
            Rekey::Key(master) => {
                // Chunks are keyed off the store-level derived key; compute
                // the replacement from the new master and the new prefix.
                let new_prefix = self.rekeyed_prefix(Some(master));
                Rekey::Key(derive_key(&new_prefix, master).to_vec())
            }
        };

        let mut numbers: Vec<usize> = self
            .chunk_files()?
            .into_iter()
            .map(|(number, _)| number)
            .collect();
        numbers.sort_unstable();
        let total_chunks = numbers.len().max(1);
        for (chunk_no, number) in numbers.into_iter().enumerate() {
            self.chunk((number * self.chunk_records) as u32, false)?;
            let chunk = self.chunks.remove(&number).unwrap();
            let mut chunk_progress = |p: Progress| {
                progress(Progress {
                    chunk: chunk_no,
                    done: p.done,
                    total: p.total * total_chunks,
                })
            };
            let chunk = chunk.compact(
                chunk_rekey.clone(),
                None,
                None,
                force,
                Some(&mut chunk_progress),
            )?;
            self.chunks.insert(number, chunk);
        }

        if let Rekey::Key(_) | Rekey::Plain = rekey {
            self.rewrite_keys_prefix(&rekey)?;
        }
        Ok(())
    }

    fn rekeyed_prefix(&self, master: Option<&[u8]>) -> Vec<u8> {
        let mut fp_salt = self.store_id.as_bytes().to_vec();
        fp_salt.extend_from_slice(&self.salt);
        let (ers, tfs) = self.prefix_sizes();
        format!(
            "RecordStore: {}, encrypted={}, ers={ers}, tfs={tfs}\r\n\r\n",
            self.store_id,
            encryption_id(&fp_salt, master),
        )
        .into_bytes()
    }

    fn prefix_sizes(&self) -> (usize, usize) {
        // The prefix embeds est_rec_size and target_file_size; parse them
        // back out rather than carrying extra fields around.
        let text = String::from_utf8_lossy(&self.prefix);
        let mut ers = 0;
        let mut tfs = 0;
        for part in text.trim_end().split(", ") {
            if let Some(value) = part.strip_prefix("ers=") {
                ers = value.parse().unwrap_or(0);
            } else if let Some(value) = part.strip_prefix("tfs=") {
                tfs = value.parse().unwrap_or(0);
            }
        }
        (ers, tfs)
    }

    /// After a re-key the keys file prefix must bind the new fingerprint;
    /// the key rows themselves are key-independent and are copied over.
    fn rewrite_keys_prefix(&mut self, rekey: &Rekey) -> trc::Result<()> {
        let master = match rekey {
            Rekey::Key(master) => Some(master.as_slice()),
            _ => None,
        };
        let new_prefix = self.rekeyed_prefix(master);
        let mut rows = Vec::new();
        self.keys_file
            .seek(SeekFrom::Start(self.prefix.len() as u64))
            .and_then(|_| self.keys_file.read_to_end(&mut rows))
            .map_err(|err| io_error(err, &self.keys_path))?;

        let tmp = self.keys_path.with_extension("tmp");
        File::create(&tmp)
            .and_then(|mut fd| {
                fd.write_all(&new_prefix)?;
                fd.write_all(&rows)
            })
            .map_err(|err| io_error(err, &tmp))?;
        fs::rename(&tmp, &self.keys_path).map_err(|err| io_error(err, &self.keys_path))?;

        self.prefix = new_prefix;
        self.chunk_key = master.map(|key| derive_key(&self.prefix, key).to_vec());
        self.keys_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.keys_path)
            .map_err(|err| io_error(err, &self.keys_path))?;
        self.keys_file
            .seek(SeekFrom::End(0))
            .map_err(|err| io_error(err, &self.keys_path))?;
        Ok(())
    }

    /// Destructive wipe used by tests; requires the exact confirmation
    /// pattern.
    pub fn delete_everything(&mut self, c1: bool, c2: bool, c3: bool) -> trc::Result<()> {
        if !(c1 && !c2 && c3) {
            return Err(trc::StoreEvent::UnexpectedError
                .caused_by(trc::location!())
                .details("refusing to delete everything without confirmation"));
        }
        self.chunks.clear();
        self.keys.clear();
        self.next_idx = 0;
        for (_, path) in self.chunk_files()? {
            fs::remove_file(&path).map_err(|err| io_error(err, &path))?;
        }
        if self.keys_path.exists() {
            fs::remove_file(&self.keys_path).map_err(|err| io_error(err, &self.keys_path))?;
        }
        Ok(())
    }
}

/// A read-only peer over the same directory; writers must assume single
/// process write access.
pub struct RecordStoreReadOnly {
    inner: RecordStore,
}

impl RecordStoreReadOnly {
    pub fn open(
        workdir: impl AsRef<Path>,
        store_id: &str,
        config: RecordStoreConfig,
    ) -> trc::Result<Self> {
        RecordStore::open(workdir, store_id, config).map(|inner| RecordStoreReadOnly { inner })
    }

    pub fn len(&self) -> u32 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn key_to_index(&self, key: &str) -> trc::Result<u32> {
        self.inner.key_to_index(key)
    }

    pub fn contains_key(&mut self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn get<T: Deserialize>(&mut self, idx: u32) -> trc::Result<Option<T>> {
        self.inner.get(idx)
    }

    pub fn get_by_key<T: Deserialize>(&mut self, key: &str) -> trc::Result<Option<T>> {
        self.inner.get_by_key(key)
    }

    pub fn refresh(&mut self) -> trc::Result<()> {
        self.inner.refresh()
    }
}

fn create_workdir(workdir: &Path) -> trc::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(workdir)
            .map_err(|err| io_error(err, workdir))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(workdir).map_err(|err| io_error(err, workdir))
    }
}
