/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The metadata store: a record store specialised for email metadata,
//! with three dense side columns (timestamp rank, thread id, mtime),
//! dedup by Message-Id and thread assignment on insert.
//!
//! Thread ids are simply the index of the first message seen in the
//! thread; collapsing threads in search results sorts by
//! (thread-id, date) and coalesces runs.

use crate::metadata::Metadata;
use ahash::AHashMap;
use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use store::{IntColumn, RecordStore, RecordStoreConfig, Rekey};
use trc::AddContext;

/// Dividing timestamps by 30 keeps ranks clear of 32-bit rollover.
pub const TS_RESOLUTION: u64 = 30;

const STORE_ID: &str = "metadata";
const COLUMN_FILES: [&str; 3] = ["timestamps", "threads", "mtimes"];

pub struct MetadataStore {
    records: RecordStore,
    workdir: PathBuf,
    rank_by_date: IntColumn,
    thread_ids: IntColumn,
    mtimes: IntColumn,
    thread_cache: AHashMap<u32, Vec<u32>>,
    last_seen: u64,
}

impl MetadataStore {
    pub fn open(workdir: impl AsRef<Path>, aes_key: Option<Vec<u8>>) -> trc::Result<Self> {
        let workdir = workdir.as_ref().to_path_buf();
        let mut records = RecordStore::open(
            &workdir,
            STORE_ID,
            RecordStoreConfig {
                sparse: true,
                compress: Some(400),
                aes_key,
                est_rec_size: 400,
                target_file_size: 64 * 1024 * 1024,
                ..RecordStoreConfig::default()
            },
        )
        .caused_by(trc::location!())?;

        // Index zero is reserved so a zero in the side columns always
        // means "empty"; it holds an internal ghost.
        if !records.contains_index(0) {
            records.set(0, &Metadata::ghost("<internal-ghost-zero@moggie>", None))?;
        }

        Ok(MetadataStore {
            rank_by_date: IntColumn::open(workdir.join(COLUMN_FILES[0]))?,
            thread_ids: IntColumn::open(workdir.join(COLUMN_FILES[1]))?,
            mtimes: IntColumn::open(workdir.join(COLUMN_FILES[2]))?,
            thread_cache: AHashMap::new(),
            last_seen: 0,
            records,
            workdir,
        })
    }

    pub fn len(&self) -> u32 {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&mut self, msgid: &str) -> bool {
        self.records.contains_key(msgid)
    }

    pub fn key_to_index(&self, msgid: &str) -> trc::Result<u32> {
        self.records.key_to_index(msgid)
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    /// Messages with no inferable date get a monotonically-advancing
    /// "last known" time so sort order stays sane.
    fn fill_timestamp(&mut self, metadata: &mut Metadata) {
        if metadata.timestamp == 0 && !metadata.is_ghost() {
            self.last_seen = self.last_seen.max(Self::now());
            metadata.timestamp = self.last_seen;
        } else {
            self.last_seen = self.last_seen.max(metadata.timestamp);
        }
    }

    /// Thread lookup for a freshly-inserted message: inherit the parent's
    /// thread, synthesising a ghost parent when the reply references a
    /// message we have not seen.
    fn assign_thread(&mut self, idx: u32, metadata: &Metadata) -> trc::Result<u32> {
        let Some(in_reply_to) = metadata.in_reply_to().map(str::to_string) else {
            return Ok(idx);
        };
        match self.records.key_to_index(&in_reply_to) {
            Ok(parent_idx) => Ok(self.thread_ids.get(parent_idx).unwrap_or(parent_idx)),
            Err(err) if err.is_not_found() => {
                let mut more = std::collections::BTreeMap::new();
                more.insert(
                    "missing".to_string(),
                    utils::codec::dumb::Value::Bool(true),
                );
                let mut ghost = Metadata::ghost(&in_reply_to, Some(more));
                let parent_idx = self
                    .records
                    .append(&ghost, &[in_reply_to.as_str()])?;
                ghost.idx = parent_idx;
                self.rank(parent_idx, &mut ghost)?;
                trc::event!(
                    Index(trc::IndexEvent::GhostCreated),
                    Id = in_reply_to,
                    Index = parent_idx,
                );
                Ok(self.thread_ids.get(parent_idx).unwrap_or(parent_idx))
            }
            Err(err) => Err(err),
        }
    }

    /// Updates the side columns after a record write. An existing thread
    /// entry is preserved so upgrading a ghost keeps its children's
    /// thread ids intact.
    fn rank(&mut self, idx: u32, metadata: &mut Metadata) -> trc::Result<()> {
        if idx == 0 {
            return Ok(());
        }
        metadata.idx = idx;
        metadata.mtime = Self::now();
        self.mtimes.set(idx, (metadata.mtime / TS_RESOLUTION) as u32)?;
        self.rank_by_date
            .set(idx, ((metadata.timestamp / TS_RESOLUTION) as u32).max(1))?;
        let thread_id = match self.thread_ids.get(idx) {
            Some(existing) => existing,
            None => match metadata.thread_id {
                Some(thread_id) => thread_id,
                None => self.assign_thread(idx, metadata)?,
            },
        };
        metadata.thread_id = Some(thread_id);
        self.thread_ids.set(idx, thread_id)?;
        self.thread_cache.clear();
        Ok(())
    }

    /// Inserts or overwrites under a Message-Id key.
    pub fn set(&mut self, msgid: &str, metadata: &mut Metadata) -> trc::Result<u32> {
        self.fill_timestamp(metadata);
        let idx = self.records.set_with_key(msgid, metadata)?;
        self.rank(idx, metadata)?;
        Ok(idx)
    }

    /// Appends without key dedup; used for messages with no Message-Id.
    pub fn append(&mut self, metadata: &mut Metadata) -> trc::Result<u32> {
        self.fill_timestamp(metadata);
        let keys: Vec<String> = metadata.message_id().map(str::to_string).into_iter().collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let idx = self.records.append(metadata, &key_refs)?;
        self.rank(idx, metadata)?;
        Ok(idx)
    }

    /// Adds new metadata unless its Message-Id is already present.
    pub fn add_if_new(&mut self, mut metadata: Metadata) -> trc::Result<Option<u32>> {
        match metadata.message_id().map(str::to_string) {
            Some(msgid) if self.contains(&msgid) => {
                trc::event!(Index(trc::IndexEvent::Duplicate), Id = msgid);
                Ok(None)
            }
            Some(msgid) => self.set(&msgid, &mut metadata).map(Some),
            None => self.append(&mut metadata).map(Some),
        }
    }

    /// Adds metadata, or merges it into an existing record with the same
    /// Message-Id: union of pointers by container, union of annotations
    /// with new values winning. Returns `(is_new, idx)`.
    pub fn update_or_add(&mut self, mut metadata: Metadata) -> trc::Result<(bool, u32)> {
        let Some(msgid) = metadata.message_id().map(str::to_string) else {
            return self.append(&mut metadata).map(|idx| (true, idx));
        };
        match self.get_by_key(&msgid)? {
            Some(existing) => {
                if existing.is_ghost() && !metadata.is_ghost() {
                    trc::event!(
                        Index(trc::IndexEvent::GhostUpgraded),
                        Id = msgid.clone(),
                        Index = existing.idx,
                    );
                }
                metadata.add_pointers(existing.pointers().iter().cloned());
                for (key, value) in &existing.more {
                    metadata
                        .more
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                self.set(&msgid, &mut metadata).map(|idx| (false, idx))
            }
            None => self.set(&msgid, &mut metadata).map(|idx| (true, idx)),
        }
    }

    /// Fetches by integer index, filling mtime and thread id from the
    /// side columns.
    pub fn get(&mut self, idx: u32) -> trc::Result<Option<Metadata>> {
        match self.records.get::<Metadata>(idx)? {
            Some(mut metadata) => {
                metadata.idx = idx;
                metadata.mtime = self.mtimes.get(idx).map_or(0, |m| m as u64 * TS_RESOLUTION);
                metadata.thread_id = Some(self.thread_ids.get(idx).unwrap_or(idx));
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    pub fn get_by_key(&mut self, msgid: &str) -> trc::Result<Option<Metadata>> {
        match self.records.key_to_index(msgid) {
            Ok(idx) => self.get(idx),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes the record and zeros its side-column entries.
    pub fn delete(&mut self, idx: u32) -> trc::Result<()> {
        self.records.delete(idx)?;
        self.rank_by_date.delete(idx);
        self.thread_ids.delete(idx);
        self.mtimes.delete(idx);
        self.thread_cache.clear();
        trc::event!(Index(trc::IndexEvent::Delete), Index = idx);
        Ok(())
    }

    pub fn delete_by_key(&mut self, msgid: &str) -> trc::Result<()> {
        let idx = self.records.key_to_index(msgid)?;
        self.delete(idx)
    }

    /// All indexes belonging to a thread, cached until the next write.
    pub fn get_thread_idxs(&mut self, thread_id: u32) -> Vec<u32> {
        if let Some(cached) = self.thread_cache.get(&thread_id) {
            return cached.clone();
        }
        let idxs: Vec<u32> = self
            .thread_ids
            .items()
            .filter(|(_, tid)| *tid == thread_id)
            .map(|(idx, _)| idx)
            .collect();
        self.thread_cache.insert(thread_id, idxs.clone());
        idxs
    }

    /// Sort key for stable date ordering: `(rank, idx)`.
    pub fn date_sorting_key(&self, idx: u32) -> (u32, u32) {
        (self.rank_by_date.get(idx).unwrap_or(0), idx)
    }

    /// Sort key for thread grouping: `(thread_id, rank, idx)`.
    pub fn thread_sorting_key(&self, idx: u32) -> (u32, u32, u32) {
        (
            self.thread_ids.get(idx).unwrap_or(idx),
            self.rank_by_date.get(idx).unwrap_or(0),
            idx,
        )
    }

    pub fn flush(&mut self) -> trc::Result<()> {
        self.records.flush()?;
        self.rank_by_date.flush()?;
        self.thread_ids.flush()?;
        self.mtimes.flush()
    }

    pub fn compact(&mut self, rekey: Rekey, force: bool) -> trc::Result<()> {
        self.records.compact(rekey, force)
    }

    pub fn delete_everything(&mut self, c1: bool, c2: bool, c3: bool) -> trc::Result<()> {
        self.records.delete_everything(c1, c2, c3)?;
        for file in COLUMN_FILES {
            IntColumn::remove_file(self.workdir.join(file))?;
        }
        self.thread_cache.clear();
        Ok(())
    }
}
