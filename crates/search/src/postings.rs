/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! A posting-list bucket: an unsorted concatenation of
//! `(u32 keyword_len, u32 payload_len, keyword, serialized IntSet)`
//! entries sharing one record. Low-frequency keywords land here, in the
//! bucket their hash selects.

use crate::intset::IntSet;
use utils::{
    U32_LEN,
    codec::{Deserialize, dumb::unwrap_compressed},
};

const ENTRY_HEADER: usize = U32_LEN * 2;

#[derive(Debug, Default)]
pub struct PostingListBucket {
    pub blob: Vec<u8>,
    /// Tombstones subtracted from every posting list written back.
    pub deleted: Option<IntSet>,
}

struct Entry<'x> {
    keyword: &'x [u8],
    payload: &'x [u8],
    raw: &'x [u8],
}

impl PostingListBucket {
    pub fn new(blob: Vec<u8>) -> Self {
        PostingListBucket {
            blob,
            deleted: None,
        }
    }

    fn entries(&self) -> trc::Result<Vec<Entry<'_>>> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < self.blob.len() {
            let header = self.blob.get(pos..pos + ENTRY_HEADER).ok_or_else(corrupt)?;
            let kw_len =
                u32::from_le_bytes(header[..U32_LEN].try_into().unwrap()) as usize;
            let payload_len =
                u32::from_le_bytes(header[U32_LEN..].try_into().unwrap()) as usize;
            let end = pos + ENTRY_HEADER + kw_len + payload_len;
            let raw = self.blob.get(pos..end).ok_or_else(corrupt)?;
            entries.push(Entry {
                keyword: &raw[ENTRY_HEADER..ENTRY_HEADER + kw_len],
                payload: &raw[ENTRY_HEADER + kw_len..],
                raw,
            });
            pos = end;
        }
        Ok(entries)
    }

    pub fn keywords(&self) -> trc::Result<Vec<Vec<u8>>> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|entry| entry.keyword.to_vec())
            .collect())
    }

    pub fn get(&self, keyword: &str) -> trc::Result<Option<IntSet>> {
        for entry in self.entries()? {
            if entry.keyword == keyword.as_bytes() {
                let payload = unwrap_compressed(entry.payload)?;
                return IntSet::deserialize(&payload).map(Some);
            }
        }
        Ok(None)
    }

    /// Merges ids into the keyword's posting list, creating it if new,
    /// and rewrites the blob. Tombstoned ids are subtracted.
    pub fn add(&mut self, keyword: &str, ids: &[u32]) -> trc::Result<()> {
        let mut iset = IntSet::new();
        let mut rebuilt = Vec::with_capacity(self.blob.len());
        for entry in self.entries()? {
            if entry.keyword == keyword.as_bytes() {
                let payload = unwrap_compressed(entry.payload)?;
                iset = IntSet::deserialize(&payload)?;
            } else {
                rebuilt.extend_from_slice(entry.raw);
            }
        }
        iset.extend(ids.iter().copied());
        if let Some(deleted) = &self.deleted {
            iset -= deleted;
        }
        let payload = utils::codec::Serialize::serialize(&iset)?;
        rebuilt.extend_from_slice(&(keyword.len() as u32).to_le_bytes());
        rebuilt.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        rebuilt.extend_from_slice(keyword.as_bytes());
        rebuilt.extend_from_slice(&payload);
        self.blob = rebuilt;
        Ok(())
    }

    /// Drops a keyword's posting list from the bucket.
    pub fn remove(&mut self, keyword: &str) -> trc::Result<()> {
        let mut rebuilt = Vec::with_capacity(self.blob.len());
        for entry in self.entries()? {
            if entry.keyword != keyword.as_bytes() {
                rebuilt.extend_from_slice(entry.raw);
            }
        }
        self.blob = rebuilt;
        Ok(())
    }
}

fn corrupt() -> trc::Error {
    trc::StoreEvent::DataCorruption
        .caused_by(trc::location!())
        .details("malformed posting list bucket")
}
