/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! A fixed-capacity chunk of numbered, optionally-compressed, optionally
//! AES-encrypted variable-length records with an in-file offset index.
//!
//! On-disk layout:
//!
//! ```text
//! RecordFile: <id>, cr=<capacity>, encrypted=<fp>\r\n\r\n
//! <capacity x u32 offsets> <u32 expected-eof> <u64 last-compacted>
//! <records in write order>
//! ```
//!
//! A record is `u32 self-offset, u32 length, payload`. The self-offset
//! must equal the offset-table entry pointing at it; a mismatch marks the
//! slot as corrupt. Payloads may carry leading space padding reserved for
//! in-place overwrites; decoding strips it before the type tag.

use crate::{
    Progress, ProgressFn, RECORD_HEADER_LEN, Rekey,
    crypto::{RecordCipher, encryption_id},
};
use memmap2::MmapMut;
use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use utils::{
    U32_LEN, U64_LEN,
    codec::{
        Deserialize, Serialize,
        dumb::{TAG_DEFLATE, TAG_ENCRYPTED, inflate, maybe_compress},
    },
};

pub struct RecordFileOptions {
    pub compress: usize,
    pub padding: usize,
    pub aes_key: Option<Vec<u8>>,
    pub create: bool,
}

impl Default for RecordFileOptions {
    fn default() -> Self {
        RecordFileOptions {
            compress: 0,
            padding: 16,
            aes_key: None,
            create: false,
        }
    }
}

#[derive(Debug)]
pub struct RecordFile {
    path: PathBuf,
    file_id: String,
    prefix: Vec<u8>,
    capacity: usize,
    compress: usize,
    padding: usize,
    master_key: Option<Vec<u8>>,
    cipher: Option<RecordCipher>,
    file: File,
    map: MmapMut,
    offsets: Vec<u32>,
    header_size: usize,
}

impl RecordFile {
    pub fn open(
        path: impl AsRef<Path>,
        file_id: &str,
        capacity: usize,
        options: RecordFileOptions,
    ) -> trc::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fp = encryption_id(file_id.as_bytes(), options.aes_key.as_deref());
        let prefix =
            format!("RecordFile: {file_id}, cr={capacity}, encrypted={fp}\r\n\r\n").into_bytes();
        let header_size = prefix.len() + capacity * U32_LEN + U32_LEN + U64_LEN;

        if !path.exists() {
            if !options.create {
                return Err(trc::StoreEvent::NotFound
                    .caused_by(trc::location!())
                    .ctx(trc::Key::Path, path.display().to_string()));
            }
            let mut fd = File::create(&path).map_err(|err| io_error(err, &path))?;
            fd.write_all(&prefix)
                .and_then(|_| fd.write_all(&vec![0u8; header_size - prefix.len()]))
                .map_err(|err| io_error(err, &path))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(err, &path))?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|err| io_error(err, &path))?;

        if map.len() < prefix.len() || &map[..prefix.len()] != prefix.as_slice() {
            return Err(trc::StoreEvent::ConfigMismatch
                .caused_by(trc::location!())
                .ctx(trc::Key::Path, path.display().to_string())
                .details("file prefix does not match id, capacity or key"));
        }
        if map.len() < header_size {
            return Err(trc::StoreEvent::DataCorruption
                .caused_by(trc::location!())
                .ctx(trc::Key::Path, path.display().to_string())
                .details("truncated header"));
        }

        // The expected-EOF word is the crash tripwire: a longer file is a
        // torn append and is truncated back; a shorter file is missing
        // acknowledged data and cannot be used.
        let marker_pos = prefix.len() + capacity * U32_LEN;
        let marker = u32::from_le_bytes(map[marker_pos..marker_pos + U32_LEN].try_into().unwrap());
        if marker > 0 {
            if (map.len() as u64) < marker as u64 {
                return Err(trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .ctx(trc::Key::Path, path.display().to_string())
                    .ctx(trc::Key::Expected, marker)
                    .ctx(trc::Key::Found, map.len())
                    .details("file is shorter than its recorded length"));
            } else if (map.len() as u64) > marker as u64 {
                trc::event!(
                    Store(trc::StoreEvent::CrashRecovered),
                    Path = path.display().to_string(),
                    Expected = marker,
                    Found = map.len(),
                );
                drop(map);
                file.set_len(marker as u64)
                    .map_err(|err| io_error(err, &path))?;
                map = unsafe { MmapMut::map_mut(&file) }.map_err(|err| io_error(err, &path))?;
            }
        }

        let mut offsets = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            let pos = prefix.len() + slot * U32_LEN;
            offsets.push(u32::from_le_bytes(
                map[pos..pos + U32_LEN].try_into().unwrap(),
            ));
        }

        Ok(RecordFile {
            cipher: options
                .aes_key
                .as_deref()
                .map(|key| RecordCipher::new(&prefix, key)),
            master_key: options.aes_key,
            file_id: file_id.to_string(),
            compress: options.compress,
            padding: options.padding,
            path,
            prefix,
            capacity,
            file,
            map,
            offsets,
            header_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.offsets.get(slot).is_some_and(|ofs| *ofs > 0)
    }

    /// Index of the highest occupied slot plus one. Stays the same when
    /// interior slots are deleted.
    pub fn len(&self) -> usize {
        self.offsets
            .iter()
            .rposition(|ofs| *ofs > 0)
            .map_or(0, |slot| slot + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_slot(&self, slot: usize) -> trc::Result<()> {
        if slot < self.capacity {
            Ok(())
        } else {
            Err(trc::StoreEvent::NotFound
                .caused_by(trc::location!())
                .ctx(trc::Key::Index, slot)
                .details("slot out of bounds"))
        }
    }

    fn read_u32(&self, pos: usize) -> trc::Result<u32> {
        self.map
            .get(pos..pos + U32_LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| {
                trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .ctx(trc::Key::Path, self.path.display().to_string())
                    .ctx(trc::Key::Index, pos)
            })
    }

    /// Length of the stored record, verifying the self-offset invariant.
    pub fn length(&self, slot: usize) -> trc::Result<usize> {
        self.check_slot(slot)?;
        let ofs = self.offsets[slot] as usize;
        if ofs == 0 {
            return Err(trc::StoreEvent::NotFound
                .caused_by(trc::location!())
                .ctx(trc::Key::Index, slot));
        }
        let self_ofs = self.read_u32(ofs)?;
        if self_ofs as usize != ofs {
            return Err(trc::StoreEvent::DataCorruption
                .caused_by(trc::location!())
                .ctx(trc::Key::Path, self.path.display().to_string())
                .ctx(trc::Key::Index, slot)
                .details("self-offset does not match offset table"));
        }
        Ok(self.read_u32(ofs + U32_LEN)? as usize)
    }

    fn raw_record(&self, slot: usize) -> trc::Result<Option<&[u8]>> {
        self.check_slot(slot)?;
        let ofs = self.offsets[slot] as usize;
        if ofs == 0 {
            return Ok(None);
        }
        let len = self.length(slot)?;
        self.map
            .get(ofs + RECORD_HEADER_LEN..ofs + RECORD_HEADER_LEN + len)
            .map(Some)
            .ok_or_else(|| {
                trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .ctx(trc::Key::Path, self.path.display().to_string())
                    .ctx(trc::Key::Index, slot)
                    .details("record extends past end of file")
            })
    }

    /// Unwraps padding, encryption and compression, yielding the tagged
    /// payload.
    fn plain_payload(&self, raw: &[u8]) -> trc::Result<Vec<u8>> {
        let start = raw.iter().take_while(|byte| **byte == b' ').count();
        let trimmed = &raw[start..];
        let data = if trimmed.first() == Some(&TAG_ENCRYPTED) {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                trc::StoreEvent::NotUnlocked
                    .caused_by(trc::location!())
                    .ctx(trc::Key::Path, self.path.display().to_string())
                    .details("record is encrypted and no key was provided")
            })?;
            cipher.open(trimmed)?
        } else {
            trimmed.to_vec()
        };
        if data.first() == Some(&TAG_DEFLATE) {
            inflate(&data)
        } else {
            Ok(data)
        }
    }

    pub fn get<T: Deserialize>(&self, slot: usize) -> trc::Result<Option<T>> {
        match self.raw_record(slot)? {
            Some(raw) => {
                let payload = self.plain_payload(raw)?;
                T::deserialize(&payload).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, slot: usize, value: &T) -> trc::Result<()> {
        self.write_encoded(slot, value.serialize()?, false)
    }

    /// Writes a record at the end of the append region even when it would
    /// fit its current slot.
    pub fn append_into<T: Serialize + ?Sized>(
        &mut self,
        slot: usize,
        value: &T,
    ) -> trc::Result<()> {
        self.write_encoded(slot, value.serialize()?, true)
    }

    pub(crate) fn write_encoded(
        &mut self,
        slot: usize,
        mut encoded: Vec<u8>,
        force_append: bool,
    ) -> trc::Result<()> {
        self.check_slot(slot)?;
        let ofs = self.offsets[slot] as usize;
        let cur_len = if ofs > 0 { self.length(slot)? } else { 0 };

        // Overwrites raise the threshold to the reserved length so values
        // that already fit are not pointlessly compressed.
        let threshold = if cur_len > 0 && self.compress > 0 {
            self.compress.max(cur_len)
        } else {
            self.compress
        };
        encoded = maybe_compress(encoded, threshold);
        if let Some(cipher) = &self.cipher {
            encoded = cipher.seal(&encoded)?;
        }

        let append = force_append || ofs == 0 || encoded.len() > cur_len;
        let total_len = if append {
            encoded.len() + self.padding
        } else {
            cur_len
        };

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + total_len);
        let record_ofs = if append {
            let end = self
                .file
                .seek(SeekFrom::End(0))
                .map_err(|err| io_error(err, &self.path))?;
            if end + (RECORD_HEADER_LEN + total_len) as u64 > u32::MAX as u64 {
                return Err(trc::StoreEvent::UnexpectedError
                    .caused_by(trc::location!())
                    .ctx(trc::Key::Path, self.path.display().to_string())
                    .details("record file exceeds addressable size"));
            }
            end as usize
        } else {
            ofs
        };
        record.extend_from_slice(&(record_ofs as u32).to_le_bytes());
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.resize(record.len() + (total_len - encoded.len()), b' ');
        record.extend_from_slice(&encoded);

        if append {
            self.file
                .write_all(&record)
                .map_err(|err| io_error(err, &self.path))?;
            self.remap()?;
            let pos = self.prefix.len() + slot * U32_LEN;
            self.map[pos..pos + U32_LEN].copy_from_slice(&(record_ofs as u32).to_le_bytes());
            self.offsets[slot] = record_ofs as u32;
            // Record how long the file is meant to be; a mismatch on the
            // next open means the process died mid-operation.
            let eof = (record_ofs + record.len()) as u32;
            let pos = self.prefix.len() + self.capacity * U32_LEN;
            self.map[pos..pos + U32_LEN].copy_from_slice(&eof.to_le_bytes());
        } else {
            self.map[record_ofs..record_ofs + record.len()].copy_from_slice(&record);
        }
        Ok(())
    }

    /// Clears the offset-table entry. Payload bytes stay behind until the
    /// next compaction.
    pub fn delete(&mut self, slot: usize) -> trc::Result<()> {
        self.check_slot(slot)?;
        let pos = self.prefix.len() + slot * U32_LEN;
        self.map[pos..pos + U32_LEN].copy_from_slice(&0u32.to_le_bytes());
        self.offsets[slot] = 0;
        trc::event!(
            Store(trc::StoreEvent::Deleted),
            Path = self.path.display().to_string(),
            Index = slot,
        );
        Ok(())
    }

    fn remap(&mut self) -> trc::Result<()> {
        self.file.flush().map_err(|err| io_error(err, &self.path))?;
        self.map =
            unsafe { MmapMut::map_mut(&self.file) }.map_err(|err| io_error(err, &self.path))?;
        Ok(())
    }

    pub fn flush(&mut self) -> trc::Result<()> {
        self.map.flush().map_err(|err| io_error(err, &self.path))
    }

    pub fn compacted_time(&self) -> u64 {
        let pos = self.header_size - U64_LEN;
        u64::from_le_bytes(self.map[pos..pos + U64_LEN].try_into().unwrap())
    }

    pub fn mark_compacted(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let pos = self.header_size - U64_LEN;
        self.map[pos..pos + U64_LEN].copy_from_slice(&now.to_le_bytes());
    }

    fn modified_time(&self) -> u64 {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs())
    }

    /// Rewrites the file, reclaiming deleted space and optionally changing
    /// the encryption key. Slot numbers are preserved. Skips the work when
    /// nothing changed since the last compaction and no re-key was asked
    /// for, unless forced.
    pub fn compact(
        self,
        rekey: Rekey,
        padding: Option<usize>,
        target: Option<PathBuf>,
        force: bool,
        mut progress: Option<ProgressFn<'_>>,
    ) -> trc::Result<Self> {
        let tmp = tmp_path(&self.path);
        if tmp.exists() {
            fs::remove_file(&tmp).map_err(|err| io_error(err, &tmp))?;
        }

        if !force
            && rekey == Rekey::Keep
            && padding.is_none()
            && target.is_none()
            && self.modified_time().saturating_sub(self.compacted_time()) < 5
        {
            return Ok(self);
        }

        let master_key = match rekey {
            Rekey::Keep => self.master_key.clone(),
            Rekey::Plain => None,
            Rekey::Key(key) => Some(key),
        };
        let mut compacted = RecordFile::open(
            &tmp,
            &self.file_id,
            self.capacity,
            RecordFileOptions {
                compress: self.compress,
                padding: padding.unwrap_or(self.padding),
                aes_key: master_key.clone(),
                create: true,
            },
        )?;

        for slot in 0..self.capacity {
            if slot % 100 == 0 {
                if let Some(progress) = progress.as_mut() {
                    if !progress(Progress {
                        chunk: 0,
                        done: slot,
                        total: self.capacity,
                    }) {
                        drop(compacted);
                        let _ = fs::remove_file(&tmp);
                        return Err(trc::StoreEvent::Cancelled.caused_by(trc::location!()));
                    }
                }
            }
            let raw = match self.raw_record(slot) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    // Corrupt slots are skipped, not fatal.
                    trc::event!(
                        Store(trc::StoreEvent::DataCorruption),
                        Path = self.path.display().to_string(),
                        Index = slot,
                        Reason = err.to_string(),
                    );
                    continue;
                }
            };
            match self.plain_payload(raw) {
                Ok(payload) => compacted.write_encoded(slot, payload, false)?,
                Err(err) => {
                    trc::event!(
                        Store(trc::StoreEvent::DataCorruption),
                        Path = self.path.display().to_string(),
                        Index = slot,
                        Reason = err.to_string(),
                    );
                }
            }
        }
        compacted.mark_compacted();
        compacted.flush()?;
        drop(compacted);

        let (file_id, capacity, compress, old_padding) =
            (self.file_id, self.capacity, self.compress, self.padding);
        let final_path = match target {
            Some(target) => target,
            None => {
                let path = self.path.clone();
                let old = old_path(&path);
                if old.exists() {
                    fs::remove_file(&old).map_err(|err| io_error(err, &old))?;
                }
                drop(self.map);
                drop(self.file);
                fs::rename(&path, &old).map_err(|err| io_error(err, &path))?;
                path
            }
        };
        fs::rename(&tmp, &final_path).map_err(|err| io_error(err, &final_path))?;

        trc::event!(
            Store(trc::StoreEvent::Compacted),
            Path = final_path.display().to_string(),
        );

        RecordFile::open(
            &final_path,
            &file_id,
            capacity,
            RecordFileOptions {
                compress,
                padding: old_padding,
                aes_key: master_key,
                create: false,
            },
        )
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn old_path(path: &Path) -> PathBuf {
    let mut old = path.as_os_str().to_os_string();
    old.push(".old");
    PathBuf::from(old)
}

pub(crate) fn io_error(err: std::io::Error, path: &Path) -> trc::Error {
    trc::StoreEvent::UnexpectedError
        .caused_by(trc::location!())
        .ctx(trc::Key::Path, path.display().to_string())
        .reason(err)
}
