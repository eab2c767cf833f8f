/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Append-growable memory-mapped arrays of little-endian u32 values,
//! used as dense side columns keyed by record index. A stored zero means
//! "empty"; writers clamp values to at least one.

use crate::record_file::io_error;
use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use utils::U32_LEN;

/// Growth chunk, in slots.
const GROW_SLOTS: usize = 10_000;

pub struct IntColumn {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl IntColumn {
    pub fn open(path: impl AsRef<Path>) -> trc::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            File::create(&path)
                .and_then(|mut fd| fd.write_all(&vec![0u8; GROW_SLOTS * U32_LEN]))
                .map_err(|err| io_error(err, &path))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(err, &path))?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|err| io_error(err, &path))?;
        Ok(IntColumn { path, file, map })
    }

    fn slots(&self) -> usize {
        self.map.len() / U32_LEN
    }

    pub fn get(&self, idx: u32) -> Option<u32> {
        let pos = idx as usize * U32_LEN;
        self.map
            .get(pos..pos + U32_LEN)
            .map(|bytes| u32::from_le_bytes(bytes.try_into().unwrap()))
            .filter(|value| *value > 0)
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.get(idx).is_some()
    }

    /// Stores a value, growing the file by whole chunks until the slot
    /// fits. Zero is reserved for "empty", so values clamp to one.
    pub fn set(&mut self, idx: u32, value: u32) -> trc::Result<()> {
        let pos = idx as usize * U32_LEN;
        while pos + U32_LEN > self.map.len() {
            self.file
                .seek(SeekFrom::End(0))
                .and_then(|_| self.file.write_all(&vec![0u8; GROW_SLOTS * U32_LEN]))
                .map_err(|err| io_error(err, &self.path))?;
            self.map = unsafe { MmapMut::map_mut(&self.file) }
                .map_err(|err| io_error(err, &self.path))?;
        }
        self.map[pos..pos + U32_LEN].copy_from_slice(&value.max(1).to_le_bytes());
        Ok(())
    }

    pub fn delete(&mut self, idx: u32) {
        let pos = idx as usize * U32_LEN;
        if pos + U32_LEN <= self.map.len() {
            self.map[pos..pos + U32_LEN].copy_from_slice(&0u32.to_le_bytes());
        }
    }

    /// Ascending iteration over `(index, value)` pairs with nonzero values.
    pub fn items(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.slots() as u32).filter_map(|idx| self.get(idx).map(|value| (idx, value)))
    }

    pub fn flush(&mut self) -> trc::Result<()> {
        self.map.flush().map_err(|err| io_error(err, &self.path))
    }

    pub fn remove_file(path: impl AsRef<Path>) -> trc::Result<()> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path).map_err(|err| io_error(err, path))?;
        }
        Ok(())
    }
}
