/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The on-disk substrate: fixed-capacity record files, sharded record
//! stores addressed by integer index or salted-hashed key, and the
//! append-growable integer columns used for metadata side tables.

pub mod column;
pub mod crypto;
pub mod record_file;
pub mod record_store;

pub use column::IntColumn;
pub use record_file::{RecordFile, RecordFileOptions};
pub use record_store::{RecordStore, RecordStoreConfig, RecordStoreReadOnly};

use utils::U32_LEN;

/// Record header: self-offset plus payload length.
pub const RECORD_HEADER_LEN: usize = U32_LEN * 2;

/// Size of a salted key hash.
pub const HASH_LEN: usize = 32;

/// How an encryption key change is requested during compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Rekey {
    /// Keep whatever key the file currently uses.
    #[default]
    Keep,
    /// Strip encryption from the rewritten file.
    Plain,
    /// Re-encrypt under a new master key.
    Key(Vec<u8>),
}

/// Progress reports emitted by long-running store operations. Returning
/// `false` from a progress callback cancels the operation cooperatively;
/// the store is left consistent and the caller sees `Cancelled`.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub chunk: usize,
    pub done: usize,
    pub total: usize,
}

pub type ProgressFn<'x> = &'x mut dyn FnMut(Progress) -> bool;
