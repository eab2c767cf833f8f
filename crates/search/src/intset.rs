/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! A compact, dumb-serialisable dense bitset over non-negative integers.
//! The backing array is little-endian u64 words; growth adds slack so
//! repeated single-bit inserts do not reallocate each time. File
//! portability is why the endianness is explicit.

use std::ops::{BitAndAssign, BitOrAssign, BitXorAssign, SubAssign};
use utils::codec::{Deserialize, Serialize};

pub const BITS: usize = 64;

/// Extra words allocated beyond the highest needed position.
const GROW_WORDS: usize = 1024;

pub const TAG_INTSET: u8 = b'i';

#[derive(Debug, Clone, Default)]
pub struct IntSet {
    words: Vec<u64>,
}

impl IntSet {
    pub fn new() -> Self {
        IntSet::default()
    }

    /// The universal set: the first `count` bits set.
    pub fn all(count: u32) -> Self {
        let count = count as usize;
        let full = count / BITS;
        let mut words = vec![u64::MAX; full];
        let rest = count % BITS;
        if rest > 0 {
            words.push((1u64 << rest) - 1);
        }
        IntSet { words }
    }

    fn grow_for(&mut self, pos: usize) {
        if pos >= self.words.len() {
            self.words.resize(pos + GROW_WORDS, 0);
        }
    }

    pub fn insert(&mut self, value: u32) {
        let pos = value as usize / BITS;
        self.grow_for(pos);
        self.words[pos] |= 1u64 << (value as usize % BITS);
    }

    pub fn remove(&mut self, value: u32) {
        let pos = value as usize / BITS;
        if pos < self.words.len() {
            self.words[pos] &= !(1u64 << (value as usize % BITS));
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        let pos = value as usize / BITS;
        self.words
            .get(pos)
            .is_some_and(|word| word & (1u64 << (value as usize % BITS)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(pos, word)| {
            (0..BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| (pos * BITS + bit) as u32)
        })
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    pub fn max_value(&self) -> Option<u32> {
        self.words
            .iter()
            .rposition(|word| *word != 0)
            .map(|pos| (pos * BITS + (BITS - 1 - self.words[pos].leading_zeros() as usize)) as u32)
    }
}

impl PartialEq for IntSet {
    fn eq(&self, other: &Self) -> bool {
        let shared = self.words.len().min(other.words.len());
        self.words[..shared] == other.words[..shared]
            && self.words[shared..].iter().all(|word| *word == 0)
            && other.words[shared..].iter().all(|word| *word == 0)
    }
}

impl Eq for IntSet {}

impl BitOrAssign<&IntSet> for IntSet {
    fn bitor_assign(&mut self, other: &IntSet) {
        if other.words.len() > self.words.len() {
            self.grow_for(other.words.len() - 1);
        }
        for (word, other_word) in self.words.iter_mut().zip(other.words.iter()) {
            *word |= other_word;
        }
    }
}

impl BitAndAssign<&IntSet> for IntSet {
    fn bitand_assign(&mut self, other: &IntSet) {
        let shared = self.words.len().min(other.words.len());
        for (word, other_word) in self.words[..shared].iter_mut().zip(other.words.iter()) {
            *word &= other_word;
        }
        for word in self.words[shared..].iter_mut() {
            *word = 0;
        }
    }
}

impl SubAssign<&IntSet> for IntSet {
    fn sub_assign(&mut self, other: &IntSet) {
        let shared = self.words.len().min(other.words.len());
        for (word, other_word) in self.words[..shared].iter_mut().zip(other.words.iter()) {
            *word &= !other_word;
        }
    }
}

impl BitXorAssign<&IntSet> for IntSet {
    fn bitxor_assign(&mut self, other: &IntSet) {
        if other.words.len() > self.words.len() {
            self.grow_for(other.words.len() - 1);
        }
        for (word, other_word) in self.words.iter_mut().zip(other.words.iter()) {
            *word ^= other_word;
        }
    }
}

impl Extend<u32> for IntSet {
    fn extend<T: IntoIterator<Item = u32>>(&mut self, iter: T) {
        for value in iter {
            self.insert(value);
        }
    }
}

impl FromIterator<u32> for IntSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = IntSet::new();
        set.extend(iter);
        set
    }
}

impl From<&[u32]> for IntSet {
    fn from(values: &[u32]) -> Self {
        values.iter().copied().collect()
    }
}

impl Serialize for IntSet {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + self.words.len() * 8);
        buf.push(TAG_INTSET);
        for word in &self.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        Ok(buf)
    }
}

impl Deserialize for IntSet {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        let body = bytes.strip_prefix(&[TAG_INTSET]).ok_or_else(|| {
            trc::StoreEvent::DataCorruption
                .caused_by(trc::location!())
                .details("not an intset payload")
        })?;
        if body.len() % 8 != 0 {
            return Err(trc::StoreEvent::DataCorruption
                .caused_by(trc::location!())
                .details("intset payload length is not a multiple of eight"));
        }
        Ok(IntSet {
            words: body
                .chunks_exact(8)
                .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
                .collect(),
        })
    }
}
