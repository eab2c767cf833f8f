/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The keyword search engine: dense bitset posting lists in two tiers
//! (dedicated L1 slots for frequent keywords, shared hash buckets for the
//! rest), a wordblob for partial-word candidate matching, and a greedy
//! left-to-right query language.

pub mod dates;
pub mod engine;
pub mod history;
pub mod intset;
pub mod postings;
pub mod query;
pub mod wordblob;

pub use engine::{ResultSummary, SearchEngine, SearchEngineConfig};
pub use history::{TagMutation, TagOp};
pub use intset::IntSet;
pub use postings::PostingListBucket;
pub use query::Term;
