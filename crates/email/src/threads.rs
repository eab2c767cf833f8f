/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Grouping of search hits into threads: sort by (thread-id, date),
//! coalesce runs sharing a thread id, then order groups by their oldest
//! message. Urgent threads float to the top preserving relative order.

use crate::store::MetadataStore;
use ahash::AHashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    None,
    DateAsc,
    DateDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadGroup {
    pub thread_id: u32,
    pub hits: Vec<u32>,
    timestamp: u32,
}

impl MetadataStore {
    /// Collapses hits into thread groups, sorted by the group's minimum
    /// timestamp rank. `urgent` thread ids are floated to the top when a
    /// sort order is in effect.
    pub fn collate_threads(
        &self,
        hits: impl IntoIterator<Item = u32>,
        order: SortOrder,
        urgent: Option<&AHashSet<u32>>,
    ) -> Vec<ThreadGroup> {
        let mut keyed: Vec<(u32, u32, u32)> =
            hits.into_iter().map(|idx| self.thread_sorting_key(idx)).collect();
        keyed.sort_unstable();
        if order == SortOrder::DateDesc {
            keyed.reverse();
        }

        let mut groups: Vec<ThreadGroup> = Vec::new();
        for (thread_id, timestamp, idx) in keyed {
            match groups.last_mut() {
                Some(group) if group.thread_id == thread_id => {
                    group.timestamp = group.timestamp.min(timestamp);
                    group.hits.push(idx);
                }
                _ => groups.push(ThreadGroup {
                    thread_id,
                    hits: vec![idx],
                    timestamp,
                }),
            }
        }

        if order != SortOrder::None {
            groups.sort_by_key(|group| group.timestamp);
            if order == SortOrder::DateDesc {
                groups.reverse();
            }
        }

        if let Some(urgent) = urgent.filter(|_| order != SortOrder::None) {
            let (first, rest): (Vec<_>, Vec<_>) = groups
                .into_iter()
                .partition(|group| urgent.contains(&group.thread_id));
            first.into_iter().chain(rest).collect()
        } else {
            groups
        }
    }

    /// Flat message ordering with the same urgent floating.
    pub fn collate_messages(
        &self,
        mut hits: Vec<u32>,
        order: SortOrder,
        urgent: Option<&AHashSet<u32>>,
    ) -> Vec<u32> {
        if order != SortOrder::None {
            hits.sort_by_key(|idx| self.date_sorting_key(*idx));
            if order == SortOrder::DateDesc {
                hits.reverse();
            }
        }
        if let Some(urgent) = urgent.filter(|_| order != SortOrder::None) {
            let (first, rest): (Vec<_>, Vec<_>) =
                hits.into_iter().partition(|idx| urgent.contains(idx));
            first.into_iter().chain(rest).collect()
        } else {
            hits
        }
    }
}
