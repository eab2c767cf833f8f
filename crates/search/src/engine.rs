/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The keyword search engine. Keywords map to integers through a record
//! store: frequent keywords get a dedicated L1 slot holding their IntSet
//! directly, everything else shares hashed L2 bucket records. Performance
//! depends on document ids being relatively small, allocated sequentially
//! from zero.

use crate::{
    dates::date_term_magic,
    intset::IntSet,
    postings::PostingListBucket,
    query::{self, Magic, MagicFn, Term},
    wordblob::{create_wordblob, update_wordblob, wordblob_search},
};
use ahash::AHashMap;
use std::{
    collections::BTreeMap,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};
use store::{RecordStore, RecordStoreConfig, Rekey};
use trc::AddContext;
use utils::codec::dumb::Value;

/// Slot 0 holds the engine configuration.
pub const IDX_CONFIG: u32 = 0;
/// Slot 1 holds the wordblob.
pub const IDX_PART_SPACE: u32 = 1;
/// Slots up to here are reserved; L1 keyword slots start right after.
pub const IDX_MAX_RESERVED: u32 = 100;

pub(crate) const IDX_HISTORY_MIN: u32 = 2;
pub(crate) const HISTORY_SLOTS: u32 = IDX_MAX_RESERVED - IDX_HISTORY_MIN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEngineConfig {
    pub partial_list_len: usize,
    pub partial_shortest: usize,
    pub partial_longest: usize,
    pub partial_matches: usize,
    pub l1_keywords: u32,
    pub l2_buckets: u32,
    /// Allocation cursor for L1 slots; persisted so slots stay stable.
    pub l1_used: u32,
    /// Ring cursor for the tag history log.
    pub history_next: u32,
}

impl Default for SearchEngineConfig {
    fn default() -> Self {
        SearchEngineConfig {
            partial_list_len: 128_000,
            partial_shortest: 5,
            partial_longest: 32,
            partial_matches: 10,
            l1_keywords: 512_000,
            l2_buckets: 4 * 1024 * 1024,
            l1_used: 0,
            history_next: 0,
        }
    }
}

impl SearchEngineConfig {
    fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "partial_list_len".into(),
            Value::Int(self.partial_list_len as i64),
        );
        map.insert(
            "partial_shortest".into(),
            Value::Int(self.partial_shortest as i64),
        );
        map.insert(
            "partial_longest".into(),
            Value::Int(self.partial_longest as i64),
        );
        map.insert(
            "partial_matches".into(),
            Value::Int(self.partial_matches as i64),
        );
        map.insert("l1_keywords".into(), Value::Int(self.l1_keywords as i64));
        map.insert("l2_buckets".into(), Value::Int(self.l2_buckets as i64));
        map.insert("l1_used".into(), Value::Int(self.l1_used as i64));
        map.insert("history_next".into(), Value::Int(self.history_next as i64));
        Value::Map(map)
    }

    /// Stored settings win over constructor defaults.
    fn apply(&mut self, stored: &Value) {
        let Value::Map(map) = stored else { return };
        let get = |key: &str| map.get(key).and_then(Value::as_int);
        if let Some(v) = get("partial_list_len") {
            self.partial_list_len = v as usize;
        }
        if let Some(v) = get("partial_shortest") {
            self.partial_shortest = v as usize;
        }
        if let Some(v) = get("partial_longest") {
            self.partial_longest = v as usize;
        }
        if let Some(v) = get("partial_matches") {
            self.partial_matches = v as usize;
        }
        if let Some(v) = get("l1_keywords") {
            self.l1_keywords = v as u32;
        }
        if let Some(v) = get("l2_buckets") {
            self.l2_buckets = v as u32;
        }
        if let Some(v) = get("l1_used") {
            self.l1_used = v as u32;
        }
        if let Some(v) = get("history_next") {
            self.history_next = v as u32;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSummary {
    pub keywords: usize,
    pub hits: Vec<u32>,
}

type ThreadResolver = Box<dyn Fn(u32) -> Option<Vec<u32>> + Send + Sync>;

pub struct SearchEngine {
    pub(crate) records: RecordStore,
    pub(crate) config: SearchEngineConfig,
    part_space: Vec<u8>,
    l2_begin: u32,
    maxint: u32,
    deleted: IntSet,
    thread_resolver: Option<ThreadResolver>,
}

impl SearchEngine {
    pub fn open(
        workdir: impl AsRef<Path>,
        name: &str,
        encryption_key: Option<Vec<u8>>,
        defaults: Option<SearchEngineConfig>,
        maxint: u32,
    ) -> trc::Result<Self> {
        let mut records = RecordStore::open(
            workdir.as_ref().join(name),
            name,
            RecordStoreConfig {
                aes_key: encryption_key,
                compress: Some(64),
                sparse: true,
                est_rec_size: 128,
                target_file_size: 64 * 1024 * 1024,
                ..RecordStoreConfig::default()
            },
        )
        .caused_by(trc::location!())?;

        let mut config = defaults.unwrap_or_default();
        match records.get::<Value>(IDX_CONFIG)? {
            Some(stored) => config.apply(&stored),
            None => {
                records.set(IDX_CONFIG, &config.to_value())?;
            }
        }
        let part_space = records.get::<Vec<u8>>(IDX_PART_SPACE)?.unwrap_or_default();

        Ok(SearchEngine {
            l2_begin: IDX_MAX_RESERVED + 1 + config.l1_keywords,
            records,
            config,
            part_space,
            maxint,
            deleted: IntSet::new(),
            thread_resolver: None,
        })
    }

    /// `thread:`/`tid:` terms are resolved through this hook, typically
    /// wired to the metadata store's thread membership scan.
    pub fn set_thread_resolver(
        &mut self,
        resolver: impl Fn(u32) -> Option<Vec<u32>> + Send + Sync + 'static,
    ) {
        self.thread_resolver = Some(Box::new(resolver));
    }

    pub fn maxint(&self) -> u32 {
        self.maxint
    }

    pub fn deleted(&self) -> &IntSet {
        &self.deleted
    }

    /// Marks ids as purged; they are masked off every read and folded
    /// into posting lists on write.
    pub fn mark_deleted(&mut self, ids: impl IntoIterator<Item = u32>) {
        self.deleted.extend(ids);
    }

    /// Forgets all tombstones, allowing previously deleted ids to be
    /// re-added.
    pub fn clear_tombstones(&mut self) {
        self.deleted = IntSet::new();
    }

    pub(crate) fn persist_config(&mut self) -> trc::Result<()> {
        let value = self.config.to_value();
        self.records.set(IDX_CONFIG, &value)?;
        Ok(())
    }

    /// Target slot for a keyword: a dedicated slot when the store knows
    /// the key, else its hash bucket.
    pub fn keyword_index(&self, keyword: &str) -> trc::Result<u32> {
        let hashed = self.records.hash_key(keyword)?;
        if let Some(idx) = self.records.lookup_hashed(&hashed) {
            return Ok(idx);
        }
        let hash32 = u32::from_le_bytes(hashed[..4].try_into().unwrap());
        Ok(hash32 % self.config.l2_buckets + self.l2_begin)
    }

    #[allow(clippy::type_complexity)]
    fn prep_results(
        &mut self,
        results: &[(u32, Vec<String>)],
    ) -> trc::Result<(Vec<(u32, String)>, AHashMap<String, Vec<u32>>, Vec<u32>)> {
        let mut keywords: AHashMap<String, Vec<u32>> = AHashMap::new();
        let mut hits = Vec::new();
        for (id, kw_list) in results {
            if *id > self.maxint {
                self.maxint = *id;
            }
            for kw in kw_list {
                // Asterisks would break partial search.
                let kw = kw.replace('*', "");
                keywords.entry(kw).or_default().push(*id);
            }
            if !kw_list.is_empty() {
                hits.push(*id);
            }
        }
        let mut kw_idx_list = Vec::with_capacity(keywords.len());
        for kw in keywords.keys() {
            kw_idx_list.push((self.keyword_index(kw)?, kw.clone()));
        }
        kw_idx_list.sort();
        Ok((kw_idx_list, keywords, hits))
    }

    /// Adds `(doc_id, keywords)` results to the index, grouping writes by
    /// target slot.
    pub fn add_results(&mut self, results: &[(u32, Vec<String>)]) -> trc::Result<ResultSummary> {
        let (kw_idx_list, keywords, hits) = self.prep_results(results)?;
        let summary = ResultSummary {
            keywords: keywords.len(),
            hits,
        };
        for (idx, kw) in kw_idx_list {
            let ids = &keywords[&kw];
            if idx < self.l2_begin {
                let mut iset: IntSet = self.records.get(idx)?.unwrap_or_default();
                iset.extend(ids.iter().copied());
                iset -= &self.deleted;
                self.records.set(idx, &iset)?;
            } else {
                let blob = self.records.get::<Vec<u8>>(idx)?.unwrap_or_default();
                let mut bucket = PostingListBucket::new(blob);
                bucket.deleted = Some(self.deleted.clone());
                bucket.add(&kw, ids)?;
                self.records.set(idx, &bucket.blob.as_slice())?;
            }
        }
        Ok(summary)
    }

    /// Removes results; the affected ids become tombstones so later adds
    /// cannot re-surface them until tombstones are cleared.
    pub fn del_results(&mut self, results: &[(u32, Vec<String>)]) -> trc::Result<ResultSummary> {
        let (kw_idx_list, keywords, hits) = self.prep_results(results)?;
        let summary = ResultSummary {
            keywords: keywords.len(),
            hits,
        };
        for (idx, kw) in kw_idx_list {
            let ids: IntSet = keywords[&kw].as_slice().into();
            if idx < self.l2_begin {
                let mut iset: IntSet = self.records.get(idx)?.unwrap_or_default();
                iset -= &ids;
                iset -= &self.deleted;
                self.records.set(idx, &iset)?;
            } else {
                let blob = self.records.get::<Vec<u8>>(idx)?.unwrap_or_default();
                let mut bucket = PostingListBucket::new(blob);
                let mut tombstones = self.deleted.clone();
                tombstones |= &ids;
                bucket.deleted = Some(tombstones);
                bucket.add(&kw, &[])?;
                self.records.set(idx, &bucket.blob.as_slice())?;
            }
        }
        self.deleted.extend(summary.hits.iter().copied());
        Ok(summary)
    }

    /// The posting list for a keyword; absent keywords yield the empty
    /// set.
    pub fn get(&mut self, keyword: &str) -> trc::Result<IntSet> {
        let idx = self.keyword_index(keyword)?;
        if idx < self.l2_begin {
            Ok(self.records.get(idx)?.unwrap_or_default())
        } else {
            let blob = self.records.get::<Vec<u8>>(idx)?.unwrap_or_default();
            Ok(PostingListBucket::new(blob).get(keyword)?.unwrap_or_default())
        }
    }

    /// Stores a keyword's IntSet in a dedicated slot; the first use of a
    /// keyword assigns the next free L1 slot. Falls back to the keyword's
    /// bucket when L1 space is exhausted.
    pub fn set_keyword(&mut self, keyword: &str, iset: &IntSet) -> trc::Result<u32> {
        let idx = self.keyword_index(keyword)?;
        if idx < self.l2_begin {
            self.records.set(idx, iset)?;
            return Ok(idx);
        }
        if self.config.l1_used < self.config.l1_keywords {
            let slot = IDX_MAX_RESERVED + 1 + self.config.l1_used;
            self.config.l1_used += 1;
            self.persist_config()?;
            self.records.set(slot, iset)?;
            self.records.set_key(keyword, slot)?;
            Ok(slot)
        } else {
            let blob = self.records.get::<Vec<u8>>(idx)?.unwrap_or_default();
            let mut bucket = PostingListBucket::new(blob);
            bucket.remove(keyword)?;
            bucket.add(keyword, &iset.to_vec())?;
            self.records.set(idx, &bucket.blob.as_slice())?;
            Ok(idx)
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    /// Parses query text, applying term magic: partial-word candidates,
    /// date ranges, tag normalisation and thread resolution.
    pub fn parse_query(&self, text: &str) -> Term {
        let now = Self::now();
        let emails_magic = |term: &str| Magic::Keep(term.to_string());
        let terms_magic = |term: &str| -> Magic {
            let what = term.split(':').next().unwrap_or_default().to_lowercase();
            match what.as_str() {
                "date" | "dates" => match date_term_magic(term, now) {
                    Some(tree) => Magic::Tree(tree),
                    None => Magic::Keep(term.to_string()),
                },
                "in" | "tag" => match term.split_once(':') {
                    Some((_, name)) => Magic::Keep(format!("in:{name}")),
                    None => Magic::Keep(term.to_string()),
                },
                "thread" | "tid" => {
                    let tid = term.rsplit(':').next().and_then(|t| t.parse::<u32>().ok());
                    match tid {
                        Some(tid) => {
                            let resolved = self
                                .thread_resolver
                                .as_ref()
                                .and_then(|resolver| resolver(tid));
                            match resolved {
                                Some(idxs) if !idxs.is_empty() => Magic::Keep(format!(
                                    "id:{}",
                                    idxs.iter()
                                        .map(|idx| idx.to_string())
                                        .collect::<Vec<_>>()
                                        .join(",")
                                )),
                                _ => Magic::Keep(format!("id:{tid}")),
                            }
                        }
                        None => Magic::Keep(term.to_string()),
                    }
                }
                _ => Magic::Keep(term.to_string()),
            }
        };
        let candidates_magic = |term: &str| -> Magic {
            let matches = wordblob_search(
                term,
                &self.part_space,
                self.config.partial_matches,
                0,
            );
            if matches.len() > 1 {
                Magic::Tree(Term::Or(matches.into_iter().map(Term::Keyword).collect()))
            } else {
                Magic::Keep(
                    matches
                        .into_iter()
                        .next()
                        .unwrap_or_else(|| term.replace('*', "")),
                )
            }
        };
        let magics: [(char, MagicFn<'_>); 3] = [
            ('@', &emails_magic),
            (':', &terms_magic),
            ('*', &candidates_magic),
        ];
        query::parse(text, &magics)
    }

    /// The parsed operator tree rendered as infix text.
    pub fn explain(&self, text: &str) -> String {
        query::explain(&self.parse_query(text))
    }

    fn eval(&mut self, term: &Term) -> trc::Result<IntSet> {
        Ok(match term {
            Term::All => IntSet::all(self.maxint.saturating_add(1)),
            Term::Keyword(keyword) => match keyword.strip_prefix("id:") {
                // Literal integer ids.
                Some(ids) => ids
                    .split(',')
                    .filter_map(|id| id.trim().parse::<u32>().ok())
                    .collect(),
                None => self.get(keyword)?,
            },
            Term::And(terms) => {
                let mut result: Option<IntSet> = None;
                for term in terms {
                    match result.as_mut() {
                        None => result = Some(self.eval(term)?),
                        Some(acc) => {
                            *acc &= &self.eval(term)?;
                        }
                    }
                    if result.as_ref().is_some_and(IntSet::is_empty) {
                        break;
                    }
                }
                result.unwrap_or_default()
            }
            Term::Or(terms) => {
                let mut result = IntSet::new();
                for term in terms {
                    result |= &self.eval(term)?;
                }
                result
            }
            Term::Sub(terms) => {
                let mut result: Option<IntSet> = None;
                for term in terms {
                    match result.as_mut() {
                        None => result = Some(self.eval(term)?),
                        Some(acc) => {
                            *acc -= &self.eval(term)?;
                        }
                    }
                }
                result.unwrap_or_default()
            }
        })
    }

    pub fn search(&mut self, text: &str, mask_deleted: bool) -> trc::Result<IntSet> {
        let tree = self.parse_query(text);
        self.search_tree(&tree, mask_deleted)
    }

    pub fn search_tree(&mut self, tree: &Term, mask_deleted: bool) -> trc::Result<IntSet> {
        let mut result = self.eval(tree)?;
        if mask_deleted {
            result -= &self.deleted;
        }
        trc::event!(
            Search(trc::SearchEvent::Query),
            Details = query::explain(tree),
            Size = result.count(),
        );
        Ok(result)
    }

    /// Partial-match candidates for a `*` term.
    pub fn candidates(&self, term: &str, max_results: usize) -> Vec<String> {
        wordblob_search(term, &self.part_space, max_results, 0)
    }

    fn iter_l2_keywords(&mut self) -> trc::Result<Vec<Vec<u8>>> {
        let mut keywords = Vec::new();
        for idx in self.l2_begin..self.records.len() {
            match self.records.get::<Vec<u8>>(idx) {
                Ok(Some(blob)) => {
                    keywords.extend(PostingListBucket::new(blob).keywords()?);
                }
                Ok(None) => {}
                Err(err) => {
                    trc::event!(
                        Store(trc::StoreEvent::DataCorruption),
                        Index = idx,
                        Reason = err.to_string(),
                    );
                }
            }
        }
        Ok(keywords)
    }

    /// Rebuilds the wordblob from the live L2 keyword space.
    pub fn create_part_space(&mut self) -> trc::Result<()> {
        let keywords = self.iter_l2_keywords()?;
        self.part_space = create_wordblob(
            keywords.iter().map(|kw| kw.as_slice()),
            self.config.partial_shortest,
            self.config.partial_longest,
            self.config.partial_list_len,
        );
        self.records
            .set(IDX_PART_SPACE, &self.part_space.as_slice())?;
        trc::event!(
            Search(trc::SearchEvent::WordblobRebuilt),
            Size = self.part_space.len(),
        );
        Ok(())
    }

    /// Merges the live L2 keyword space into the existing wordblob.
    pub fn update_part_space(&mut self) -> trc::Result<()> {
        let keywords = self.iter_l2_keywords()?;
        self.part_space = update_wordblob(
            keywords.iter().map(|kw| kw.as_slice()),
            &self.part_space,
            None,
            self.config.partial_shortest,
            self.config.partial_longest,
            self.config.partial_list_len,
            false,
        );
        self.records
            .set(IDX_PART_SPACE, &self.part_space.as_slice())?;
        Ok(())
    }

    pub fn part_space(&self) -> &[u8] {
        &self.part_space
    }

    /// Compaction delegates to the record store; the wordblob can be
    /// rebuilt from the surviving keywords afterwards.
    pub fn compact(&mut self, rekey: Rekey, force: bool, rebuild_wordblob: bool) -> trc::Result<()> {
        self.records.compact(rekey, force)?;
        if rebuild_wordblob {
            self.create_part_space()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> trc::Result<()> {
        self.records.flush()
    }

    pub fn delete_everything(&mut self, c1: bool, c2: bool, c3: bool) -> trc::Result<()> {
        self.records.delete_everything(c1, c2, c3)
    }
}
