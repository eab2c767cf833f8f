/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::TempDir;
use search::{IntSet, SearchEngine, SearchEngineConfig, TagMutation, TagOp};
use store::Rekey;
use utils::codec::Serialize;

fn open_engine(dir: &TempDir) -> SearchEngine {
    SearchEngine::open(
        &dir.path,
        "se-test",
        None,
        Some(SearchEngineConfig {
            partial_list_len: 7,
            partial_shortest: 4,
            l1_keywords: 100,
            l2_buckets: 10240,
            ..SearchEngineConfig::default()
        }),
        0,
    )
    .unwrap()
}

fn keywords(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn seed(engine: &mut SearchEngine) {
    engine
        .add_results(&[
            (
                1,
                keywords(&["hello", "hell", "hellscape", "hellyeah", "world", "hooray"]),
            ),
            (3, keywords(&["please", "remove", "the", "politeness"])),
            (2, keywords(&["ell", "hello", "iceland", "e*vil"])),
        ])
        .unwrap();
}

#[test]
fn basic_search() {
    let dir = TempDir::new("se-basic", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);

    assert!(engine.search("hello world", true).unwrap().contains(1));
    assert!(!engine.search("hello world", true).unwrap().contains(2));
    assert!(engine.search("notfound", true).unwrap().is_empty());
    assert_eq!(engine.maxint(), 3);

    // Explicit OR equals the union of the parts.
    let hello = engine.search("hello", true).unwrap();
    let union = engine.search("world +iceland", true).unwrap();
    assert_eq!(hello, union);

    // Literal ids.
    assert_eq!(
        engine.search("id:3,5", false).unwrap().to_vec(),
        vec![3, 5]
    );
    dir.delete();
}

#[test]
fn partial_words_via_wordblob() {
    let dir = TempDir::new("se-partials", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);

    engine.create_part_space().unwrap();
    let blob = engine.part_space();
    assert!(!blob.contains(&b'*'));
    // The asterisk is stripped before indexing, so e*vil became evil.
    assert!(
        String::from_utf8_lossy(blob).lines().any(|kw| kw == "evil"),
        "{:?}",
        String::from_utf8_lossy(blob)
    );
    // The length cap pushed out the longest keywords.
    assert!(!String::from_utf8_lossy(blob).contains("hellscape"));

    assert_eq!(engine.candidates("***", 10).len(), 0);
    assert_eq!(engine.candidates("ell*", 10), vec!["ell"]);
    assert_eq!(engine.candidates("*ell", 10), vec!["ell", "hell"]);
    assert_eq!(engine.candidates("*ell*", 10), vec!["ell", "hell", "hello"]);

    assert!(engine.search("hell* w*ld", true).unwrap().contains(1));
    dir.delete();
}

#[test]
fn explain_operator_parsing() {
    let dir = TempDir::new("se-explain", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);
    engine.create_part_space().unwrap();

    assert_eq!(
        engine.explain("hello + world iceland"),
        "((hello OR world) AND iceland)"
    );
    assert_eq!(
        engine.explain("* - is:deleted he*o WORLD +Iceland"),
        "(((ALL NOT is:deleted) AND (heo OR hello) AND world) OR iceland)"
    );
    assert_eq!(
        engine.explain("dates:2012..2013 OR date:2015"),
        "((year:2012 OR year:2013) OR year:2015)"
    );
    assert_eq!(
        engine.explain("dates:2021-10-30..2021-12"),
        "(date:2021-10-30 OR date:2021-10-31 OR yearmonth:2021-11 OR yearmonth:2021-12)"
    );
    assert_eq!(engine.explain("tag:Inbox"), "in:inbox");
    dir.delete();
}

#[test]
fn delete_then_search_tombstones() {
    let dir = TempDir::new("se-tombstones", true);
    let mut engine = open_engine(&dir);

    engine.add_results(&[(7, keywords(&["spam"]))]).unwrap();
    assert_eq!(engine.search("spam", true).unwrap().to_vec(), vec![7]);

    engine.del_results(&[(7, keywords(&["spam"]))]).unwrap();
    assert!(engine.search("spam", true).unwrap().is_empty());
    assert!(engine.deleted().contains(7));

    // Tombstoned ids stay out even when re-added.
    engine.add_results(&[(7, keywords(&["spam"]))]).unwrap();
    assert!(engine.search("spam", true).unwrap().is_empty());

    // Until the tombstones are explicitly cleared.
    engine.clear_tombstones();
    engine.add_results(&[(7, keywords(&["spam"]))]).unwrap();
    assert_eq!(engine.search("spam", true).unwrap().to_vec(), vec![7]);
    dir.delete();
}

#[test]
fn deleted_ids_are_masked_everywhere() {
    let dir = TempDir::new("se-masking", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);
    engine.create_part_space().unwrap();
    engine.mark_deleted([1]);

    for query in ["hello", "world", "*", "hell* w*ld", "hello +iceland"] {
        let hits = engine.search(query, true).unwrap();
        assert!(!hits.contains(1), "{query} resurfaced a deleted id");
    }
    // Unmasked searches still see it.
    assert!(engine.search("hello", false).unwrap().contains(1));
    dir.delete();
}

#[test]
fn l1_promotion_is_stable() {
    let dir = TempDir::new("se-l1", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);

    let tagged: IntSet = [1u32, 2].into_iter().collect();
    let slot = engine.set_keyword("in:urgent", &tagged).unwrap();
    assert_eq!(engine.keyword_index("in:urgent").unwrap(), slot);
    assert_eq!(engine.get("in:urgent").unwrap(), tagged);

    // Adds merge into the dedicated slot.
    engine.add_results(&[(5, keywords(&["in:urgent"]))]).unwrap();
    assert_eq!(engine.get("in:urgent").unwrap().to_vec(), vec![1, 2, 5]);
    drop(engine);

    // Slots survive a reopen; the allocation cursor is persisted.
    let mut engine = open_engine(&dir);
    assert_eq!(engine.keyword_index("in:urgent").unwrap(), slot);
    assert_eq!(engine.get("in:urgent").unwrap().to_vec(), vec![1, 2, 5]);
    let other: IntSet = [9u32].into_iter().collect();
    let next_slot = engine.set_keyword("in:junk", &other).unwrap();
    assert_eq!(next_slot, slot + 1);
    dir.delete();
}

#[test]
fn tag_mutation_history() {
    let dir = TempDir::new("se-history", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);

    let changed = engine
        .mutate(
            &[TagMutation {
                targets: [1u32, 2].into_iter().collect(),
                ops: vec![(TagOp::Add, "in:junk".to_string())],
            }],
            Some("op-1"),
        )
        .unwrap();
    assert_eq!(changed.to_vec(), vec![1, 2]);
    assert_eq!(engine.get("in:junk").unwrap().to_vec(), vec![1, 2]);

    engine.undo("op-1").unwrap();
    assert!(engine.get("in:junk").unwrap().is_empty());

    engine.redo("op-1").unwrap();
    assert_eq!(engine.get("in:junk").unwrap().to_vec(), vec![1, 2]);

    assert!(engine.undo("never-recorded").unwrap_err().is_not_found());
    dir.delete();
}

#[test]
fn thread_magic_resolves_ids() {
    let dir = TempDir::new("se-threads", true);
    let mut engine = open_engine(&dir);
    engine.set_thread_resolver(|tid| Some(vec![tid, tid + 1]));

    assert_eq!(engine.explain("thread:5"), "id:5,6");
    assert_eq!(engine.search("tid:7", false).unwrap().to_vec(), vec![7, 8]);
    dir.delete();
}

#[test]
fn query_determinism() {
    let dir = TempDir::new("se-determinism", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);

    let first = engine.search("hello -iceland +the", true).unwrap();
    let second = engine.search("hello -iceland +the", true).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.serialize().unwrap(), second.serialize().unwrap());
    dir.delete();
}

#[test]
fn compaction_keeps_postings() {
    let dir = TempDir::new("se-compaction", true);
    let mut engine = open_engine(&dir);
    seed(&mut engine);
    engine.create_part_space().unwrap();
    let before = engine.search("hello", true).unwrap();

    engine.compact(Rekey::Keep, true, true).unwrap();
    assert_eq!(engine.search("hello", true).unwrap(), before);
    assert!(!engine.part_space().is_empty());
    dir.delete();
}
