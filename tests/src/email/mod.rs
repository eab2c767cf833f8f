/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::TempDir;
use ahash::AHashSet;
use email::{Metadata, MetadataStore, Pointer, PointerKind, SortOrder};
use std::collections::BTreeMap;
use utils::codec::dumb::Value;

fn message(msgid: &str, in_reply_to: Option<&str>, date: &str) -> Metadata {
    let mut headers = format!("Date: {date}\nMessage-Id: {msgid}\n");
    if let Some(parent) = in_reply_to {
        headers.push_str(&format!("In-Reply-To: {parent}\n"));
    }
    headers.push_str("From: root@example.org\nTo: bre@example.org\nSubject: Sure, sure");
    Metadata::new(
        0,
        vec![Pointer::new(PointerKind::Mbox, "/tmp/foo", 0, 100, 200)],
        headers,
        BTreeMap::new(),
    )
}

#[test]
fn dedup_by_message_id() {
    let dir = TempDir::new("md-dedup", true);
    let mut ms = MetadataStore::open(&dir.path, Some(b"123456789abcdef0".to_vec())).unwrap();

    let mut md1 = message("<a@x>", None, "Wed, 1 Sep 2021 00:03:01 GMT");
    md1.more
        .insert("thing".into(), Value::Text("stuff".into()));
    md1.more.insert("a".into(), Value::Text("b".into()));
    let mut md2 = message("<a@x>", None, "Wed, 1 Sep 2021 00:03:01 GMT");
    md2.more.insert("wink".into(), Value::Int(123));
    md2.more.insert("a".into(), Value::Text("c".into()));

    let (new1, i1) = ms.update_or_add(md1).unwrap();
    let (new2, i2) = ms.update_or_add(md2).unwrap();
    assert!(new1);
    assert!(!new2);
    assert_eq!(i1, i2);

    // Annotations merge with new values winning.
    let stored = ms.get(i1).unwrap().unwrap();
    assert_eq!(stored.more["thing"], Value::Text("stuff".into()));
    assert_eq!(stored.more["wink"], Value::Int(123));
    assert_eq!(stored.more["a"], Value::Text("c".into()));
    assert!(ms.contains("<a@x>"));
    assert!(!ms.contains("<a@y>"));

    // add_if_new declines known ids.
    assert!(
        ms.add_if_new(message("<a@x>", None, "Wed, 1 Sep 2021 00:03:01 GMT"))
            .unwrap()
            .is_none()
    );
    dir.delete();
}

#[test]
fn thread_assembly_via_ghosts() {
    let dir = TempDir::new("md-threads", true);
    let mut ms = MetadataStore::open(&dir.path, None).unwrap();

    // A reply arrives before its parent: a ghost is synthesised.
    let reply = message("<b@x>", Some("<a@x>"), "Wed, 1 Sep 2021 00:03:01 GMT");
    let (_, reply_idx) = ms.update_or_add(reply).unwrap();
    let ghost_idx = ms.key_to_index("<a@x>").unwrap();
    let ghost = ms.get(ghost_idx).unwrap().unwrap();
    assert!(ghost.is_ghost());
    assert_eq!(ghost.thread_id, Some(ghost_idx));
    let reply = ms.get(reply_idx).unwrap().unwrap();
    assert_eq!(reply.thread_id, Some(ghost_idx));

    // The real parent arrives: same index, pointers filled, thread kept.
    let (is_new, parent_idx) =
        ms.update_or_add(message("<a@x>", None, "Wed, 1 Sep 2021 00:01:01 GMT")).unwrap();
    assert!(!is_new);
    assert_eq!(parent_idx, ghost_idx);
    let upgraded = ms.get(parent_idx).unwrap().unwrap();
    assert!(!upgraded.is_ghost());
    assert_eq!(upgraded.thread_id, Some(ghost_idx));
    assert_eq!(upgraded.more["missing"], Value::Bool(true));

    // A grandchild lands in the same thread.
    let (_, gc_idx) =
        ms.update_or_add(message("<c@x>", Some("<b@x>"), "Wed, 1 Sep 2021 00:05:01 GMT")).unwrap();
    assert_eq!(ms.get(gc_idx).unwrap().unwrap().thread_id, Some(ghost_idx));

    let mut thread = ms.get_thread_idxs(ghost_idx);
    thread.sort_unstable();
    let mut expected = vec![ghost_idx, reply_idx, gc_idx];
    expected.sort_unstable();
    assert_eq!(thread, expected);

    // A standalone message starts its own thread.
    let (_, solo_idx) =
        ms.update_or_add(message("<solo@x>", None, "Wed, 1 Sep 2021 00:07:01 GMT")).unwrap();
    assert_eq!(ms.get(solo_idx).unwrap().unwrap().thread_id, Some(solo_idx));
    dir.delete();
}

#[test]
fn deletion_zeros_side_columns() {
    let dir = TempDir::new("md-delete", true);
    let mut ms = MetadataStore::open(&dir.path, None).unwrap();
    let (_, idx) =
        ms.update_or_add(message("<gone@x>", None, "Wed, 1 Sep 2021 00:03:01 GMT")).unwrap();
    assert!(ms.date_sorting_key(idx).0 > 0);

    ms.delete(idx).unwrap();
    assert!(ms.get(idx).unwrap().is_none());
    assert_eq!(ms.date_sorting_key(idx).0, 0);
    dir.delete();
}

#[test]
fn timestamps_rank_and_fallback() {
    let dir = TempDir::new("md-timestamps", true);
    let mut ms = MetadataStore::open(&dir.path, None).unwrap();

    let md = message("<dated@x>", None, "Wed, 1 Sep 2021 00:03:01 +0000");
    let ts = md.timestamp;
    assert!(ts > 1_600_000_000);
    let (_, idx) = ms.update_or_add(md).unwrap();
    assert_eq!(ms.date_sorting_key(idx).0 as u64, ts / 30);

    // No Date header at all: the monotonic fallback kicks in.
    let bare = Metadata::new(
        0,
        vec![Pointer::new(PointerKind::Mbox, "/tmp/foo", 0, 0, 0)],
        "Message-Id: <undated@x>\nFrom: x@example.org",
        BTreeMap::new(),
    );
    let (_, idx) = ms.update_or_add(bare).unwrap();
    let stored = ms.get(idx).unwrap().unwrap();
    assert!(stored.timestamp >= ts);
    dir.delete();
}

#[test]
fn thread_grouping_and_urgent_floating() {
    let dir = TempDir::new("md-grouping", true);
    let mut ms = MetadataStore::open(&dir.path, None).unwrap();

    let (_, a1) = ms.update_or_add(message("<a1@x>", None, "Wed, 1 Sep 2021 00:01:00 GMT")).unwrap();
    let (_, a2) =
        ms.update_or_add(message("<a2@x>", Some("<a1@x>"), "Wed, 1 Sep 2021 09:00:00 GMT")).unwrap();
    let (_, b1) = ms.update_or_add(message("<b1@x>", None, "Wed, 1 Sep 2021 03:00:00 GMT")).unwrap();
    let (_, c1) = ms.update_or_add(message("<c1@x>", None, "Wed, 1 Sep 2021 06:00:00 GMT")).unwrap();

    let groups = ms.collate_threads([a1, a2, b1, c1], SortOrder::DateAsc, None);
    assert_eq!(groups.len(), 3);
    // Group order follows each thread's oldest message.
    assert_eq!(groups[0].thread_id, a1);
    assert_eq!(groups[0].hits, vec![a1, a2]);
    assert_eq!(groups[1].thread_id, b1);
    assert_eq!(groups[2].thread_id, c1);

    let groups = ms.collate_threads([a1, a2, b1, c1], SortOrder::DateDesc, None);
    assert_eq!(groups[0].thread_id, c1);
    assert_eq!(groups[2].thread_id, a1);

    // Urgent threads float to the top, preserving relative order.
    let urgent: AHashSet<u32> = [c1].into_iter().collect();
    let groups = ms.collate_threads([a1, a2, b1, c1], SortOrder::DateAsc, Some(&urgent));
    assert_eq!(groups[0].thread_id, c1);
    assert_eq!(groups[1].thread_id, a1);
    assert_eq!(groups[2].thread_id, b1);

    let flat = ms.collate_messages(vec![c1, a1, b1], SortOrder::DateAsc, None);
    assert_eq!(flat, vec![a1, b1, c1]);
    dir.delete();
}
