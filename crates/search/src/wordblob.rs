/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Partial-match candidates: all known keywords live in one
//! newline-joined buffer, searched with a single regex pass. Substring
//! hits become candidate keywords for the real index lookup, which is
//! particularly helpful for languages where words share a common root.
//! Asterisks match zero or more characters, MS-DOS style.

use ahash::AHashSet;
use rand::seq::IndexedRandom;
use regex::bytes::RegexBuilder;

/// Searches for `term` in `blob`, returning up to `max_results` matches
/// ordered by how exact they are. The term itself, stripped of
/// asterisks, is always the first candidate even when absent from the
/// blob.
pub fn wordblob_search(term: &str, blob: &[u8], max_results: usize, order: i64) -> Vec<String> {
    let stripped = term.replace('*', "");
    if stripped.is_empty() {
        return Vec::new();
    }
    let mut matches: Vec<(i64, Vec<u8>)> = vec![(0, stripped.clone().into_bytes())];

    let bind_beg = !term.starts_with('*');
    let bind_end = !term.ends_with('*');
    let pattern = term
        .trim_matches('*')
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^\\n]*");
    let Ok(search_re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
        return vec![stripped];
    };

    for found in search_re.find_iter(blob) {
        let (mut beg, mut end) = (found.start(), found.end());

        // Checking line binding here, rather than with anchors in the
        // regex itself, is much faster once the blob gets large.
        if bind_beg && beg > 0 && blob[beg - 1] != b'\n' {
            continue;
        }
        if bind_end && end < blob.len() && blob[end] != b'\n' {
            continue;
        }

        // Expand the match to the full keyword around it.
        let offset = beg;
        while beg > 0 && blob[beg - 1] != b'\n' {
            beg -= 1;
        }
        while end < blob.len() && blob[end] != b'\n' {
            end += 1;
        }

        // Weight by how close the hit is to an exact match.
        let keyword = &blob[beg..end];
        if keyword != matches[0].1.as_slice() && keyword != matches.last().unwrap().1.as_slice() {
            let orank = 1_000_000_000 + matches.len() as i64 * order;
            let ratio = 10 * keyword.len() as i64 / term.len() as i64;
            matches.push((ratio + (offset - beg) as i64 + orank, keyword.to_vec()));
        }
    }

    matches.sort();
    matches
        .into_iter()
        .take(max_results)
        .map(|(_, kw)| String::from_utf8_lossy(&kw).into_owned())
        .collect()
}

/// Stays within the length limit by randomly dropping the longest words
/// until the list fits.
fn prune_longest(mut keywords: Vec<Vec<u8>>, mut longest: usize, maxlen: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::rng();
    while keywords.len() > maxlen && longest > 0 {
        let (longish, mut shorter): (Vec<_>, Vec<_>) =
            keywords.into_iter().partition(|kw| kw.len() >= longest);
        let room = maxlen.saturating_sub(shorter.len());
        if room > 0 {
            shorter.extend(longish.choose_multiple(&mut rng, room).cloned());
            return shorter;
        }
        keywords = shorter;
        longest -= 1;
    }
    keywords
}

/// Merges keywords into an existing blob, applying length bounds and an
/// optional blacklist. With `lru` the new keywords go first and the old
/// order is preserved; otherwise the result is sorted.
pub fn update_wordblob<'x>(
    iter_kws: impl IntoIterator<Item = &'x [u8]>,
    blob: &[u8],
    blacklist: Option<&AHashSet<Vec<u8>>>,
    shortest: usize,
    longest: usize,
    maxlen: usize,
    lru: bool,
) -> Vec<u8> {
    let mut keywords: AHashSet<Vec<u8>> = AHashSet::new();
    for kw in iter_kws {
        if kw.len() >= shortest && kw.len() <= longest && !kw.contains(&b'*') {
            keywords.insert(kw.to_vec());
        }
    }
    if let Some(blacklist) = blacklist {
        keywords.retain(|kw| !blacklist.contains(kw));
    }

    let mut result: Vec<Vec<u8>>;
    if !blob.is_empty() && keywords.len() < maxlen {
        let keeping = maxlen - keywords.len();
        let mut old_kws: Vec<Vec<u8>> = blob
            .split(|byte| *byte == b'\n')
            .filter(|kw| {
                !kw.is_empty()
                    && !keywords.contains(*kw)
                    && blacklist.is_none_or(|bl| !bl.contains(*kw))
            })
            .map(|kw| kw.to_vec())
            .collect();
        if !lru {
            old_kws = prune_longest(old_kws, longest, keeping);
        }
        old_kws.truncate(keeping);
        result = keywords.into_iter().collect();
        if lru {
            result.sort();
            let mut merged = result;
            merged.extend(old_kws);
            result = merged;
        } else {
            result.extend(old_kws);
        }
    } else {
        result = prune_longest(keywords.into_iter().collect(), longest, maxlen);
    }

    if !lru {
        result.sort();
    }
    result.join(&b'\n')
}

pub fn create_wordblob<'x>(
    iter_kws: impl IntoIterator<Item = &'x [u8]>,
    shortest: usize,
    longest: usize,
    maxlen: usize,
) -> Vec<u8> {
    update_wordblob(iter_kws, b"", None, shortest, longest, maxlen, false)
}
