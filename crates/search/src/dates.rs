/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Date term magic: `date:`/`dates:` terms expand into an OR over the
//! smallest set of `year:`, `yearmonth:` and `date:` keywords covering
//! the requested range, rolled up greedily. Supports absolute dates,
//! unix timestamps, relative offsets (`today`, `yesterday`, `3d`, `2w`,
//! `1m`, `1q`) and `start..end` ranges.

use crate::query::Term;
use chrono::{DateTime, Datelike, Local};

fn offset_days(word: &str) -> Option<u64> {
    match word {
        "today" => Some(0),
        "yesterday" => Some(1),
        "d" => Some(1),
        "w" => Some(7),
        "m" => Some(31),
        "q" => Some(91),
        _ => None,
    }
}

fn ymd_of(ts: i64) -> Option<[i64; 3]> {
    DateTime::from_timestamp(ts, 0).map(|utc| {
        let date = utc.with_timezone(&Local).date_naive();
        [date.year() as i64, date.month() as i64, date.day() as i64]
    })
}

/// Rolls a (year, month, day) cursor forward past pseudo-month ends; the
/// expansion works on 31-day months, over-generating keywords rather
/// than missing any.
fn adjust(date: &mut [i64; 3]) {
    if date[2] > 31 {
        date[1] += 1;
        date[2] -= 31;
    }
    if date[1] > 12 {
        date[0] += 1;
        date[1] -= 12;
    }
}

fn resolve(word: &str, now: u64) -> Option<Vec<i64>> {
    if let Some(days) = offset_days(word) {
        return ymd_of(now as i64 - days as i64 * 24 * 3600).map(|d| d.to_vec());
    }
    if let Some(days) = word
        .chars()
        .last()
        .and_then(|suffix| offset_days(&suffix.to_string()))
    {
        if let Ok(count) = word[..word.len() - 1].parse::<i64>() {
            return ymd_of(now as i64 - count * days as i64 * 24 * 3600).map(|d| d.to_vec());
        }
    }
    if word.len() >= 9 && !word.contains('-') {
        let ts = word.parse::<i64>().ok()?;
        return ymd_of(ts).map(|d| d.to_vec());
    }
    let parts: Vec<i64> = word
        .splitn(3, '-')
        .map(|part| part.parse::<i64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.is_empty() || parts.len() > 3 {
        None
    } else {
        Some(parts)
    }
}

/// Expands a `date:`/`dates:` term; `None` leaves the term untouched.
pub fn date_term_magic(term: &str, now: u64) -> Option<Term> {
    let word = term.split_once(':')?.1.to_lowercase();
    let (start_word, end_word) = match word.split_once("..") {
        Some((start, end)) => (start, end),
        None => (word.as_str(), word.as_str()),
    };

    let mut start = resolve(start_word, now)?;
    let mut end = resolve(end_word, now)?;
    while start.len() < 3 {
        start.push(1);
    }
    if end.len() == 1 {
        end.extend([12, 31]);
    } else if end.len() == 2 {
        end.push(31);
    }
    if start > end {
        return None;
    }

    let mut start: [i64; 3] = start.try_into().ok()?;
    let end: [i64; 3] = end.try_into().ok()?;
    let mut terms = Vec::new();
    while start <= end {
        // Move forward one year?
        if start[1..] == [1, 1] && [start[0], 12, 31] <= end {
            terms.push(Term::Keyword(format!("year:{}", start[0])));
            start[0] += 1;
            continue;
        }
        // Move forward one month?
        if start[2] == 1 && [start[0], start[1], 31] <= end {
            terms.push(Term::Keyword(format!("yearmonth:{}-{}", start[0], start[1])));
            start[1] += 1;
            adjust(&mut start);
            continue;
        }
        // Move forward one day...
        terms.push(Term::Keyword(format!(
            "date:{}-{}-{}",
            start[0], start[1], start[2]
        )));
        start[2] += 1;
        adjust(&mut start);
    }
    Some(Term::Or(terms))
}

/// The date keywords recorded for a message timestamp; search terms
/// expand into ORs over these.
pub fn ts_to_keywords(ts: u64) -> Vec<String> {
    match ymd_of(ts as i64) {
        Some([year, month, day]) => vec![
            format!("year:{year}"),
            format!("month:{month}"),
            format!("day:{day}"),
            format!("yearmonth:{year}-{month}"),
            format!("date:{year}-{month}-{day}"),
        ],
        None => Vec::new(),
    }
}
