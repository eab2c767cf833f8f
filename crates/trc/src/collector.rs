/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::{Event, EventType, Level};
use std::{
    sync::atomic::{AtomicU8, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub struct Collector;

impl Collector {
    pub fn set_level(level: Level) {
        MAX_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    pub fn level() -> Level {
        match MAX_LEVEL.load(Ordering::Relaxed) {
            0 => Level::Disable,
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

#[inline]
pub fn has_interest(event: EventType) -> bool {
    let level = event.level();
    level != Level::Disable && level <= Collector::level()
}

pub fn collect(event: Event) {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let mut line = format!(
        "[{timestamp}] {:?} {}",
        event.inner.level(),
        event.inner.name()
    );
    for (key, value) in &event.keys {
        line.push_str(&format!(" {key:?}={value}"));
    }
    eprintln!("{line}");
}
