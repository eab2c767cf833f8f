/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod collector;

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Disable = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Store(StoreEvent),
    Index(IndexEvent),
    Search(SearchEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEvent {
    // Fatal for the operation at hand
    ConfigMismatch,
    DataCorruption,
    DecompressError,
    DecryptError,
    UnexpectedError,
    NotUnlocked,

    // Recoverable
    NotFound,
    Busy,
    Cancelled,
    CrashRecovered,
    SaltReuse,

    // Informational
    ChunkCreated,
    Compacted,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexEvent {
    Ingest,
    Duplicate,
    GhostCreated,
    GhostUpgraded,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchEvent {
    Query,
    WordblobRebuilt,
    Mutation,
    HistoryMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    CausedBy,
    Details,
    Reason,
    Path,
    Key,
    Value,
    Size,
    Index,
    Id,
    Expected,
    Found,
    Total,
    Elapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Static(&'static str),
    String(String),
    UInt(u64),
    Int(i64),
    Bytes(Vec<u8>),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    inner: EventType,
    keys: Vec<(Key, Value)>,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub inner: EventType,
    pub keys: Vec<(Key, Value)>,
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::Store(event) => match event {
                StoreEvent::ConfigMismatch => "store.config-mismatch",
                StoreEvent::DataCorruption => "store.data-corruption",
                StoreEvent::DecompressError => "store.decompress-error",
                StoreEvent::DecryptError => "store.decrypt-error",
                StoreEvent::UnexpectedError => "store.unexpected-error",
                StoreEvent::NotUnlocked => "store.not-unlocked",
                StoreEvent::NotFound => "store.not-found",
                StoreEvent::Busy => "store.busy",
                StoreEvent::Cancelled => "store.cancelled",
                StoreEvent::CrashRecovered => "store.crash-recovered",
                StoreEvent::SaltReuse => "store.salt-reuse",
                StoreEvent::ChunkCreated => "store.chunk-created",
                StoreEvent::Compacted => "store.compacted",
                StoreEvent::Deleted => "store.deleted",
            },
            EventType::Index(event) => match event {
                IndexEvent::Ingest => "index.ingest",
                IndexEvent::Duplicate => "index.duplicate",
                IndexEvent::GhostCreated => "index.ghost-created",
                IndexEvent::GhostUpgraded => "index.ghost-upgraded",
                IndexEvent::Delete => "index.delete",
            },
            EventType::Search(event) => match event {
                SearchEvent::Query => "search.query",
                SearchEvent::WordblobRebuilt => "search.wordblob-rebuilt",
                SearchEvent::Mutation => "search.mutation",
                SearchEvent::HistoryMissing => "search.history-missing",
            },
        }
    }

    pub fn level(&self) -> Level {
        match self {
            EventType::Store(event) => match event {
                StoreEvent::ConfigMismatch
                | StoreEvent::DataCorruption
                | StoreEvent::DecompressError
                | StoreEvent::DecryptError
                | StoreEvent::UnexpectedError => Level::Error,
                StoreEvent::NotUnlocked | StoreEvent::CrashRecovered | StoreEvent::SaltReuse => {
                    Level::Warn
                }
                StoreEvent::Busy | StoreEvent::Cancelled | StoreEvent::Compacted => Level::Info,
                StoreEvent::NotFound | StoreEvent::ChunkCreated | StoreEvent::Deleted => {
                    Level::Debug
                }
            },
            EventType::Index(event) => match event {
                IndexEvent::GhostCreated | IndexEvent::GhostUpgraded => Level::Debug,
                IndexEvent::Ingest | IndexEvent::Duplicate | IndexEvent::Delete => Level::Trace,
            },
            EventType::Search(event) => match event {
                SearchEvent::HistoryMissing => Level::Warn,
                SearchEvent::WordblobRebuilt | SearchEvent::Mutation => Level::Info,
                SearchEvent::Query => Level::Trace,
            },
        }
    }

    pub fn into_err(self) -> Error {
        Error::new(self)
    }

    pub fn caused_by(self, location: &'static str) -> Error {
        Error::new(self).caused_by(location)
    }

    pub fn ctx(self, key: Key, value: impl Into<Value>) -> Error {
        Error::new(self).ctx(key, value)
    }
}

macro_rules! event_constructors {
    ($event:ident, $variant:ident) => {
        impl $event {
            pub fn into_err(self) -> Error {
                Error::new(EventType::$variant(self))
            }

            pub fn caused_by(self, location: &'static str) -> Error {
                self.into_err().caused_by(location)
            }

            pub fn ctx(self, key: Key, value: impl Into<Value>) -> Error {
                self.into_err().ctx(key, value)
            }
        }

        impl From<$event> for EventType {
            fn from(event: $event) -> Self {
                EventType::$variant(event)
            }
        }
    };
}

event_constructors!(StoreEvent, Store);
event_constructors!(IndexEvent, Index);
event_constructors!(SearchEvent, Search);

impl Error {
    pub fn new(inner: impl Into<EventType>) -> Self {
        Error {
            inner: inner.into(),
            keys: Vec::with_capacity(2),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.inner
    }

    pub fn ctx(mut self, key: Key, value: impl Into<Value>) -> Self {
        self.keys.push((key, value.into()));
        self
    }

    pub fn details(self, details: impl Into<Value>) -> Self {
        self.ctx(Key::Details, details)
    }

    pub fn reason(self, reason: impl fmt::Display) -> Self {
        self.ctx(Key::Reason, reason.to_string())
    }

    pub fn caused_by(self, location: &'static str) -> Self {
        self.ctx(Key::CausedBy, Value::Static(location))
    }

    pub fn matches(&self, event: impl Into<EventType>) -> bool {
        self.inner == event.into()
    }

    pub fn is_not_found(&self) -> bool {
        self.matches(StoreEvent::NotFound)
    }

    pub fn value(&self, key: Key) -> Option<&Value> {
        self.keys.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

pub trait AddContext<T> {
    fn caused_by(self, location: &'static str) -> Result<T>;
    fn add_context(self, f: impl FnOnce(Error) -> Error) -> Result<T>;
}

impl<T> AddContext<T> for Result<T> {
    fn caused_by(self, location: &'static str) -> Result<T> {
        self.map_err(|err| err.caused_by(location))
    }

    fn add_context(self, f: impl FnOnce(Error) -> Error) -> Result<T> {
        self.map_err(f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Static(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value}"),
            Value::UInt(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Bytes(value) => {
                for byte in value.iter().take(32) {
                    write!(f, "{byte:02x}")?;
                }
                if value.len() > 32 {
                    write!(f, "…")?;
                }
                Ok(())
            }
            Value::Bool(value) => write!(f, "{value}"),
            Value::None => Ok(()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.name())?;
        for (key, value) in &self.keys {
            write!(f, " ({key:?}: {value})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<&'static str> for Value {
    fn from(value: &'static str) -> Self {
        Value::Static(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::UInt(value.into())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::UInt(value as u64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

#[macro_export]
macro_rules! location {
    () => {
        concat!(file!(), ":", line!())
    };
}

#[macro_export]
macro_rules! event {
    ($typ:ident($event:expr) $(, $key:ident = $value:expr)* $(,)?) => {{
        let event_type = $crate::EventType::$typ($event);
        if $crate::collector::has_interest(event_type) {
            $crate::collector::collect($crate::Event {
                inner: event_type,
                keys: vec![$(($crate::Key::$key, $crate::Value::from($value))),*],
            });
        }
    }};
}
