/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The per-message metadata entity: a positional tuple of timestamp,
//! store index, mailbox pointers, a normalised header blob and free-form
//! annotations. The header blob is preserved verbatim; its byte-sorted
//! digest is the message UUID.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use sha1::{Digest, Sha1};
use std::{collections::BTreeMap, sync::LazyLock};
use utils::codec::{
    Deserialize, Serialize,
    dumb::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PointerKind {
    Mbox,
    Maildir,
    Remote,
}

impl PointerKind {
    fn as_int(self) -> i64 {
        match self {
            PointerKind::Mbox => 0,
            PointerKind::Maildir => 1,
            PointerKind::Remote => 1000,
        }
    }

    fn from_int(value: i64) -> trc::Result<Self> {
        match value {
            0 => Ok(PointerKind::Mbox),
            1 => Ok(PointerKind::Maildir),
            1000 => Ok(PointerKind::Remote),
            _ => Err(trc::StoreEvent::DataCorruption
                .caused_by(trc::location!())
                .details("unknown pointer type")
                .ctx(trc::Key::Value, value)),
        }
    }

    pub fn is_local_file(self) -> bool {
        matches!(self, PointerKind::Mbox | PointerKind::Maildir)
    }
}

/// Where a copy of the message lives: `(ptr_type, mailbox, offset,
/// header_len, message_len)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pointer {
    pub kind: PointerKind,
    pub mailbox: String,
    pub offset: u64,
    pub header_length: u32,
    pub message_length: u32,
}

impl Pointer {
    pub fn new(
        kind: PointerKind,
        mailbox: impl Into<String>,
        offset: u64,
        header_length: u32,
        message_length: u32,
    ) -> Self {
        Pointer {
            kind,
            mailbox: mailbox.into(),
            offset,
            header_length,
            message_length,
        }
    }

    /// The container a pointer belongs to; for maildir pointers the
    /// filename is stripped so all messages of one maildir share it.
    pub fn container(&self) -> &str {
        if self.kind == PointerKind::Maildir {
            self.mailbox
                .rsplit_once('/')
                .map(|(dir, _)| dir)
                .unwrap_or(&self.mailbox)
        } else {
            &self.mailbox
        }
    }

    fn to_value(&self) -> Value {
        Value::List(vec![
            Value::Int(self.kind.as_int()),
            Value::Text(self.mailbox.clone()),
            Value::Int(self.offset as i64),
            Value::Int(self.header_length as i64),
            Value::Int(self.message_length as i64),
        ])
    }

    fn from_value(value: &Value) -> trc::Result<Self> {
        let fields = match value {
            Value::List(fields) | Value::Tuple(fields) if fields.len() == 5 => fields,
            _ => {
                return Err(trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .details("malformed pointer tuple"));
            }
        };
        let int = |value: &Value| {
            value.as_int().ok_or_else(|| {
                trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .details("malformed pointer field")
            })
        };
        Ok(Pointer {
            kind: PointerKind::from_int(int(&fields[0])?)?,
            mailbox: fields[1]
                .as_str()
                .ok_or_else(|| {
                    trc::StoreEvent::DataCorruption
                        .caused_by(trc::location!())
                        .details("malformed pointer mailbox")
                })?
                .to_string(),
            offset: int(&fields[2])? as u64,
            header_length: int(&fields[3])? as u32,
            message_length: int(&fields[4])? as u32,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub timestamp: u64,
    pub idx: u32,
    pointers: Vec<Pointer>,
    headers: String,
    pub more: BTreeMap<String, Value>,
    /// Filled in from the side columns when fetched from a store.
    pub thread_id: Option<u32>,
    pub mtime: u64,
}

macro_rules! header_regex {
    ($name:literal) => {{
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(concat!(r"(?im)^", $name, r":[ \t]*(.*)$")).unwrap()
        });
        &RE
    }};
}

impl Metadata {
    pub fn new(
        timestamp: u64,
        pointers: Vec<Pointer>,
        headers: impl AsRef<str>,
        more: BTreeMap<String, Value>,
    ) -> Self {
        let headers = headers.as_ref().replace('\r', "");
        let mut md = Metadata {
            timestamp,
            idx: 0,
            pointers: Vec::new(),
            headers,
            more,
            thread_id: None,
            mtime: 0,
        };
        md.add_pointers(pointers);
        if md.timestamp == 0 {
            if let Some(date) = md.header("date") {
                if let Some(ts) = parse_date(date) {
                    md.timestamp = ts;
                }
            }
        }
        md
    }

    /// Placeholder for a referenced-but-unseen message: no pointers, a
    /// synthetic headers blob holding only the Message-Id.
    pub fn ghost(msgid: &str, more: Option<BTreeMap<String, Value>>) -> Self {
        Metadata::new(
            0,
            Vec::new(),
            format!("Message-Id: {msgid}"),
            more.unwrap_or_default(),
        )
    }

    pub fn is_ghost(&self) -> bool {
        self.pointers.is_empty()
    }

    /// The verbatim normalised header blob.
    pub fn headers(&self) -> &str {
        &self.headers
    }

    pub fn pointers(&self) -> &[Pointer] {
        &self.pointers
    }

    /// Merges pointers, deduplicating by container; a newer pointer
    /// replaces an older one for the same container.
    pub fn add_pointers(&mut self, pointers: impl IntoIterator<Item = Pointer>) {
        for pointer in pointers {
            self.pointers
                .retain(|existing| existing.container() != pointer.container());
            self.pointers.push(pointer);
        }
        self.pointers.sort();
    }

    /// Raw header lookup over the normalised blob. Only the headers kept
    /// by the extractor can be found here.
    pub fn header(&self, name: &str) -> Option<&str> {
        let regex = match name.to_ascii_lowercase().as_str() {
            "date" => header_regex!("date"),
            "message-id" => header_regex!("message-id"),
            "in-reply-to" => header_regex!("in-reply-to"),
            "from" => header_regex!("from"),
            "to" => header_regex!("to"),
            "cc" => header_regex!("cc"),
            "subject" => header_regex!("subject"),
            _ => return None,
        };
        regex
            .captures(&self.headers)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().trim())
            .filter(|value| !value.is_empty())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("message-id")
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        self.header("in-reply-to")
    }

    /// The message UUID: sha1 over the byte-sorted lines of the header
    /// blob. Stable under header reordering and pointer changes.
    pub fn uuid(&self) -> [u8; 20] {
        let mut lines: Vec<&str> = self.headers.trim().lines().collect();
        lines.sort_unstable();
        let mut hasher = Sha1::new();
        for line in lines {
            hasher.update(line.as_bytes());
        }
        hasher.finalize().into()
    }

    pub fn uuid_ascii(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.uuid())
    }

    fn to_value(&self) -> Value {
        Value::Tuple(vec![
            Value::Int(self.timestamp as i64),
            Value::Int(self.idx as i64),
            Value::List(self.pointers.iter().map(Pointer::to_value).collect()),
            Value::Text(self.headers.clone()),
            Value::Map(self.more.clone()),
        ])
    }

    fn from_value(value: Value) -> trc::Result<Self> {
        let fields = match value {
            Value::Tuple(fields) | Value::List(fields) if fields.len() == 5 => fields,
            _ => {
                return Err(trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .details("malformed metadata tuple"));
            }
        };
        let mut fields = fields.into_iter();
        let timestamp = fields.next().unwrap().as_int().unwrap_or(0) as u64;
        let idx = fields.next().unwrap().as_int().unwrap_or(0) as u32;
        let pointers = match fields.next().unwrap() {
            Value::List(items) | Value::Tuple(items) => items
                .iter()
                .map(Pointer::from_value)
                .collect::<trc::Result<Vec<_>>>()?,
            _ => {
                return Err(trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .details("malformed metadata pointers"));
            }
        };
        let headers = match fields.next().unwrap() {
            Value::Text(headers) => headers,
            _ => {
                return Err(trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .details("malformed metadata headers"));
            }
        };
        let more = match fields.next().unwrap() {
            Value::Map(more) => more,
            _ => BTreeMap::new(),
        };
        Ok(Metadata {
            timestamp,
            idx,
            pointers,
            headers,
            more,
            thread_id: None,
            mtime: 0,
        })
    }
}

impl Serialize for Metadata {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        self.to_value().serialize()
    }
}

impl Deserialize for Metadata {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        Value::deserialize(bytes).and_then(Metadata::from_value)
    }
}

/// Parses an RFC2822 Date header, tolerating trailing comments.
pub fn parse_date(value: &str) -> Option<u64> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .ok()
        .or_else(|| {
            value
                .split_once(" (")
                .and_then(|(date, _)| DateTime::parse_from_rfc2822(date.trim()).ok())
        })
        .map(|date| date.timestamp().max(0) as u64)
}

/// Timestamp from an mbox `From ` separator line, e.g.
/// `From oe@example.org Sat Jan  3 01:05:34 1996`.
pub fn parse_mbox_separator(line: &str) -> Option<u64> {
    let rest = line.strip_prefix("From ")?;
    let (_, date) = rest.split_once(char::is_whitespace)?;
    NaiveDateTime::parse_from_str(date.trim(), "%a %b %e %H:%M:%S %Y")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp().max(0) as u64)
}

/// The median of the dates carried by Received headers, used when a
/// message has no usable Date header.
pub fn received_median(received: &[&str]) -> Option<u64> {
    let mut stamps: Vec<u64> = received
        .iter()
        .filter_map(|header| header.rsplit_once(';').map(|(_, date)| date))
        .filter_map(parse_date)
        .collect();
    if stamps.is_empty() {
        return None;
    }
    stamps.sort_unstable();
    Some(stamps[stamps.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADERS_A: &str = "From: Bjarni <bre@example.org>\r\n\
        To: bre@example.org\r\n\
        Subject: This is Great\r\n";
    const HEADERS_B: &str = "To: bre@example.org\n\
        From: Bjarni <bre@example.org>\n\
        Subject: This is Great";

    #[test]
    fn uuid_is_stable_under_reordering() {
        let md1 = Metadata::new(
            0,
            vec![Pointer::new(PointerKind::Mbox, "/home/mbx", 0, 100, 200)],
            HEADERS_A,
            BTreeMap::new(),
        );
        let md2 = Metadata::new(
            0,
            vec![Pointer::new(PointerKind::Maildir, "/tmp/cur/test", 0, 100, 200)],
            HEADERS_B,
            BTreeMap::new(),
        );
        assert_eq!(md1.uuid(), md2.uuid());
        assert_eq!(md1.uuid_ascii(), md2.uuid_ascii());
        assert_eq!(md1.uuid_ascii().len(), 27);
    }

    #[test]
    fn pointer_containers() {
        let mbox = Pointer::new(PointerKind::Mbox, "/home/mail.mbx", 0, 0, 0);
        assert_eq!(mbox.container(), "/home/mail.mbx");
        let maildir = Pointer::new(PointerKind::Maildir, "/home/md/cur/x:2,S", 0, 0, 0);
        assert_eq!(maildir.container(), "/home/md/cur");
    }

    #[test]
    fn pointers_replace_by_container() {
        let mut md = Metadata::new(
            0,
            vec![Pointer::new(PointerKind::Mbox, "/home/mbx", 0, 100, 200)],
            HEADERS_A,
            BTreeMap::new(),
        );
        md.add_pointers([Pointer::new(PointerKind::Mbox, "/dev/null", 0, 200, 200)]);
        md.add_pointers([Pointer::new(PointerKind::Mbox, "/home/mbx", 0, 300, 300)]);
        assert_eq!(md.pointers().len(), 2);
        let replaced = md
            .pointers()
            .iter()
            .find(|ptr| ptr.mailbox == "/home/mbx")
            .unwrap();
        assert_eq!(replaced.header_length, 300);
        let uuid = md.uuid();
        md.add_pointers([Pointer::new(PointerKind::Mbox, "/dev/null", 0, 100, 200)]);
        assert_eq!(md.pointers().len(), 2);
        assert_eq!(md.uuid(), uuid);
    }

    #[test]
    fn header_lookup() {
        let md = Metadata::new(
            0,
            Vec::new(),
            "Date: Wed, 1 Sep 2021 00:03:01 GMT\n\
             Message-Id: <a@example.org>\n\
             In-Reply-To: <b@example.org>\n\
             Subject: Sure, sure",
            BTreeMap::new(),
        );
        assert_eq!(md.message_id(), Some("<a@example.org>"));
        assert_eq!(md.in_reply_to(), Some("<b@example.org>"));
        assert_eq!(md.header("subject"), Some("Sure, sure"));
        assert_eq!(md.header("cc"), None);
        assert!(md.timestamp > 1_600_000_000);
    }

    #[test]
    fn ghost_shape() {
        let ghost = Metadata::ghost("<missing@example.org>", None);
        assert!(ghost.is_ghost());
        assert_eq!(ghost.message_id(), Some("<missing@example.org>"));
        assert_eq!(ghost.timestamp, 0);
    }

    #[test]
    fn serialization_roundtrip() {
        let mut more = BTreeMap::new();
        more.insert("tags".to_string(), Value::Text("inbox,unread".into()));
        let md = Metadata::new(
            1_630_000_000,
            vec![Pointer::new(PointerKind::Mbox, "/home/mbx", 17, 100, 200)],
            HEADERS_A,
            more,
        );
        let encoded = md.serialize().unwrap();
        assert_eq!(encoded[0], b't');
        let decoded = Metadata::deserialize(&encoded).unwrap();
        assert_eq!(decoded.timestamp, md.timestamp);
        assert_eq!(decoded.pointers(), md.pointers());
        assert_eq!(decoded.headers(), md.headers());
        assert_eq!(decoded.more, md.more);
    }

    #[test]
    fn date_fallbacks() {
        assert!(parse_date("Wed, 1 Sep 2021 00:03:01 +0000").is_some());
        assert!(parse_date("Wed, 1 Sep 2021 00:03:01 GMT (comment)").is_some());
        assert_eq!(parse_date("not a date"), None);
        assert!(parse_mbox_separator("From oe@example.org Sat Jan  3 01:05:34 1996").is_some());
        let median = received_median(&[
            "from a by b; Wed, 1 Sep 2021 00:03:01 +0000",
            "from c by d; Wed, 1 Sep 2021 00:05:01 +0000",
            "from e by f; Wed, 1 Sep 2021 00:07:01 +0000",
        ])
        .unwrap();
        assert_eq!(median, parse_date("Wed, 1 Sep 2021 00:05:01 +0000").unwrap());
    }
}
