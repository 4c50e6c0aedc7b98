use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod protocol;

/// Identifier of a data publisher (one sensor), stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublisherId(pub u64);

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PublisherId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        input
            .trim()
            .parse::<u64>()
            .map(PublisherId)
            .map_err(|err| format!("invalid publisher id '{input}': {err}"))
    }
}

impl From<u64> for PublisherId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One sample pushed by a publisher. Times are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub pub_id: PublisherId,
    pub eco2: f64,
    pub evtoc: f64,
    pub read_time: u64,
    pub start_time: u64,
    pub increment: String,
}

/// Which window of readings a cursor addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Anchor {
    /// The ever-growing window of readings pushed over the channel.
    Live,
    /// One fixed historical page: at most `limit` readings strictly before `before`.
    Page { before: u64, limit: u16 },
}

/// Key of one cached reading window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub publisher: PublisherId,
    pub anchor: Anchor,
}

impl Cursor {
    pub fn live(publisher: PublisherId) -> Self {
        Self {
            publisher,
            anchor: Anchor::Live,
        }
    }

    pub fn page(publisher: PublisherId, before: u64, limit: u16) -> Self {
        Self {
            publisher,
            anchor: Anchor::Page { before, limit },
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.anchor, Anchor::Live)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.anchor {
            Anchor::Live => write!(f, "{}|live", self.publisher),
            Anchor::Page { before, limit } => write!(f, "{}|{}|{}", self.publisher, before, limit),
        }
    }
}

impl FromStr for Cursor {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.trim().split('|').collect();
        match parts.as_slice() {
            [publisher, "live"] => Ok(Cursor::live(publisher.parse()?)),
            [publisher, before, limit] => {
                let before = before
                    .parse::<u64>()
                    .map_err(|err| format!("invalid cursor before '{before}': {err}"))?;
                let limit = limit
                    .parse::<u16>()
                    .map_err(|err| format!("invalid cursor limit '{limit}': {err}"))?;
                Ok(Cursor::page(publisher.parse()?, before, limit))
            }
            _ => Err(format!("invalid cursor: {input}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Info,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Info => "info",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-text message relayed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_display_matches_cache_key_format() {
        assert_eq!(Cursor::live(PublisherId(42)).to_string(), "42|live");
        assert_eq!(Cursor::page(PublisherId(42), 1000, 10).to_string(), "42|1000|10");
    }

    #[test]
    fn cursor_parses_both_anchor_forms() {
        assert_eq!("7|live".parse::<Cursor>(), Ok(Cursor::live(PublisherId(7))));
        assert_eq!(
            "7|1700000000|25".parse::<Cursor>(),
            Ok(Cursor::page(PublisherId(7), 1_700_000_000, 25))
        );
        assert!("7|soon".parse::<Cursor>().is_err());
        assert!("x|live".parse::<Cursor>().is_err());
    }

    #[test]
    fn live_cursor_sorts_before_pages_of_same_publisher() {
        let mut cursors = vec![
            Cursor::page(PublisherId(1), 500, 10),
            Cursor::live(PublisherId(2)),
            Cursor::live(PublisherId(1)),
        ];
        cursors.sort();
        assert_eq!(cursors[0], Cursor::live(PublisherId(1)));
        assert_eq!(cursors[2], Cursor::live(PublisherId(2)));
    }

    #[test]
    fn reading_uses_wire_field_names() {
        let reading: Reading = serde_json::from_str(
            r#"{"pub_id":42,"eco2":400,"evtoc":1.5,"read_time":1000,"start_time":900,"increment":"5m"}"#,
        )
        .expect("parse reading");
        assert_eq!(reading.pub_id, PublisherId(42));
        assert_eq!(reading.eco2, 400.0);
        assert_eq!(reading.evtoc, 1.5);
        assert_eq!(reading.read_time, 1000);
        assert_eq!(reading.increment, "5m");

        let encoded = serde_json::to_value(&reading).expect("encode reading");
        assert_eq!(encoded["pub_id"], 42);
        assert_eq!(encoded["start_time"], 900);
    }

    #[test]
    fn measurements_must_be_json_numbers() {
        let quoted = r#"{"pub_id":42,"eco2":"NaN","evtoc":1,"read_time":1000,"start_time":900,"increment":"5m"}"#;
        assert!(serde_json::from_str::<Reading>(quoted).is_err());
        let numeric = r#"{"pub_id":42,"eco2":"400","evtoc":1,"read_time":1000,"start_time":900,"increment":"5m"}"#;
        assert!(serde_json::from_str::<Reading>(numeric).is_err());
    }

    #[test]
    fn reading_rejects_missing_fields() {
        let result = serde_json::from_str::<Reading>(r#"{"pub_id":42,"eco2":400}"#);
        assert!(result.is_err());
    }
}
