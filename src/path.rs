//! Destination paths of migrated messages.
//!
//! A destination path is `{yyyy}-{mm}-{dd}/{descriptor_id}[_{suffix}].eml`.
//! The descriptor id is written into the file name on purpose, so that a
//! prior delivery can be recognised from any object key ending in such a
//! path without pattern matching on free-form keys.

use std::fmt;

use chrono::{NaiveDate, Utc};

use crate::archive::ArchiveMessage;

const EXTENSION: &str = ".eml";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationPath {
    date: NaiveDate,
    descriptor_id: u64,
    suffix: Option<String>,
}

impl DestinationPath {
    pub fn new(date: NaiveDate, descriptor_id: u64, suffix: Option<String>) -> Self {
        Self {
            date,
            descriptor_id,
            suffix: suffix.filter(|s| !s.is_empty()),
        }
    }

    /// Path for `message`, dated by delivery time, then creation time, then
    /// today.
    pub fn for_message<M: ArchiveMessage + ?Sized>(message: &M, suffix: Option<&str>) -> Self {
        let date = message
            .delivery_time()
            .or_else(|| message.creation_time())
            .unwrap_or_else(Utc::now)
            .date_naive();
        Self::new(date, message.descriptor_id(), suffix.map(str::to_string))
    }

    pub fn descriptor_id(&self) -> u64 {
        self.descriptor_id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Recover a destination path from the tail of an object key.
    ///
    /// Any prefix before the date segment is ignored. Returns `None` when
    /// the key does not end in a well-formed destination path.
    pub fn parse_key(key: &str) -> Option<Self> {
        let mut segments = key.trim_end_matches('/').rsplit('/');
        let file = segments.next()?;
        let date = NaiveDate::parse_from_str(segments.next()?, DATE_FORMAT).ok()?;

        let stem = file.strip_suffix(EXTENSION)?;
        let (id, suffix) = match stem.split_once('_') {
            Some((id, suffix)) => (id, Some(suffix.to_string())),
            None => (stem, None),
        };
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self::new(date, id.parse().ok()?, suffix))
    }
}

impl fmt::Display for DestinationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date.format(DATE_FORMAT), self.descriptor_id)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "_{suffix}")?;
        }
        f.write_str(EXTENSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 3, 7).unwrap()
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DestinationPath::new(date(), 2097252, None).to_string(),
            "2023-03-07/2097252.eml"
        );
        assert_eq!(
            DestinationPath::new(date(), 42, Some("b2".into())).to_string(),
            "2023-03-07/42_b2.eml"
        );
    }

    #[test]
    fn test_parse_key_with_prefix() {
        let path = DestinationPath::parse_key("acme/ops@acme.test/2023-03-07/42_b2.eml").unwrap();
        assert_eq!(path.descriptor_id(), 42);
        assert_eq!(path, DestinationPath::new(date(), 42, Some("b2".into())));
    }

    #[test]
    fn test_parse_key_without_suffix() {
        let path = DestinationPath::parse_key("2023-03-07/2097252.eml").unwrap();
        assert_eq!(path.descriptor_id(), 2097252);
    }

    #[test]
    fn test_parse_key_rejects_malformed() {
        for key in [
            "",
            "42.eml",
            "2023-03-07/42.txt",
            "2023-03-07/abc.eml",
            "2023-03-07/_x.eml",
            "not-a-date/42.eml",
            "2023-03-07/-42.eml",
        ] {
            assert!(DestinationPath::parse_key(key).is_none(), "{key}");
        }
    }
}
