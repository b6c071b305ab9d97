use std::collections::HashMap;

use serde::Serialize;

/// Header names every input must provide.
pub const REQUIRED_HEADERS: [&str; 4] = ["name", "age", "banner_id", "cookie"];

/// A single input row: trimmed string fields keyed by header name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    fields: HashMap<String, String>,
}

impl RawRow {
    pub fn new(fields: HashMap<String, String>) -> Self {
        Self { fields }
    }

    /// Build a row from parallel header and value slices. Missing values become empty strings.
    pub fn from_pairs<H, V>(headers: &[H], values: &[V]) -> Self
    where
        H: AsRef<str>,
        V: AsRef<str>,
    {
        let fields = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                let value = values.get(i).map(|v| v.as_ref().trim()).unwrap_or("");
                (header.as_ref().trim().to_owned(), value.to_owned())
            })
            .collect();

        Self { fields }
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.fields.get(header).map(String::as_str)
    }

    /// Value of `header`, or the empty string when the row has no such field.
    pub fn value(&self, header: &str) -> &str {
        self.get(header).unwrap_or("")
    }

    pub fn is_blank(&self) -> bool {
        self.fields.values().all(|v| v.trim().is_empty())
    }
}

/// A row that passed every field validator. Serializes to the bulk endpoint's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedRecord {
    pub name: String,
    pub age: i64,
    pub banner_id: u8,
    pub cookie: String,
}

impl ValidatedRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            cookie: self.cookie.clone(),
            banner_id: self.banner_id,
        }
    }
}

/// Identity of a record for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub cookie: String,
    pub banner_id: u8,
}

impl DedupKey {
    pub fn new(cookie: impl Into<String>, banner_id: u8) -> Self {
        Self {
            cookie: cookie.into(),
            banner_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_trims_and_pads() {
        let row = RawRow::from_pairs(&[" name ", "age", "cookie"], &["  Alice ", "25"]);

        assert_eq!(row.get("name"), Some("Alice"));
        assert_eq!(row.get("age"), Some("25"));
        assert_eq!(row.get("cookie"), Some(""));
        assert_eq!(row.get("banner_id"), None);
        assert_eq!(row.value("banner_id"), "");
    }

    #[test]
    fn test_blank_row() {
        assert!(RawRow::from_pairs(&["a", "b"], &["  ", ""]).is_blank());
        assert!(!RawRow::from_pairs(&["a", "b"], &["", "x"]).is_blank());
    }

    #[test]
    fn test_record_wire_format() {
        let record = ValidatedRecord {
            name: "Alice".to_owned(),
            age: 25,
            banner_id: 5,
            cookie: "00000000-0000-0000-0000-000000000001".to_owned(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "Alice",
                "age": 25,
                "banner_id": 5,
                "cookie": "00000000-0000-0000-0000-000000000001",
            })
        );
        assert_eq!(
            record.dedup_key(),
            DedupKey::new("00000000-0000-0000-0000-000000000001", 5)
        );
    }
}
