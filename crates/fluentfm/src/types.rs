//! Result types returned by the FluentFM client

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single FileMaker record, normalized from the Data API envelope.
///
/// `record_id` is always present even when the layout does not expose it as
/// a field; `portals` is populated only when portal inclusion was requested
/// on the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: i64,
    pub mod_id: Option<i64>,
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portals: Option<HashMap<String, Vec<Map<String, Value>>>>,
}

impl Record {
    /// Look up a field value by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value as a string slice, when it is one
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// One page of a paginated find result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<Record>,
    pub total_count: u64,
    /// 1-based page number that was requested
    pub page: u64,
    pub per_page: u64,
}

impl Page {
    /// Number of pages needed to cover `total_count` at `per_page`
    pub fn page_count(&self) -> u64 {
        if self.per_page == 0 {
            return 0;
        }
        self.total_count.div_ceil(self.per_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: i64) -> Record {
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!("a"));
        Record {
            record_id: id,
            mod_id: None,
            fields,
            portals: None,
        }
    }

    #[test]
    fn test_field_access() {
        let rec = record(7);
        assert_eq!(rec.get_str("name"), Some("a"));
        assert_eq!(rec.get("missing"), None);
    }

    #[test]
    fn test_page_count() {
        let page = Page {
            records: vec![record(1)],
            total_count: 21,
            page: 1,
            per_page: 10,
        };
        assert_eq!(page.page_count(), 3);

        let exact = Page {
            records: vec![],
            total_count: 20,
            page: 2,
            per_page: 10,
        };
        assert_eq!(exact.page_count(), 2);
    }
}
