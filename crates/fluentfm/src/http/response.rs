//! Response interpretation for the Data API envelope
//!
//! Every reply carries a `messages` array whose first entry encodes the
//! outcome, plus a `response` object with the payload. The handler decodes
//! the envelope once and answers the dispatcher's questions: did it fail
//! (and how), which records came back, which id was created.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::{Page, Record};

/// FileMaker message code for "no records match the request" — an empty
/// result, not a failure, and unrelated to HTTP 401.
const CODE_NO_MATCH: i64 = 401;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    messages: Option<Vec<Message>>,
    #[serde(default)]
    response: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    #[serde(default)]
    data: Option<Vec<DataEntry>>,
    #[serde(default)]
    data_info: Option<DataInfo>,
    #[serde(default)]
    record_id: Option<Value>,
    #[serde(default)]
    field_meta_data: Option<Vec<FieldMeta>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataEntry {
    #[serde(default)]
    record_id: Value,
    #[serde(default)]
    mod_id: Value,
    #[serde(default)]
    field_data: Map<String, Value>,
    #[serde(default)]
    portal_data: Option<HashMap<String, Vec<Map<String, Value>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataInfo {
    #[serde(default)]
    found_count: u64,
}

#[derive(Debug, Deserialize)]
struct FieldMeta {
    name: String,
}

/// The Data API sends numeric ids and codes as JSON strings; accept either.
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Decoded response plus the query that produced it (kept for diagnostics)
pub struct ResponseHandler {
    status: u16,
    envelope: Option<Envelope>,
    query: Value,
}

impl ResponseHandler {
    /// Parse a raw response body. Bodies that are not the message envelope
    /// (container downloads, raw pass-through) decode to `None` and are
    /// treated as success.
    pub fn new(status: u16, body: &str, query: Value) -> Self {
        Self {
            status,
            envelope: serde_json::from_str(body).ok(),
            query,
        }
    }

    /// Parse and immediately run the error-code check
    pub fn check_result(status: u16, body: &str, query: Value) -> Result<Self> {
        let handler = Self::new(status, body, query);
        handler.check()?;
        Ok(handler)
    }

    fn first_code(&self) -> Option<i64> {
        self.envelope
            .as_ref()
            .and_then(|e| e.messages.as_ref())
            .and_then(|m| m.first())
            .and_then(|m| as_i64(&m.code))
    }

    /// Whether the server reported "no records match" (an empty result)
    pub fn is_no_match(&self) -> bool {
        self.first_code() == Some(CODE_NO_MATCH)
    }

    /// Map the response onto the error taxonomy.
    ///
    /// Code 0 and the no-match code pass; 3, 102, 509 and 952 map to their
    /// typed variants; any other non-zero code becomes a generic API error.
    /// HTTP 503 fails regardless of the body, and a bare HTTP 401 with no
    /// envelope is an invalid-token report.
    pub fn check(&self) -> Result<()> {
        if self.status == 503 {
            return Err(Error::ServiceUnavailable);
        }

        let message = match self
            .envelope
            .as_ref()
            .and_then(|e| e.messages.as_ref())
            .and_then(|m| m.first())
        {
            Some(message) => message,
            None => {
                if self.status == 401 {
                    return Err(Error::TokenInvalid);
                }
                return Ok(());
            }
        };

        let code = as_i64(&message.code).unwrap_or(-1);
        match code {
            0 | CODE_NO_MATCH => Ok(()),
            3 => Err(Error::ConnectionRefused),
            102 => Err(Error::FieldMissing {
                message: format!(
                    "{}. The server does not say which field; check that the layout \
                     has every referenced field (soft deletes need `deleted_at`, \
                     latest/oldest need `created_at`/`updated_at`)",
                    message.message
                ),
                query: self.query.clone(),
            }),
            509 => Err(Error::FieldInvalid {
                message: self.field_invalid_message(&message.message),
                query: self.query.clone(),
            }),
            952 => Err(Error::TokenInvalid),
            code => Err(Error::Api {
                code,
                message: message.message.clone(),
                query: self.query.clone(),
            }),
        }
    }

    fn field_invalid_message(&self, server_message: &str) -> String {
        let dump = self.query.to_string();
        let mut message = format!(
            "{}. Ensure required fields are present and unique fields are not \
             duplicated",
            server_message
        );
        if !dump.contains("\"id\"") && !dump.contains("\"ids\"") {
            message.push_str(
                "; the payload appears to be missing the `id` field, which is \
                 likely the problem",
            );
        }
        message
    }

    /// Normalize the returned records, keyed order preserved
    pub fn records(&self, with_portals: bool) -> Vec<Record> {
        let entries = match self
            .envelope
            .as_ref()
            .and_then(|e| e.response.as_ref())
            .and_then(|r| r.data.as_ref())
        {
            Some(entries) => entries,
            None => return Vec::new(),
        };

        entries
            .iter()
            .map(|entry| Record {
                record_id: as_i64(&entry.record_id).unwrap_or_default(),
                mod_id: as_i64(&entry.mod_id),
                fields: entry.field_data.clone(),
                portals: if with_portals {
                    entry.portal_data.clone()
                } else {
                    None
                },
            })
            .collect()
    }

    /// Id of a freshly created record
    pub fn record_id(&self) -> Result<i64> {
        self.envelope
            .as_ref()
            .and_then(|e| e.response.as_ref())
            .and_then(|r| r.record_id.as_ref())
            .and_then(as_i64)
            .ok_or_else(|| Error::Api {
                code: -1,
                message: "response did not include a recordId".to_string(),
                query: self.query.clone(),
            })
    }

    /// Wrap the records plus `dataInfo.foundCount` into one page. A no-match
    /// reply yields an empty page with a zero total rather than an error.
    pub fn paginated(&self, page: u64, per_page: u64, with_portals: bool) -> Page {
        let total_count = if self.is_no_match() {
            0
        } else {
            self.envelope
                .as_ref()
                .and_then(|e| e.response.as_ref())
                .and_then(|r| r.data_info.as_ref())
                .map(|info| info.found_count)
                .unwrap_or(0)
        };

        Page {
            records: self.records(with_portals),
            total_count,
            page,
            per_page,
        }
    }

    /// Field names from layout metadata
    pub fn field_names(&self) -> Vec<String> {
        self.envelope
            .as_ref()
            .and_then(|e| e.response.as_ref())
            .and_then(|r| r.field_meta_data.as_ref())
            .map(|fields| fields.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(status: u16, body: Value) -> ResponseHandler {
        ResponseHandler::new(status, &body.to_string(), json!({}))
    }

    #[test]
    fn test_success_yields_records() {
        let h = handler(
            200,
            json!({
                "response": {"data": [{"recordId": "1", "fieldData": {"name": "a"}}]},
                "messages": [{"code": "0"}]
            }),
        );
        h.check().unwrap();

        let records = h.records(false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, 1);
        assert_eq!(records[0].get_str("name"), Some("a"));
        assert!(records[0].portals.is_none());
    }

    #[test]
    fn test_no_match_is_not_an_error() {
        let h = handler(
            200,
            json!({"messages": [{"code": "401", "message": "No records match the request"}]}),
        );
        h.check().unwrap();
        assert!(h.is_no_match());
        assert!(h.records(false).is_empty());
    }

    #[test]
    fn test_code_mapping() {
        let codes = [
            (3, "refused"),
            (952, "invalid token"),
            (100, "generic"),
        ];
        for (code, _) in codes {
            let h = handler(
                200,
                json!({"messages": [{"code": code.to_string(), "message": "x"}]}),
            );
            let err = h.check().unwrap_err();
            match code {
                3 => assert!(matches!(err, Error::ConnectionRefused)),
                952 => assert!(matches!(err, Error::TokenInvalid)),
                _ => assert!(matches!(err, Error::Api { code: 100, .. })),
            }
        }
    }

    #[test]
    fn test_http_503_overrides_body() {
        let h = handler(503, json!({"messages": [{"code": "0"}]}));
        assert!(matches!(h.check(), Err(Error::ServiceUnavailable)));
    }

    #[test]
    fn test_bare_401_is_invalid_token() {
        let h = ResponseHandler::new(401, "", json!({}));
        assert!(matches!(h.check(), Err(Error::TokenInvalid)));
    }

    #[test]
    fn test_non_envelope_body_passes() {
        let h = ResponseHandler::new(200, "%PDF-1.4 binary", json!({}));
        h.check().unwrap();
    }

    #[test]
    fn test_field_invalid_flags_missing_id() {
        let query = json!({"fieldData": {"name": "bob"}});
        let h = ResponseHandler::new(
            200,
            &json!({"messages": [{"code": "509", "message": "Field validation failed"}]})
                .to_string(),
            query,
        );
        match h.check() {
            Err(Error::FieldInvalid { message, .. }) => {
                assert!(message.contains("missing the `id` field"));
            }
            other => panic!("expected FieldInvalid, got {:?}", other),
        }
    }

    #[test]
    fn test_field_invalid_with_id_present_has_no_note() {
        let query = json!({"fieldData": {"id": "x"}});
        let h = ResponseHandler::new(
            200,
            &json!({"messages": [{"code": "509", "message": "Field validation failed"}]})
                .to_string(),
            query,
        );
        match h.check() {
            Err(Error::FieldInvalid { message, .. }) => {
                assert!(!message.contains("missing the `id` field"));
            }
            other => panic!("expected FieldInvalid, got {:?}", other),
        }
    }

    #[test]
    fn test_field_missing_embeds_query() {
        let query = json!({"query": [{"deleted_at": "="}]});
        let h = ResponseHandler::new(
            200,
            &json!({"messages": [{"code": "102", "message": "Field is missing"}]}).to_string(),
            query,
        );
        let err = h.check().unwrap_err();
        assert!(err.to_string().contains("deleted_at"));
    }

    #[test]
    fn test_record_id_extraction() {
        let h = handler(
            200,
            json!({"response": {"recordId": "392"}, "messages": [{"code": "0"}]}),
        );
        assert_eq!(h.record_id().unwrap(), 392);
    }

    #[test]
    fn test_paginated_counts() {
        let h = handler(
            200,
            json!({
                "response": {
                    "dataInfo": {"foundCount": 57, "returnedCount": 10},
                    "data": [{"recordId": "1", "fieldData": {}}]
                },
                "messages": [{"code": "0"}]
            }),
        );
        let page = h.paginated(2, 10, false);
        assert_eq!(page.total_count, 57);
        assert_eq!(page.page, 2);
        assert_eq!(page.page_count(), 6);
    }

    #[test]
    fn test_paginated_no_match_zero_total() {
        let h = handler(200, json!({"messages": [{"code": "401"}]}));
        let page = h.paginated(1, 10, false);
        assert_eq!(page.total_count, 0);
        assert!(page.records.is_empty());
        assert_eq!(page.page_count(), 0);
    }

    #[test]
    fn test_portals_included_on_request() {
        let body = json!({
            "response": {"data": [{
                "recordId": "5",
                "modId": "2",
                "fieldData": {"name": "a"},
                "portalData": {"notes": [{"text": "hi"}]}
            }]},
            "messages": [{"code": "0"}]
        });
        let h = handler(200, body);

        let with = h.records(true);
        assert_eq!(with[0].mod_id, Some(2));
        assert!(with[0].portals.as_ref().unwrap().contains_key("notes"));

        let without = h.records(false);
        assert!(without[0].portals.is_none());
    }

    #[test]
    fn test_field_names_from_metadata() {
        let h = handler(
            200,
            json!({
                "response": {"fieldMetaData": [{"name": "id", "type": "normal"}, {"name": "name", "type": "normal"}]},
                "messages": [{"code": "0"}]
            }),
        );
        assert_eq!(h.field_names(), ["id", "name"]);
    }
}
