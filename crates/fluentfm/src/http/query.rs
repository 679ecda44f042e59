//! Query state for the fluent chain
//!
//! Accumulates filter/sort/limit/offset/script clauses and serializes them to
//! the two wire shapes the Data API uses: underscore-prefixed GET query
//! parameters, and the JSON body of a `_find` request. The dispatcher owns
//! one `Query` per chain and resets it after every flush.

use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

/// Direction (or value-list name) for one sort clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortOrder {
    Ascend,
    Descend,
    /// Sort by a FileMaker value list, by name
    ValueList(String),
}

impl SortOrder {
    pub fn as_str(&self) -> &str {
        match self {
            SortOrder::Ascend => "ascend",
            SortOrder::Descend => "descend",
            SortOrder::ValueList(name) => name,
        }
    }
}

impl Serialize for SortOrder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One entry in the ordered sort list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sort {
    #[serde(rename = "fieldName")]
    pub field_name: String,
    #[serde(rename = "sortOrder")]
    pub sort_order: SortOrder,
}

/// Find criteria: either structured groups (OR across groups, AND within
/// one group) or a raw pass-through value set by `where_criteria`.
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    Groups(Vec<Map<String, Value>>),
    Raw(Value),
}

/// A script call attached to one of the three request phases
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    pub name: String,
    pub param: Option<String>,
}

/// Accumulated query clauses for one chain
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub portal_limits: Vec<(String, u64)>,
    pub sort: Vec<Sort>,
    pub criteria: Option<Criteria>,
    pub script: Option<ScriptCall>,
    pub script_prerequest: Option<ScriptCall>,
    pub script_presort: Option<ScriptCall>,
    pub with_portals: bool,
    pub with_deleted: bool,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Query {
    pub fn new() -> Self {
        Self {
            limit: None,
            offset: None,
            portal_limits: Vec::new(),
            sort: Vec::new(),
            criteria: None,
            script: None,
            script_prerequest: None,
            script_presort: None,
            with_portals: false,
            with_deleted: true,
        }
    }

    /// Reset every clause to its chain-start default
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Encode variadic where-parameters the way the Data API expects:
    /// one value means equality, two mean operator + value, three or more
    /// collapse to the match-anything wildcard.
    pub fn encode_params(params: &[String]) -> String {
        match params {
            [value] => format!("={}", value),
            [op, value] => format!("{}{}", op, value),
            _ => "*".to_string(),
        }
    }

    /// Add (or overwrite) a criterion on the first criteria group.
    ///
    /// A raw criteria value set earlier by `where_criteria` is replaced by a
    /// fresh structured group.
    pub fn push_where(&mut self, field: &str, encoded: String) {
        let groups = match &mut self.criteria {
            Some(Criteria::Groups(groups)) => groups,
            _ => {
                self.criteria = Some(Criteria::Groups(vec![Map::new()]));
                match &mut self.criteria {
                    Some(Criteria::Groups(groups)) => groups,
                    _ => unreachable!(),
                }
            }
        };
        if groups.is_empty() {
            groups.push(Map::new());
        }
        groups[0].insert(field.to_string(), Value::String(encoded));
    }

    /// Replace all criteria with a raw pass-through value
    pub fn set_raw_criteria(&mut self, criteria: Value) {
        self.criteria = Some(Criteria::Raw(criteria));
    }

    /// Whether any find criterion has been set on this chain
    pub fn has_criteria(&self) -> bool {
        match &self.criteria {
            None => false,
            Some(Criteria::Raw(_)) => true,
            Some(Criteria::Groups(groups)) => groups.iter().any(|g| !g.is_empty()),
        }
    }

    /// Replace the sort list with a single clause
    pub fn set_sort(&mut self, field: &str, order: SortOrder) {
        self.sort = vec![Sort {
            field_name: field.to_string(),
            sort_order: order,
        }];
    }

    /// Append a clause to the sort list, preserving order
    pub fn push_sort(&mut self, field: &str, order: SortOrder) {
        self.sort.push(Sort {
            field_name: field.to_string(),
            sort_order: order,
        });
    }

    pub fn set_script(&mut self, phase: ScriptPhase, name: &str, param: Option<String>) {
        let call = ScriptCall {
            name: name.to_string(),
            param,
        };
        match phase {
            ScriptPhase::PostRequest => self.script = Some(call),
            ScriptPhase::Prerequest => self.script_prerequest = Some(call),
            ScriptPhase::Presort => self.script_presort = Some(call),
        }
    }

    /// GET query parameters.
    ///
    /// Every key is underscore-prefixed except the script keys; find
    /// criteria are never sent on GET requests.
    pub fn to_query_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();

        if let Some(limit) = self.limit {
            params.push(("_limit".to_string(), limit.to_string()));
        }
        for (portal, limit) in &self.portal_limits {
            params.push((format!("_limit.{}", portal), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("_offset".to_string(), offset.to_string()));
        }
        if !self.sort.is_empty() {
            // serializing a Vec<Sort> cannot fail
            let sort = serde_json::to_string(&self.sort).unwrap_or_default();
            params.push(("_sort".to_string(), sort));
        }

        let scripts = [
            ("script", &self.script),
            ("script.prerequest", &self.script_prerequest),
            ("script.presort", &self.script_presort),
        ];
        for (key, call) in scripts {
            if let Some(call) = call {
                params.push((key.to_string(), call.name.clone()));
                if let Some(param) = &call.param {
                    if !param.is_empty() {
                        params.push((format!("{}.param", key), param.clone()));
                    }
                }
            }
        }

        params
    }

    /// JSON body for a `_find` request, with empty and zero-value clauses
    /// stripped.
    pub fn to_find_body(&self) -> Value {
        let mut body = Map::new();

        if let Some(criteria) = self.criteria_value() {
            body.insert("query".to_string(), criteria);
        }
        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            body.insert("limit".to_string(), json!(limit));
        }
        for (portal, limit) in &self.portal_limits {
            body.insert(format!("limit.{}", portal), json!(limit));
        }
        if let Some(offset) = self.offset.filter(|o| *o > 0) {
            body.insert("offset".to_string(), json!(offset));
        }
        if !self.sort.is_empty() {
            // infallible: Sort serializes to plain strings
            if let Ok(sort) = serde_json::to_value(&self.sort) {
                body.insert("sort".to_string(), sort);
            }
        }

        let scripts = [
            ("script", &self.script),
            ("script.prerequest", &self.script_prerequest),
            ("script.presort", &self.script_presort),
        ];
        for (key, call) in scripts {
            if let Some(call) = call {
                body.insert(key.to_string(), json!(call.name));
                if let Some(param) = &call.param {
                    if !param.is_empty() {
                        body.insert(format!("{}.param", key), json!(param));
                    }
                }
            }
        }

        Value::Object(body)
    }

    fn criteria_value(&self) -> Option<Value> {
        match &self.criteria {
            None => None,
            Some(Criteria::Raw(value)) => Some(value.clone()),
            Some(Criteria::Groups(groups)) => {
                let groups: Vec<Value> = groups
                    .iter()
                    .filter(|g| !g.is_empty())
                    .map(|g| Value::Object(g.clone()))
                    .collect();
                if groups.is_empty() {
                    None
                } else {
                    Some(Value::Array(groups))
                }
            }
        }
    }
}

/// When a queued script runs relative to the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    /// After the action and sorting complete
    PostRequest,
    Prerequest,
    Presort,
}
