//! Fluent dispatcher for the Data API
//!
//! `FluentFm` is the chainable facade: clause methods accumulate into the
//! chain's [`Query`], action methods queue a [`PendingOp`], and a terminal
//! (`get`, `exec`, `first`, `last`) flushes the chain — fetching a pool
//! token, building the request, interpreting the response, and repairing
//! the token exactly once when the server answers 401. The query state is
//! cleared on every flush, success or not, so one client instance can be
//! reused chain after chain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Map, Value};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::query::{Query, ScriptPhase, SortOrder};
use crate::http::response::ResponseHandler;
use crate::http::token::{MemoryTokenStore, TokenManager, TokenRetryPolicy, TokenStore};
use crate::http::url as endpoint;
use crate::types::{Page, Record};

/// A queued operation with its captured parameters, interpreted by
/// `execute` when the chain is flushed.
#[derive(Debug, Clone)]
enum PendingOp {
    Records {
        layout: String,
        id: Option<i64>,
    },
    Find {
        layout: String,
    },
    FindPaginated {
        layout: String,
        page: u64,
        per_page: u64,
    },
    Create {
        layout: String,
        fields: Map<String, Value>,
        portals: Map<String, Value>,
    },
    Globals {
        layout: String,
        fields: Map<String, Value>,
    },
    Update {
        layout: String,
        fields: Map<String, Value>,
        record_id: Option<i64>,
        portals: Map<String, Value>,
        delete_related: Vec<String>,
    },
    Upload {
        layout: String,
        field: String,
        source: UploadSource,
        record_id: Option<i64>,
    },
    Download {
        layout: String,
        field: String,
        output_dir: PathBuf,
        record_id: Option<i64>,
    },
    Delete {
        layout: String,
        record_id: Option<i64>,
    },
    Fields {
        layout: String,
    },
}

#[derive(Debug, Clone)]
enum UploadSource {
    Path(PathBuf),
    Bytes { data: Vec<u8>, filename: String },
}

/// Result of one flushed chain
enum Outcome {
    Records(Vec<Record>),
    Page(Page),
    RecordId(i64),
    Fields(Vec<String>),
    Done,
}

/// Fluent client for one FileMaker database.
///
/// Not thread-safe by design: one chain is in flight at a time per
/// instance. The token pool behind it is shared safely across instances
/// through the injected [`TokenStore`].
pub struct FluentFm {
    client: Client,
    base: Url,
    config: Config,
    tokens: TokenManager,
    retry_policy: TokenRetryPolicy,
    query: Query,
    pending: Option<PendingOp>,
    token: Option<String>,
    last_query: Value,
    field_cache: HashMap<String, Vec<String>>,
}

impl FluentFm {
    /// Create a client with a private in-memory token store
    pub fn new(config: Config) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryTokenStore::new()))
    }

    /// Create a client sharing a token pool through `store`
    pub fn with_store(config: Config, store: Arc<dyn TokenStore>) -> Result<Self> {
        let base = Url::parse(&config.base_url()).map_err(|e| Error::Http {
            message: format!("invalid base URL {}: {}", config.base_url(), e),
            status: None,
            source: Some(anyhow::anyhow!(e)),
        })?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.validate_tls)
            .build()
            .map_err(|e| Error::Http {
                message: format!("failed to build HTTP client: {}", e),
                status: None,
                source: Some(anyhow::anyhow!(e)),
            })?;

        let tokens = TokenManager::new(config.clone(), client.clone(), base.clone(), store);

        Ok(Self {
            client,
            base,
            config,
            tokens,
            retry_policy: TokenRetryPolicy::default(),
            query: Query::new(),
            pending: None,
            token: None,
            last_query: Value::Null,
            field_cache: HashMap::new(),
        })
    }

    /// Override the token acquisition backoff policy
    pub fn with_retry_policy(mut self, policy: TokenRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Token pool manager backing this client
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    // --- query clauses -----------------------------------------------------

    /// Limit the number of results returned
    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.query.limit = Some(limit);
        self
    }

    /// Limit the number of related records returned for one portal
    pub fn limit_portal(&mut self, portal: &str, limit: u64) -> &mut Self {
        self.query.portal_limits.push((portal.to_string(), limit));
        self
    }

    /// Begin the result set at the given 1-based position
    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.query.offset = Some(offset);
        self
    }

    /// Sort results ascending by field, replacing any existing sort
    pub fn sort_asc(&mut self, field: &str) -> &mut Self {
        self.query.set_sort(field, SortOrder::Ascend);
        self
    }

    /// Sort results descending by field, replacing any existing sort
    pub fn sort_desc(&mut self, field: &str) -> &mut Self {
        self.query.set_sort(field, SortOrder::Descend);
        self
    }

    /// Append a field to the sort list, preserving clause order
    pub fn and_sort(&mut self, field: &str, ascending: bool) -> &mut Self {
        let order = if ascending {
            SortOrder::Ascend
        } else {
            SortOrder::Descend
        };
        self.query.push_sort(field, order);
        self
    }

    /// Sort by a FileMaker value list, replacing any existing sort
    pub fn sort_by_value_list(&mut self, field: &str, value_list: &str) -> &mut Self {
        self.query
            .set_sort(field, SortOrder::ValueList(value_list.to_string()));
        self
    }

    /// Append a value-list sort to the sort list
    pub fn and_sort_by_value_list(&mut self, field: &str, value_list: &str) -> &mut Self {
        self.query
            .push_sort(field, SortOrder::ValueList(value_list.to_string()));
        self
    }

    /// Require `field = value`
    pub fn where_eq(&mut self, field: &str, value: impl ToString) -> &mut Self {
        self.where_params(field, &[value.to_string()])
    }

    /// Require `field <op> value`, e.g. `where_op("age", ">", 21)`
    pub fn where_op(&mut self, field: &str, op: &str, value: impl ToString) -> &mut Self {
        self.where_params(field, &[op.to_string(), value.to_string()])
    }

    /// Variadic criterion: one param is equality, two are operator and
    /// value, three or more collapse to the wildcard
    pub fn where_params(&mut self, field: &str, params: &[String]) -> &mut Self {
        self.query.push_where(field, Query::encode_params(params));
        self
    }

    /// Require the field to be empty
    pub fn where_empty(&mut self, field: &str) -> &mut Self {
        self.where_params(field, &[String::new()])
    }

    /// Require the field to hold any value
    pub fn has(&mut self, field: &str) -> &mut Self {
        self.query.push_where(field, "*".to_string());
        self
    }

    /// Alias for [`has`](Self::has)
    pub fn where_not_empty(&mut self, field: &str) -> &mut Self {
        self.has(field)
    }

    /// Replace all criteria with a raw pass-through find request
    pub fn where_criteria(&mut self, criteria: Value) -> &mut Self {
        self.query.set_raw_criteria(criteria);
        self
    }

    /// Run a script after the action and sorting complete
    pub fn script(&mut self, name: &str, param: Option<&str>) -> &mut Self {
        self.query
            .set_script(ScriptPhase::PostRequest, name, param.map(String::from));
        self
    }

    /// Run a script before the requested action
    pub fn prerequest(&mut self, name: &str, param: Option<&str>) -> &mut Self {
        self.query
            .set_script(ScriptPhase::Prerequest, name, param.map(String::from));
        self
    }

    /// Run a script after the action but before sorting
    pub fn presort(&mut self, name: &str, param: Option<&str>) -> &mut Self {
        self.query
            .set_script(ScriptPhase::Presort, name, param.map(String::from));
        self
    }

    /// Include related-record portal data in results
    pub fn with_portals(&mut self) -> &mut Self {
        self.query.with_portals = true;
        self
    }

    /// Exclude portal data from results
    pub fn without_portals(&mut self) -> &mut Self {
        self.query.with_portals = false;
        self
    }

    /// Include records whose `deleted_at` field is set
    pub fn with_deleted(&mut self) -> &mut Self {
        self.query.with_deleted = true;
        self
    }

    /// Exclude soft-deleted records
    pub fn without_deleted(&mut self) -> &mut Self {
        self.query.with_deleted = false;
        self
    }

    /// Whether the current chain includes soft-deleted records
    pub fn includes_deleted(&self) -> bool {
        self.query.with_deleted
    }

    // --- actions -----------------------------------------------------------

    /// Queue a fetch of all records on a layout
    pub fn records(&mut self, layout: &str) -> &mut Self {
        self.pending = Some(PendingOp::Records {
            layout: layout.to_string(),
            id: None,
        });
        self
    }

    /// Queue a fetch of a single record by id
    pub fn record(&mut self, layout: &str, id: i64) -> &mut Self {
        self.pending = Some(PendingOp::Records {
            layout: layout.to_string(),
            id: Some(id),
        });
        self
    }

    /// Queue a find using the accumulated criteria
    pub fn find(&mut self, layout: &str) -> &mut Self {
        self.pending = Some(PendingOp::Find {
            layout: layout.to_string(),
        });
        self
    }

    /// Queue an update of the given fields. Without a record id, every
    /// record matching the accumulated criteria is patched individually;
    /// the first failure aborts the remainder.
    pub fn update(
        &mut self,
        layout: &str,
        fields: Map<String, Value>,
        record_id: Option<i64>,
    ) -> &mut Self {
        self.update_full(layout, fields, record_id, Map::new(), Vec::new())
    }

    /// Update with portal data and related-record deletions
    pub fn update_full(
        &mut self,
        layout: &str,
        fields: Map<String, Value>,
        record_id: Option<i64>,
        portals: Map<String, Value>,
        delete_related: Vec<String>,
    ) -> &mut Self {
        self.pending = Some(PendingOp::Update {
            layout: layout.to_string(),
            fields,
            record_id,
            portals,
            delete_related,
        });
        self
    }

    /// Queue a container upload from a file on disk
    pub fn upload(
        &mut self,
        layout: &str,
        field: &str,
        path: impl Into<PathBuf>,
        record_id: Option<i64>,
    ) -> &mut Self {
        self.pending = Some(PendingOp::Upload {
            layout: layout.to_string(),
            field: field.to_string(),
            source: UploadSource::Path(path.into()),
            record_id,
        });
        self
    }

    /// Queue a container upload from in-memory bytes
    pub fn upload_stream(
        &mut self,
        layout: &str,
        field: &str,
        data: Vec<u8>,
        filename: &str,
        record_id: Option<i64>,
    ) -> &mut Self {
        self.pending = Some(PendingOp::Upload {
            layout: layout.to_string(),
            field: field.to_string(),
            source: UploadSource::Bytes {
                data,
                filename: filename.to_string(),
            },
            record_id,
        });
        self
    }

    /// Queue a container download into `output_dir` (created if missing);
    /// each file is written as `<recordId>.<ext>` with the extension taken
    /// from the container URL
    pub fn download(
        &mut self,
        layout: &str,
        field: &str,
        output_dir: impl Into<PathBuf>,
        record_id: Option<i64>,
    ) -> &mut Self {
        self.pending = Some(PendingOp::Download {
            layout: layout.to_string(),
            field: field.to_string(),
            output_dir: output_dir.into(),
            record_id,
        });
        self
    }

    /// Queue a hard delete
    pub fn delete(&mut self, layout: &str, record_id: Option<i64>) -> &mut Self {
        self.pending = Some(PendingOp::Delete {
            layout: layout.to_string(),
            record_id,
        });
        self
    }

    /// Queue a soft delete: stamps `deleted_at` instead of removing the
    /// record, targeting only records not already soft-deleted
    pub fn soft_delete(&mut self, layout: &str, record_id: Option<i64>) -> &mut Self {
        let stamp = chrono::Local::now().format("%m/%d/%Y %H:%M:%S").to_string();
        let mut fields = Map::new();
        fields.insert("deleted_at".to_string(), Value::String(stamp));
        self.update(layout, fields, record_id).where_empty("deleted_at")
    }

    /// Queue the reverse of a soft delete, explicitly including
    /// already-deleted records in the target resolution
    pub fn undelete(&mut self, layout: &str, record_id: Option<i64>) -> &mut Self {
        let mut fields = Map::new();
        fields.insert("deleted_at".to_string(), Value::String(String::new()));
        self.update(layout, fields, record_id).with_deleted()
    }

    // --- terminals and immediate operations --------------------------------

    /// Flush the chain and return the matched records
    pub async fn get(&mut self) -> Result<Vec<Record>> {
        match self.dispatch().await? {
            Outcome::Records(records) => Ok(records),
            Outcome::Page(page) => Ok(page.records),
            _ => Ok(Vec::new()),
        }
    }

    /// Flush the chain, discarding any result
    pub async fn exec(&mut self) -> Result<()> {
        self.dispatch().await.map(|_| ())
    }

    /// Flush the chain and return the first record
    pub async fn first(&mut self) -> Result<Record> {
        let records = self.get().await?;
        records.into_iter().next().ok_or_else(|| Error::NoResult {
            query: self.last_query.clone(),
        })
    }

    /// Flush the chain and return the last record
    pub async fn last(&mut self) -> Result<Record> {
        let mut records = self.get().await?;
        records.pop().ok_or_else(|| Error::NoResult {
            query: self.last_query.clone(),
        })
    }

    /// Create a record and return its id. With `auto_id` enabled a UUID v4
    /// `id` field is generated when the caller supplied none.
    pub async fn create(&mut self, layout: &str, fields: Map<String, Value>) -> Result<i64> {
        self.create_with_portals(layout, fields, Map::new()).await
    }

    /// Create a record with portal data
    pub async fn create_with_portals(
        &mut self,
        layout: &str,
        mut fields: Map<String, Value>,
        portals: Map<String, Value>,
    ) -> Result<i64> {
        if self.config.auto_id && !fields.contains_key("id") {
            fields.insert(
                "id".to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }
        self.pending = Some(PendingOp::Create {
            layout: layout.to_string(),
            fields,
            portals,
        });
        match self.dispatch().await? {
            Outcome::RecordId(id) => Ok(id),
            _ => Err(Error::NoResult {
                query: self.last_query.clone(),
            }),
        }
    }

    /// Set global field values, each key namespaced as `layout::field`;
    /// empty values are filtered out before sending
    pub async fn globals(&mut self, layout: &str, fields: Map<String, Value>) -> Result<()> {
        self.pending = Some(PendingOp::Globals {
            layout: layout.to_string(),
            fields,
        });
        self.dispatch().await.map(|_| ())
    }

    /// Find one page of results. `page` is 1-based; the offset is derived
    /// as `(page - 1) * per_page + 1`.
    pub async fn find_paginated(
        &mut self,
        layout: &str,
        page: u64,
        per_page: u64,
    ) -> Result<Page> {
        let page = page.max(1);
        self.query.limit = Some(per_page);
        self.query.offset = Some((page - 1) * per_page + 1);
        self.pending = Some(PendingOp::FindPaginated {
            layout: layout.to_string(),
            page,
            per_page,
        });
        match self.dispatch().await? {
            Outcome::Page(result) => Ok(result),
            _ => Err(Error::NoResult {
                query: self.last_query.clone(),
            }),
        }
    }

    /// Field names defined on a layout, cached per layout for the lifetime
    /// of this client
    pub async fn fields(&mut self, layout: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.field_cache.get(layout) {
            return Ok(cached.clone());
        }
        self.pending = Some(PendingOp::Fields {
            layout: layout.to_string(),
        });
        match self.dispatch().await? {
            Outcome::Fields(names) => {
                self.field_cache.insert(layout.to_string(), names.clone());
                Ok(names)
            }
            _ => Err(Error::NoResult {
                query: self.last_query.clone(),
            }),
        }
    }

    /// Most recent record by `field` (typically `created_at`)
    pub async fn latest(&mut self, layout: &str, field: &str) -> Result<Record> {
        self.records(layout).sort_desc(field).limit(1).first().await
    }

    /// Most recently updated record by `field` (typically `updated_at`)
    pub async fn last_update(&mut self, layout: &str, field: &str) -> Result<Record> {
        self.records(layout).sort_desc(field).limit(1).first().await
    }

    /// Oldest record by `field` (typically `created_at`)
    pub async fn oldest(&mut self, layout: &str, field: &str) -> Result<Record> {
        self.records(layout).sort_asc(field).limit(1).first().await
    }

    /// Close this client's session server-side. Best-effort, no-op when no
    /// token is held.
    pub async fn logout(&mut self) {
        if let Some(token) = self.token.take() {
            self.tokens.logout(&token).await;
        }
    }

    // --- dispatch ----------------------------------------------------------

    /// Flush the chain: apply default criteria, snapshot and clear the
    /// query, then execute — with exactly one token-replace-and-retry when
    /// the failure carries status 401.
    async fn dispatch(&mut self) -> Result<Outcome> {
        let op = self.pending.take().ok_or(Error::NoPendingOperation)?;

        if !self.query.has_criteria() {
            self.query.push_where("id", "*".to_string());
        }
        if !self.query.with_deleted {
            self.query.push_where("deleted_at", "=".to_string());
        }

        let query = std::mem::take(&mut self.query);
        self.last_query = query.to_find_body();

        let token = match &self.token {
            Some(token) => token.clone(),
            None => self.tokens.get_token_with_retries(&self.retry_policy).await?,
        };
        self.token = Some(token.clone());

        match self.execute(&op, &query, &token).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.status_code() == Some(401) => {
                log::warn!("Data API rejected the token, replacing and retrying once: {}", e);
                let replacement = self.tokens.replace_token(&token).await?;
                self.token = Some(replacement.clone());
                self.execute(&op, &query, &replacement).await
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&self, op: &PendingOp, query: &Query, token: &str) -> Result<Outcome> {
        match op {
            PendingOp::Records { layout, id } => {
                let response = self
                    .client
                    .get(self.join(&endpoint::records(layout, *id))?)
                    .bearer_auth(token)
                    .query(&query.to_query_params())
                    .send()
                    .await?;
                let handler = self
                    .handle(response, params_value(&query.to_query_params()))
                    .await?;
                Ok(Outcome::Records(handler.records(query.with_portals)))
            }

            PendingOp::Find { layout } => {
                let handler = self.run_find(layout, query, token).await?;
                Ok(Outcome::Records(handler.records(query.with_portals)))
            }

            PendingOp::FindPaginated {
                layout,
                page,
                per_page,
            } => {
                let handler = self.run_find(layout, query, token).await?;
                Ok(Outcome::Page(handler.paginated(
                    *page,
                    *per_page,
                    query.with_portals,
                )))
            }

            PendingOp::Create {
                layout,
                fields,
                portals,
            } => {
                let mut body = Map::new();
                body.insert("fieldData".to_string(), Value::Object(fields.clone()));
                if !portals.is_empty() {
                    body.insert("portalData".to_string(), Value::Object(portals.clone()));
                }

                let response = self
                    .client
                    .post(self.join(&endpoint::records(layout, None))?)
                    .bearer_auth(token)
                    .json(&Value::Object(body))
                    .send()
                    .await?;
                let handler = self
                    .handle(response, json!({"fieldData": fields}))
                    .await?;
                Ok(Outcome::RecordId(handler.record_id()?))
            }

            PendingOp::Globals { layout, fields } => {
                let mut globals = Map::new();
                for (key, value) in fields {
                    if is_empty_value(value) {
                        continue;
                    }
                    globals.insert(format!("{}::{}", layout, key), value.clone());
                }
                let body = json!({"globalFields": globals});

                let response = self
                    .client
                    .patch(self.join(&endpoint::globals())?)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
                    .await?;
                self.handle(response, body).await?;
                Ok(Outcome::Done)
            }

            PendingOp::Update {
                layout,
                fields,
                record_id,
                portals,
                delete_related,
            } => {
                let ids = match record_id {
                    Some(id) => vec![*id],
                    None => self.resolve_ids(layout, query, token).await?,
                };

                for id in ids {
                    let mut field_data = fields.clone();
                    if !delete_related.is_empty() {
                        field_data.insert("deleteRelated".to_string(), json!(delete_related));
                    }
                    let mut body = Map::new();
                    body.insert("fieldData".to_string(), Value::Object(field_data));
                    if !portals.is_empty() {
                        body.insert("portalData".to_string(), Value::Object(portals.clone()));
                    }

                    let response = self
                        .client
                        .patch(self.join(&endpoint::records(layout, Some(id)))?)
                        .bearer_auth(token)
                        .json(&Value::Object(body))
                        .send()
                        .await?;
                    self.handle(response, json!({"fieldData": fields})).await?;
                }
                Ok(Outcome::Done)
            }

            PendingOp::Upload {
                layout,
                field,
                source,
                record_id,
            } => {
                let (data, filename) = match source {
                    UploadSource::Path(path) => {
                        let data = tokio::fs::read(path).await?;
                        let filename = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "upload".to_string());
                        (data, filename)
                    }
                    UploadSource::Bytes { data, filename } => (data.clone(), filename.clone()),
                };

                let ids = match record_id {
                    Some(id) => vec![*id],
                    None => self.resolve_ids(layout, query, token).await?,
                };

                for id in ids {
                    let part = Part::bytes(data.clone()).file_name(filename.clone());
                    let form = Form::new().part("upload", part);

                    let response = self
                        .client
                        .post(self.join(&endpoint::container(layout, id, field))?)
                        .bearer_auth(token)
                        .multipart(form)
                        .send()
                        .await?;
                    self.handle(
                        response,
                        json!({"multipart": {"name": "upload", "filename": filename}}),
                    )
                    .await?;
                }
                Ok(Outcome::Done)
            }

            PendingOp::Download {
                layout,
                field,
                output_dir,
                record_id,
            } => {
                let records = match record_id {
                    Some(id) => {
                        let response = self
                            .client
                            .get(self.join(&endpoint::records(layout, Some(*id)))?)
                            .bearer_auth(token)
                            .send()
                            .await?;
                        self.handle(response, query.to_find_body())
                            .await?
                            .records(false)
                    }
                    None => self
                        .run_find(layout, query, token)
                        .await?
                        .records(false),
                };

                tokio::fs::create_dir_all(output_dir).await.map_err(|e| Error::Io {
                    message: format!("directory {} was not created: {}", output_dir.display(), e),
                    source: e,
                })?;

                // separate client: container URLs redirect through a
                // cookie-gated streaming endpoint
                let downloader = Client::builder()
                    .danger_accept_invalid_certs(!self.config.validate_tls)
                    .cookie_store(true)
                    .build()
                    .map_err(Error::from)?;

                for record in records {
                    let container_url = record.get_str(field).ok_or_else(|| Error::Api {
                        code: -1,
                        message: format!(
                            "record {} has no container URL in field {}",
                            record.record_id, field
                        ),
                        query: query.to_find_body(),
                    })?;
                    let parsed = Url::parse(container_url).map_err(|e| Error::Http {
                        message: format!("invalid container URL {}: {}", container_url, e),
                        status: None,
                        source: Some(anyhow::anyhow!(e)),
                    })?;

                    let ext = Path::new(parsed.path())
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("pdf")
                        .to_string();

                    let response = downloader
                        .get(parsed)
                        .bearer_auth(token)
                        .send()
                        .await?;
                    let contents = response.bytes().await?;

                    let filename = output_dir.join(format!("{}.{}", record.record_id, ext));
                    tokio::fs::write(&filename, &contents).await?;
                }
                Ok(Outcome::Done)
            }

            PendingOp::Delete { layout, record_id } => {
                let ids = match record_id {
                    Some(id) => vec![*id],
                    None => self.resolve_ids(layout, query, token).await?,
                };

                for id in ids {
                    let response = self
                        .client
                        .delete(self.join(&endpoint::records(layout, Some(id)))?)
                        .bearer_auth(token)
                        .send()
                        .await?;
                    self.handle(response, query.to_find_body()).await?;
                }
                Ok(Outcome::Done)
            }

            PendingOp::Fields { layout } => {
                let response = self
                    .client
                    .get(self.join(&endpoint::metadata(layout))?)
                    .bearer_auth(token)
                    .send()
                    .await?;
                let handler = self.handle(response, Value::Null).await?;
                Ok(Outcome::Fields(handler.field_names()))
            }
        }
    }

    /// POST the accumulated criteria to `_find`
    async fn run_find(&self, layout: &str, query: &Query, token: &str) -> Result<ResponseHandler> {
        let body = query.to_find_body();
        let response = self
            .client
            .post(self.join(&endpoint::find(layout))?)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        self.handle(response, body).await
    }

    /// Resolve the ids of every record matching the chain's criteria. A
    /// no-match reply resolves to an empty set, making batched operations
    /// a no-op rather than an error.
    async fn resolve_ids(&self, layout: &str, query: &Query, token: &str) -> Result<Vec<i64>> {
        let handler = self.run_find(layout, query, token).await?;
        Ok(handler
            .records(false)
            .into_iter()
            .map(|r| r.record_id)
            .collect())
    }

    async fn handle(
        &self,
        response: reqwest::Response,
        context: Value,
    ) -> Result<ResponseHandler> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        ResponseHandler::check_result(status, &body, context)
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|e| Error::Http {
            message: format!("invalid endpoint path {}: {}", path, e),
            status: None,
            source: Some(anyhow::anyhow!(e)),
        })
    }
}

fn params_value(params: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (key, value) in params {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> FluentFm {
        FluentFm::new(Config::new("fm.example.com", "db", "u", "p")).unwrap()
    }

    #[test]
    fn test_chain_accumulates_clauses() {
        let mut fm = client();
        fm.records("people")
            .where_eq("name", "bob")
            .limit(5)
            .offset(2)
            .sort_asc("name")
            .and_sort("age", false);

        assert_eq!(fm.query.limit, Some(5));
        assert_eq!(fm.query.offset, Some(2));
        assert_eq!(fm.query.sort.len(), 2);
        assert!(fm.query.has_criteria());
        assert!(matches!(fm.pending, Some(PendingOp::Records { .. })));
    }

    #[test]
    fn test_soft_delete_sets_stamp_and_filter() {
        let mut fm = client();
        fm.soft_delete("people", Some(3));

        match fm.pending.as_ref().unwrap() {
            PendingOp::Update {
                fields, record_id, ..
            } => {
                assert_eq!(*record_id, Some(3));
                let stamp = fields["deleted_at"].as_str().unwrap();
                chrono::NaiveDateTime::parse_from_str(stamp, "%m/%d/%Y %H:%M:%S").unwrap();
            }
            other => panic!("expected Update, got {:?}", other),
        }

        // the chain targets only records not already soft-deleted
        let body = fm.query.to_find_body();
        assert_eq!(body["query"][0]["deleted_at"], "=");
    }

    #[test]
    fn test_undelete_includes_deleted_records() {
        let mut fm = client();
        fm.without_deleted();
        fm.undelete("people", None);

        assert!(fm.includes_deleted());
        match fm.pending.as_ref().unwrap() {
            PendingOp::Update { fields, .. } => {
                assert_eq!(fields["deleted_at"], "");
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_where_param_arities() {
        let mut fm = client();
        fm.where_eq("a", "1")
            .where_op("b", ">", 5)
            .where_params("c", &["x".to_string(), "y".to_string(), "z".to_string()]);

        let body = fm.query.to_find_body();
        assert_eq!(body["query"][0]["a"], "=1");
        assert_eq!(body["query"][0]["b"], ">5");
        assert_eq!(body["query"][0]["c"], "*");
    }
}
