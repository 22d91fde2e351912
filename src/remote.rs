//! Hosted backend tables over a PostgREST-style HTTP interface
//!
//! The adapter owns transport only: URL and header construction, timeout and
//! status mapping, and JSON decoding. Rows cross the wire with snake_case
//! column names.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{Map, Value};

use crate::error::RemoteError;

/// Filter and ordering for a table read or targeted write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Column equality filters
    pub eq: Vec<(String, String)>,
    pub order: Option<String>,
    pub ascending: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self {
            ascending: true,
            ..Default::default()
        }
    }

    pub fn by_id(id: &str) -> Self {
        Self::all().eq("id", id)
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.eq.push((column.to_string(), value.to_string()));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(column.to_string());
        self.ascending = ascending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// PostgREST query-string pairs
    fn params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .eq
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{value}")))
            .collect();
        if let Some(order) = &self.order {
            let direction = if self.ascending { "asc" } else { "desc" };
            params.push(("order".into(), format!("{order}.{direction}")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        params
    }
}

/// Row-level access to the backend tables
#[async_trait]
pub trait RemoteTables: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, RemoteError>;
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError>;
    async fn update(&self, table: &str, query: &Query, values: &Value) -> Result<(), RemoteError>;
    async fn upsert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError>;
    async fn delete(&self, table: &str, query: &Query) -> Result<(), RemoteError>;
}

pub struct RestClient {
    client: Client,
    base: Url,
    api_key: String,
}

impl RestClient {
    /// `url` is the project root; tables live under `/rest/v1/`
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let mut base = Url::parse(url)
            .map_err(|e| RemoteError::new("invalid_url", format!("{url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let base = base
            .join("rest/v1/")
            .map_err(|e| RemoteError::new("invalid_url", e.to_string()))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_transport_error)?;
        Ok(Self {
            client,
            base,
            api_key: api_key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
        self.base
            .join(table)
            .map_err(|e| RemoteError::new("invalid_table", format!("{table}: {e}")))
    }

    fn request(&self, method: reqwest::Method, table: &str) -> Result<reqwest::RequestBuilder, RemoteError> {
        Ok(self
            .client
            .request(method, self.table_url(table)?)
            .header("apikey", self.api_key.as_str())
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>, RemoteError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl RemoteTables for RestClient {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, RemoteError> {
        let mut params = query.params();
        params.push(("select".into(), "*".into()));
        let request = self.request(reqwest::Method::GET, table)?.query(&params);
        let body = self.send(request).await?;
        serde_json::from_slice(&body)
            .map_err(|e| RemoteError::new("decode", format!("invalid rows from '{table}': {e}")))
    }

    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
        let request = self
            .request(reqwest::Method::POST, table)?
            .header("Prefer", "return=minimal")
            .json(rows);
        self.send(request).await.map(drop)
    }

    async fn update(&self, table: &str, query: &Query, values: &Value) -> Result<(), RemoteError> {
        let request = self
            .request(reqwest::Method::PATCH, table)?
            .query(&query.params())
            .header("Prefer", "return=minimal")
            .json(values);
        self.send(request).await.map(drop)
    }

    async fn upsert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
        let request = self
            .request(reqwest::Method::POST, table)?
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        self.send(request).await.map(drop)
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<(), RemoteError> {
        if query.eq.is_empty() {
            return Err(RemoteError::new(
                "unfiltered_delete",
                format!("refusing to delete every row of '{table}'"),
            ));
        }
        let request = self
            .request(reqwest::Method::DELETE, table)?
            .query(&query.params());
        self.send(request).await.map(drop)
    }
}

fn map_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::new("network", format!("timeout: {error}"))
    } else {
        RemoteError::new("network", error.to_string())
    }
}

/// Uses the backend's own error descriptor when the body carries one
fn map_status_error(status: StatusCode, body: &[u8]) -> RemoteError {
    if let Ok(described) = serde_json::from_slice::<RemoteError>(body) {
        return described;
    }
    let preview = body_preview(body);
    let message = if preview.is_empty() {
        format!("status {}", status.as_u16())
    } else {
        format!("status {}: {}", status.as_u16(), preview)
    };
    RemoteError::new(format!("http_{}", status.as_u16()), message)
}

fn body_preview(body: &[u8]) -> String {
    const PREVIEW_CHAR_LIMIT: usize = 160;

    let compact = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let preview: String = compact.chars().take(PREVIEW_CHAR_LIMIT).collect();
    if compact.chars().count() > PREVIEW_CHAR_LIMIT {
        format!("{preview}...")
    } else {
        preview
    }
}

/// `clientName` -> `client_name`
pub fn to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `client_name` -> `clientName`
pub fn to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Renames the top-level keys of an object; nested values are left as stored
pub fn rename_keys(value: Value, rename: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (rename(&key), value))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

#[cfg(test)]
pub use memory::MemoryRemote;
