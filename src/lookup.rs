use crate::model::{CategoryId, SheetGrid};
use async_trait::async_trait;
use log::debug;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str =
    "https://search.wb.ru/exactmatch/ru/common/v9/search?appType=1&curr=page=1&query={query}&resultset=catalog";
const QUERY_PLACEHOLDER: &str = "{query}";
const BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(CategoryId),
    NotFound,
}

impl Resolution {
    pub fn found(&self) -> Option<&CategoryId> {
        match self {
            Resolution::Found(id) => Some(id),
            Resolution::NotFound => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("status={status}, body: {body}")]
    Status { status: StatusCode, body: String },
    #[error("non-JSON response (content-type={content_type}), body: {body}")]
    ContentType { content_type: String, body: String },
    #[error("malformed JSON ({reason}), body: {body}")]
    Body { reason: String, body: String },
}

/// Resolves a category display name to a marketplace subject id.
#[async_trait]
pub trait CategoryLookup: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Resolution, LookupError>;
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchResponse {
    #[serde(default)]
    pub data: Option<SearchData>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchData {
    #[serde(default)]
    pub products: Vec<SearchProduct>,
}

/// Ids are kept as raw JSON so that a null, string or negative value in one field
/// does not fail the whole response.
#[derive(Debug, Deserialize, Default)]
pub struct SearchProduct {
    #[serde(rename = "subjectId", default)]
    pub subject_id: Option<Value>,
    #[serde(rename = "subjectParentId", default)]
    pub subject_parent_id: Option<Value>,
}

/// A positive integer id from `101`, `101.0` or `"101"`; anything else is treated as absent.
fn identifier_from_json(value: &Value) -> Option<u64> {
    let id = match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f > 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    id.filter(|id| *id > 0)
}

/// First product wins; its `subjectId`, or failing that its `subjectParentId`.
pub fn select_identifier(response: &SearchResponse) -> Resolution {
    let Some(product) = response.data.as_ref().and_then(|d| d.products.first()) else {
        return Resolution::NotFound;
    };
    let id = product
        .subject_id
        .as_ref()
        .and_then(identifier_from_json)
        .or_else(|| product.subject_parent_id.as_ref().and_then(identifier_from_json));
    match id {
        Some(id) => Resolution::Found(CategoryId::from_number(id)),
        None => Resolution::NotFound,
    }
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// Checks status and content type, then parses and applies [`select_identifier`].
pub fn interpret_response(status: StatusCode, content_type: &str, body: &str) -> Result<Resolution, LookupError> {
    if !status.is_success() {
        return Err(LookupError::Status { status, body: preview(body) });
    }
    if !content_type.to_ascii_lowercase().contains("application/json") {
        return Err(LookupError::ContentType { content_type: content_type.to_string(), body: preview(body) });
    }
    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|e| LookupError::Body { reason: e.to_string(), body: preview(body) })?;
    Ok(select_identifier(&parsed))
}

pub struct SearchApiLookup {
    client: Client,
    endpoint: String,
}

impl SearchApiLookup {
    pub fn new(endpoint: &str, timeout: Duration, user_agent: &str) -> Result<Self, LookupError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| LookupError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.to_string() })
    }

    pub fn url_for(&self, name: &str) -> String {
        if self.endpoint.contains(QUERY_PLACEHOLDER) {
            self.endpoint.replace(QUERY_PLACEHOLDER, name)
        } else {
            format!("{}{}", self.endpoint, name)
        }
    }
}

#[async_trait]
impl CategoryLookup for SearchApiLookup {
    async fn resolve(&self, name: &str) -> Result<Resolution, LookupError> {
        let url = self.url_for(name);
        debug!("Search API request: {}", url);
        let response = self.client.get(&url).send().await.map_err(|e| LookupError::Transport(e.to_string()))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(|e| LookupError::Transport(e.to_string()))?;
        let resolution = interpret_response(status, &content_type, &body)?;
        match &resolution {
            Resolution::Found(id) => debug!("'{}' resolved to subject id {}", name, id),
            Resolution::NotFound => debug!("Empty products list for '{}'", name),
        }
        Ok(resolution)
    }
}

/// Offline resolver: an ordered `(local_id, name)` list; the first exact name match wins.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: Vec<(CategoryId, String)>,
}

impl ReferenceTable {
    /// Builds the table from two columns of a sheet; rows missing either value are dropped.
    pub fn from_grid(grid: &SheetGrid, id_column: &str, name_column: &str) -> Option<Self> {
        let id_col = grid.column(id_column)?;
        let name_col = grid.column(name_column)?;
        let entries = (0..grid.rows.len())
            .filter_map(|r| {
                let id = CategoryId::from_cell(grid.cell(r, id_col))?;
                let name = grid.cell(r, name_col).as_text();
                (!name.is_empty()).then_some((id, name))
            })
            .collect();
        Some(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Resolution {
        self.entries
            .iter()
            .find(|(_, n)| n == name)
            .map_or(Resolution::NotFound, |(id, _)| Resolution::Found(id.clone()))
    }
}

#[async_trait]
impl CategoryLookup for ReferenceTable {
    async fn resolve(&self, name: &str) -> Result<Resolution, LookupError> {
        Ok(self.find(name))
    }
}
