// Wire format of the datatables API

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One column descriptor, e.g. `{"name": "ticker", "type": "String"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Untyped row, positionally aligned with the columns of its response
pub type RawRow = Vec<Value>;

/// Body of a single page as returned by `GET /{table}.json`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    pub datatable: DatatableBody,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatatableBody {
    #[serde(default)]
    pub data: Vec<RawRow>,
    #[serde(default)]
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub next_cursor_id: Option<String>,
}

impl ApiResponse {
    /// Cursor for the next page, if there is one
    pub fn next_cursor(&self) -> Option<&str> {
        self.meta
            .next_cursor_id
            .as_deref()
            .filter(|cursor| !cursor.is_empty())
    }
}

/// A fully paginated table: first page's columns plus every page's rows
#[derive(Debug, Clone, Default)]
pub struct Datatable {
    pub columns: Vec<Column>,
    pub rows: Vec<RawRow>,
}

impl Datatable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A page delivered by a streaming fetch.
///
/// `columns` are those of the first page of the cursor chain the page belongs to.
#[derive(Debug, Clone)]
pub struct Page {
    pub columns: Arc<[Column]>,
    pub rows: Vec<RawRow>,
}
