//! Smartsheet API 2.0 wire types
//!
//! Read-side records mirror the JSON the service returns (camelCase keys).
//! Write-side records (`RowUpdate`, `CellUpdate`) serialize by hand so that an
//! explicit null and a linked cell come out exactly as the service expects.
//!
//! Reference: https://smartsheet.redoc.ly/

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::SyncError;

pub type SheetId = i64;
pub type RowId = i64;
pub type ColumnId = i64;
pub type WorkspaceId = i64;
pub type FolderId = i64;

/// Upstream hard limit on rows per add/update request.
pub const MAX_ROWS_PER_REQUEST: usize = 125;

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    pub id: SheetId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: ColumnId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub primary: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: RowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn cell(&self, column_id: ColumnId) -> Option<&Cell> {
        self.cells.iter().find(|c| c.column_id == column_id)
    }

    pub fn cell_mut(&mut self, column_id: ColumnId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.column_id == column_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub column_id: ColumnId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperlink: Option<Hyperlink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_in_from_cell: Option<CellLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links_out_to_cells: Vec<CellLink>,
}

impl Cell {
    /// Display-oriented text of the cell, `None` when empty.
    pub fn text(&self) -> Option<String> {
        if let Some(display) = &self.display_value {
            if !display.trim().is_empty() {
                return Some(display.clone());
            }
        }
        self.value.as_ref().and_then(value_text)
    }

    pub fn has_value(&self) -> bool {
        self.text().is_some() || self.object_value.as_ref().is_some_and(|v| !v.is_null())
    }

    pub fn hyperlink_url(&self) -> Option<&str> {
        self.hyperlink.as_ref().and_then(|h| h.url.as_deref())
    }
}

/// Render a primitive JSON value the way the sheet displays it.
pub fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hyperlink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_id: Option<SheetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<i64>,
}

/// Status reported by the service for a cell link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Ok,
    Broken,
    Inaccessible,
    NotShared,
    Blocked,
    Circular,
    Invalid,
    Disabled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LinkStatus>,
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub column_id: ColumnId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellHistory {
    pub column_id: ColumnId,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub display_value: Option<String>,
    #[serde(default)]
    pub object_value: Option<Value>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_by: Option<User>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct User {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Contents of a workspace or folder (one level).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderContents {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub folders: Vec<FolderContents>,
    #[serde(default)]
    pub sheets: Vec<SheetSummary>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub id: SheetId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Envelope returned by add/update row calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResult<T> {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result_code: i64,
    pub result: T,
}

/// Paged listing envelope (cell history).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResult<T> {
    #[serde(default)]
    pub page_number: u32,
    #[serde(default)]
    pub total_count: u32,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Append new rows at the bottom of the sheet.
    Add,
    /// Update existing rows by id.
    Update,
}

/// Value written into a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Value(Value),
    Object(Value),
    /// Clears the cell (`"value": null`).
    ExplicitNull,
}

impl CellValue {
    pub fn text(text: impl Into<String>) -> Self {
        CellValue::Value(Value::String(text.into()))
    }

    pub fn multi_picklist<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<Value> = values.into_iter().map(|v| Value::String(v.into())).collect();
        CellValue::Object(serde_json::json!({
            "objectType": "MULTI_PICKLIST",
            "values": values,
        }))
    }
}

/// Target of an inbound cell link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellLinkRef {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub column_id: ColumnId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub column_id: ColumnId,
    pub value: CellValue,
    pub hyperlink: Option<Hyperlink>,
    pub link_in_from_cell: Option<CellLinkRef>,
}

impl CellUpdate {
    pub fn text(column_id: ColumnId, text: impl Into<String>) -> Self {
        Self::with_value(column_id, CellValue::text(text))
    }

    pub fn with_value(column_id: ColumnId, value: CellValue) -> Self {
        Self {
            column_id,
            value,
            hyperlink: None,
            link_in_from_cell: None,
        }
    }

    /// A cell sourced from another cell by reference.
    pub fn link(column_id: ColumnId, source: CellLinkRef) -> Self {
        Self {
            column_id,
            value: CellValue::ExplicitNull,
            hyperlink: None,
            link_in_from_cell: Some(source),
        }
    }

    /// Rebuild `source` onto another column, preferring `objectValue` over
    /// `value` and keeping its hyperlink.
    pub fn copy_of(source: Option<&Cell>, column_id: ColumnId) -> Self {
        let Some(cell) = source else {
            return Self::with_value(column_id, CellValue::ExplicitNull);
        };
        let value = match (&cell.object_value, &cell.value) {
            (Some(object), _) if !object.is_null() => CellValue::Object(object.clone()),
            (_, Some(value)) if !value.is_null() => CellValue::Value(value.clone()),
            _ => CellValue::ExplicitNull,
        };
        let hyperlink = cell.hyperlink_url().map(|url| Hyperlink {
            url: Some(url.to_string()),
            ..Default::default()
        });
        Self {
            column_id,
            value,
            hyperlink,
            link_in_from_cell: None,
        }
    }
}

impl Serialize for CellUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("columnId", &self.column_id)?;
        match &self.value {
            CellValue::Value(v) => map.serialize_entry("value", v)?,
            CellValue::Object(v) => map.serialize_entry("objectValue", v)?,
            CellValue::ExplicitNull => map.serialize_entry("value", &Value::Null)?,
        }
        if let Some(hyperlink) = &self.hyperlink {
            map.serialize_entry("hyperlink", hyperlink)?;
        }
        if let Some(link) = &self.link_in_from_cell {
            map.serialize_entry("linkInFromCell", link)?;
        }
        map.serialize_entry("strict", &false)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RowId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub to_bottom: bool,
    pub cells: Vec<CellUpdate>,
}

impl RowUpdate {
    pub fn update(id: RowId, cells: Vec<CellUpdate>) -> Self {
        Self {
            id: Some(id),
            to_bottom: false,
            cells,
        }
    }

    pub fn append(cells: Vec<CellUpdate>) -> Self {
        Self {
            id: None,
            to_bottom: true,
            cells,
        }
    }
}

/// A chunk of a batch write that the service rejected.
#[derive(Debug)]
pub struct ChunkFailure {
    /// Positions (in the submitted batch) of the rows carried by the chunk.
    pub range: Range<usize>,
    pub error: SyncError,
}

/// Outcome of a chunked batch write.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub written: Vec<Row>,
    pub failures: Vec<ChunkFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the row at `position` in the submitted batch was accepted.
    pub fn accepted(&self, position: usize) -> bool {
        !self.failures.iter().any(|f| f.range.contains(&position))
    }

    pub fn failed_rows(&self) -> usize {
        self.failures.iter().map(|f| f.range.len()).sum()
    }
}
