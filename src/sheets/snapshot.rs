//! Per-sheet in-memory view.
//!
//! A snapshot is immutable once built; refreshing a sheet means building a
//! new snapshot and replacing the old one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::client::SheetService;
use super::model::{Cell, ColumnId, LinkStatus, Row, RowId, Sheet, SheetId};
use crate::error::Result;

/// Which side of a cell link to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// The cell's value is sourced from another cell.
    In,
    /// The cell feeds other cells.
    Out,
}

/// Link state of a cell in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Ok,
    Unlinked,
    Broken,
    Invalid,
    NoValue,
}

/// Derive the link state of `cell` for `direction`.
pub fn link_state(cell: &Cell, direction: LinkDirection) -> LinkState {
    let statuses: Vec<Option<LinkStatus>> = match direction {
        LinkDirection::In => cell.link_in_from_cell.iter().map(|l| l.status).collect(),
        LinkDirection::Out => cell.links_out_to_cells.iter().map(|l| l.status).collect(),
    };

    if statuses.is_empty() {
        return if cell.has_value() {
            LinkState::Unlinked
        } else {
            LinkState::NoValue
        };
    }
    if statuses.contains(&Some(LinkStatus::Ok)) {
        LinkState::Ok
    } else if statuses.contains(&Some(LinkStatus::Broken)) {
        LinkState::Broken
    } else {
        LinkState::Invalid
    }
}

/// Checkbox-style truthiness of a raw cell value.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1"
        ),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct SheetSnapshot {
    pub id: SheetId,
    pub name: String,
    columns: HashMap<String, ColumnId>,
    rows: Vec<Row>,
    row_positions: HashMap<RowId, usize>,
    pub fetched_at: DateTime<Utc>,
}

impl PartialEq for SheetSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SheetSnapshot {}

impl SheetSnapshot {
    /// Fetch a sheet and build its snapshot.
    pub async fn fetch(
        service: &dyn SheetService,
        sheet_id: SheetId,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let sheet = service.get_sheet(sheet_id, modified_since).await?;
        Ok(Self::from_sheet(sheet))
    }

    pub fn from_sheet(sheet: Sheet) -> Self {
        let columns = sheet
            .columns
            .iter()
            .map(|c| (c.title.clone(), c.id))
            .collect();
        let row_positions = sheet
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();
        Self {
            id: sheet.id,
            name: sheet.name,
            columns,
            rows: sheet.rows,
            row_positions,
            fetched_at: Utc::now(),
        }
    }

    pub fn column_id(&self, name: &str) -> Option<ColumnId> {
        self.columns.get(name).copied()
    }

    pub fn has_columns(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.columns.contains_key(*n))
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, row_id: RowId) -> Option<&Row> {
        self.row_positions.get(&row_id).map(|&i| &self.rows[i])
    }

    pub fn cell_by_name<'a>(&self, row: &'a Row, column: &str) -> Option<&'a Cell> {
        self.column_id(column).and_then(|id| row.cell(id))
    }

    /// Text of the named cell; `None` if the column is absent or the cell empty.
    pub fn value_by_name(&self, row: &Row, column: &str) -> Option<String> {
        self.cell_by_name(row, column)
            .and_then(|c| c.text())
            .map(|s| s.trim().to_string())
    }

    pub fn flag_by_name(&self, row: &Row, column: &str) -> bool {
        is_truthy(self.cell_by_name(row, column).and_then(|c| c.value.as_ref()))
    }

    pub fn is_summary(&self, row: &Row, summary_column: &str) -> bool {
        self.flag_by_name(row, summary_column)
    }

    pub fn link_state(&self, cell: &Cell, direction: LinkDirection) -> LinkState {
        link_state(cell, direction)
    }
}
