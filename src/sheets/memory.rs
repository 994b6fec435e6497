//! In-memory `SheetService`.
//!
//! Behaves like the hosted service for everything the sync engine relies on:
//! row ids are allocated on add, every write stamps `modifiedAt` and appends
//! cell history, linked cells copy their source value and follow it on later
//! writes. A settable clock keeps timestamps deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::client::SheetService;
use super::model::{
    Cell, CellHistory, CellLink, CellUpdate, CellValue, Column, ColumnId, FolderContents,
    FolderId, LinkStatus, Row, RowId, RowUpdate, Sheet, SheetId, User, WorkspaceId, WriteMode,
};
use crate::error::{ErrorKind, Result, SyncError};

/// A write accepted by the in-memory service.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub sheet_id: SheetId,
    pub mode: WriteMode,
    pub rows: Vec<RowUpdate>,
}

struct State {
    sheets: BTreeMap<SheetId, Sheet>,
    workspaces: HashMap<WorkspaceId, FolderContents>,
    folders: HashMap<FolderId, FolderContents>,
    // Oldest first
    history: HashMap<(SheetId, RowId, ColumnId), Vec<CellHistory>>,
    failures: HashMap<SheetId, VecDeque<ErrorKind>>,
    writes: Vec<WriteRecord>,
    now: DateTime<Utc>,
    next_id: i64,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn column_id(&self, sheet_id: SheetId, title: &str) -> Option<ColumnId> {
        self.sheets
            .get(&sheet_id)?
            .columns
            .iter()
            .find(|c| c.title == title)
            .map(|c| c.id)
    }

    /// Whether a link target names an existing row and column.
    fn link_target_exists(&self, sheet_id: SheetId, row_id: RowId, column_id: ColumnId) -> bool {
        self.sheets.get(&sheet_id).is_some_and(|sheet| {
            sheet.rows.iter().any(|r| r.id == row_id)
                && sheet.columns.iter().any(|c| c.id == column_id)
        })
    }

    fn source_cell(&self, sheet_id: SheetId, row_id: RowId, column_id: ColumnId) -> Option<&Cell> {
        self.sheets
            .get(&sheet_id)?
            .rows
            .iter()
            .find(|r| r.id == row_id)?
            .cell(column_id)
    }

    /// Final cell content an update produces.
    fn resolve(&self, update: &CellUpdate) -> Cell {
        if let Some(source) = update.link_in_from_cell {
            let link = CellLink {
                status: Some(LinkStatus::Ok),
                sheet_id: source.sheet_id,
                row_id: source.row_id,
                column_id: source.column_id,
                sheet_name: self.sheets.get(&source.sheet_id).map(|s| s.name.clone()),
            };
            if !self.link_target_exists(source.sheet_id, source.row_id, source.column_id) {
                return Cell {
                    column_id: update.column_id,
                    link_in_from_cell: Some(CellLink {
                        status: Some(LinkStatus::Broken),
                        ..link
                    }),
                    ..Default::default()
                };
            }
            // An empty source cell links fine and stays empty
            let src = self
                .source_cell(source.sheet_id, source.row_id, source.column_id)
                .cloned()
                .unwrap_or_default();
            return Cell {
                column_id: update.column_id,
                value: src.value,
                display_value: src.display_value,
                object_value: src.object_value,
                hyperlink: src.hyperlink,
                link_in_from_cell: Some(link),
                links_out_to_cells: Vec::new(),
            };
        }

        let (value, display_value, object_value) = match &update.value {
            CellValue::Value(v) => (Some(v.clone()), None, None),
            CellValue::Object(v) => match v.get("values").and_then(Value::as_array) {
                Some(values) => {
                    let display = values
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ");
                    (None, Some(display), Some(v.clone()))
                }
                None => (Some(v.clone()), None, Some(v.clone())),
            },
            CellValue::ExplicitNull => (None, None, None),
        };
        Cell {
            column_id: update.column_id,
            value,
            display_value,
            object_value,
            hyperlink: update.hyperlink.clone(),
            link_in_from_cell: None,
            links_out_to_cells: Vec::new(),
        }
    }

    fn record_history(&mut self, sheet_id: SheetId, row_id: RowId, cell: &Cell) {
        let entry = CellHistory {
            column_id: cell.column_id,
            value: cell.value.clone(),
            display_value: cell.display_value.clone(),
            object_value: cell.object_value.clone(),
            modified_at: Some(self.now),
            modified_by: Some(User {
                name: Some("plan-sync".to_string()),
                email: None,
            }),
        };
        self.history
            .entry((sheet_id, row_id, cell.column_id))
            .or_default()
            .push(entry);
    }

    /// Refresh every cell linked to one of `sources`.
    fn propagate(&mut self, sources: &[(SheetId, RowId, ColumnId)]) {
        let mut refreshed: Vec<(SheetId, RowId, ColumnId, Option<Cell>)> = Vec::new();
        for sheet in self.sheets.values() {
            for row in &sheet.rows {
                for cell in &row.cells {
                    let Some(link) = &cell.link_in_from_cell else {
                        continue;
                    };
                    if sources.contains(&(link.sheet_id, link.row_id, link.column_id)) {
                        let source = self
                            .source_cell(link.sheet_id, link.row_id, link.column_id)
                            .cloned();
                        refreshed.push((sheet.id, row.id, cell.column_id, source));
                    }
                }
            }
        }

        for (sheet_id, row_id, column_id, source) in refreshed {
            let Some(cell) = self
                .sheets
                .get_mut(&sheet_id)
                .and_then(|s| s.rows.iter_mut().find(|r| r.id == row_id))
                .and_then(|r| r.cell_mut(column_id))
            else {
                continue;
            };
            let source = source.unwrap_or_default();
            cell.value = source.value;
            cell.display_value = source.display_value;
            cell.object_value = source.object_value;
            cell.hyperlink = source.hyperlink;
        }
    }
}

fn put_cell(row: &mut Row, cell: Cell) {
    match row.cell_mut(cell.column_id) {
        Some(existing) => *existing = cell,
        None => row.cells.push(cell),
    }
}

fn injected_error(kind: ErrorKind, sheet_id: SheetId) -> SyncError {
    let resource = format!("sheet {}", sheet_id);
    match kind {
        ErrorKind::Transient => SyncError::transient(format!("{} unavailable", resource)),
        ErrorKind::RateLimited => SyncError::RateLimited { retry_after: None },
        ErrorKind::NotFound => SyncError::not_found(resource),
        ErrorKind::Conflict => SyncError::Conflict {
            resource,
            message: "injected conflict".to_string(),
        },
        ErrorKind::Permanent => SyncError::Permanent {
            status: 400,
            message: "injected failure".to_string(),
        },
        ErrorKind::Configuration => SyncError::configuration("injected failure"),
    }
}

pub struct InMemorySheets {
    state: Mutex<State>,
}

impl Default for InMemorySheets {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySheets {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                sheets: BTreeMap::new(),
                workspaces: HashMap::new(),
                folders: HashMap::new(),
                history: HashMap::new(),
                failures: HashMap::new(),
                writes: Vec::new(),
                now: Utc::now(),
                next_id: 1_000_000,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state().now
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state().now = now;
    }

    pub fn advance(&self, seconds: i64) {
        let mut state = self.state();
        state.now += Duration::seconds(seconds);
    }

    /// Create an empty sheet; returns the column ids in title order.
    pub fn create_sheet(&self, sheet_id: SheetId, name: &str, titles: &[&str]) -> Vec<ColumnId> {
        let mut state = self.state();
        let columns: Vec<Column> = titles
            .iter()
            .enumerate()
            .map(|(i, title)| Column {
                id: state.allocate_id(),
                title: title.to_string(),
                index: i as u32,
                primary: i == 0,
                column_type: None,
            })
            .collect();
        let ids = columns.iter().map(|c| c.id).collect();
        let now = state.now;
        state.sheets.insert(
            sheet_id,
            Sheet {
                id: sheet_id,
                name: name.to_string(),
                columns,
                rows: Vec::new(),
                modified_at: Some(now),
            },
        );
        ids
    }

    /// Insert a fully specified sheet, replacing any sheet with the same id.
    pub fn insert_sheet(&self, sheet: Sheet) {
        self.state().sheets.insert(sheet.id, sheet);
    }

    /// Add a row as a user would; returns its id.
    pub fn add_row(&self, sheet_id: SheetId, values: &[(&str, Value)]) -> RowId {
        let mut state = self.state();
        let row_id = state.allocate_id();
        let now = state.now;
        let cells: Vec<Cell> = values
            .iter()
            .filter_map(|(title, value)| {
                state.column_id(sheet_id, title).map(|column_id| Cell {
                    column_id,
                    value: Some(value.clone()),
                    ..Default::default()
                })
            })
            .collect();
        for cell in &cells {
            state.record_history(sheet_id, row_id, cell);
        }
        if let Some(sheet) = state.sheets.get_mut(&sheet_id) {
            sheet.rows.push(Row {
                id: row_id,
                row_number: Some(sheet.rows.len() as u32 + 1),
                parent_id: None,
                created_at: Some(now),
                modified_at: Some(now),
                cells,
            });
            sheet.modified_at = Some(now);
        }
        row_id
    }

    /// Edit a cell as a user would: plain value, link removed, history kept.
    pub fn set_cell(&self, sheet_id: SheetId, row_id: RowId, title: &str, value: Value) {
        self.edit_cell(sheet_id, row_id, title, |cell| {
            cell.value = Some(value);
            cell.display_value = None;
            cell.object_value = None;
            cell.link_in_from_cell = None;
        });
    }

    /// Mutate a cell in place, stamping the row and recording history.
    pub fn edit_cell(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        title: &str,
        edit: impl FnOnce(&mut Cell),
    ) {
        let mut state = self.state();
        let Some(column_id) = state.column_id(sheet_id, title) else {
            return;
        };
        let now = state.now;
        let Some(row) = state
            .sheets
            .get_mut(&sheet_id)
            .and_then(|s| s.rows.iter_mut().find(|r| r.id == row_id))
        else {
            return;
        };
        let mut cell = row.cell(column_id).cloned().unwrap_or(Cell {
            column_id,
            ..Default::default()
        });
        edit(&mut cell);
        put_cell(row, cell.clone());
        row.modified_at = Some(now);
        state.record_history(sheet_id, row_id, &cell);
        state.propagate(&[(sheet_id, row_id, column_id)]);
    }

    /// Override a row's modification time.
    pub fn touch_row(&self, sheet_id: SheetId, row_id: RowId, at: DateTime<Utc>) {
        let mut state = self.state();
        if let Some(row) = state
            .sheets
            .get_mut(&sheet_id)
            .and_then(|s| s.rows.iter_mut().find(|r| r.id == row_id))
        {
            row.modified_at = Some(at);
        }
    }

    pub fn add_workspace(&self, workspace_id: WorkspaceId, contents: FolderContents) {
        self.state().workspaces.insert(workspace_id, contents);
    }

    pub fn add_folder(&self, contents: FolderContents) {
        self.state().folders.insert(contents.id, contents);
    }

    /// Make the next write to `sheet_id` fail with `kind`.
    pub fn fail_next_write(&self, sheet_id: SheetId, kind: ErrorKind) {
        self.state()
            .failures
            .entry(sheet_id)
            .or_default()
            .push_back(kind);
    }

    pub fn sheet(&self, sheet_id: SheetId) -> Option<Sheet> {
        self.state().sheets.get(&sheet_id).cloned()
    }

    pub fn cell(&self, sheet_id: SheetId, row_id: RowId, title: &str) -> Option<Cell> {
        let state = self.state();
        let column_id = state.column_id(sheet_id, title)?;
        state.source_cell(sheet_id, row_id, column_id).cloned()
    }

    pub fn cell_text(&self, sheet_id: SheetId, row_id: RowId, title: &str) -> Option<String> {
        self.cell(sheet_id, row_id, title).and_then(|c| c.text())
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }
}

#[async_trait]
impl SheetService for InMemorySheets {
    async fn get_sheet(
        &self,
        sheet_id: SheetId,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<Sheet> {
        let state = self.state();
        let mut sheet = state
            .sheets
            .get(&sheet_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("sheet {}", sheet_id)))?;
        if let Some(since) = modified_since {
            sheet
                .rows
                .retain(|r| r.modified_at.is_some_and(|at| at >= since));
        }
        Ok(sheet)
    }

    async fn get_row(&self, sheet_id: SheetId, row_id: RowId) -> Result<Row> {
        self.state()
            .sheets
            .get(&sheet_id)
            .and_then(|s| s.rows.iter().find(|r| r.id == row_id))
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("row {} on sheet {}", row_id, sheet_id)))
    }

    async fn get_cell_history(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        column_id: ColumnId,
        limit: usize,
    ) -> Result<Vec<CellHistory>> {
        let state = self.state();
        if !state.sheets.contains_key(&sheet_id) {
            return Err(SyncError::not_found(format!("sheet {}", sheet_id)));
        }
        Ok(state
            .history
            .get(&(sheet_id, row_id, column_id))
            .map(|entries| entries.iter().rev().take(limit.max(1)).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_workspace(&self, workspace_id: WorkspaceId) -> Result<FolderContents> {
        self.state()
            .workspaces
            .get(&workspace_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("workspace {}", workspace_id)))
    }

    async fn list_folder(&self, folder_id: FolderId) -> Result<FolderContents> {
        self.state()
            .folders
            .get(&folder_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("folder {}", folder_id)))
    }

    async fn write_chunk(
        &self,
        sheet_id: SheetId,
        rows: &[RowUpdate],
        mode: WriteMode,
    ) -> Result<Vec<Row>> {
        let mut state = self.state();
        if let Some(kind) = state.failures.get_mut(&sheet_id).and_then(|q| q.pop_front()) {
            return Err(injected_error(kind, sheet_id));
        }
        let Some(sheet) = state.sheets.get(&sheet_id) else {
            return Err(SyncError::not_found(format!("sheet {}", sheet_id)));
        };
        if mode == WriteMode::Update {
            if let Some(missing) = rows
                .iter()
                .filter_map(|r| r.id)
                .find(|id| !sheet.rows.iter().any(|r| r.id == *id))
            {
                return Err(SyncError::not_found(format!(
                    "row {} on sheet {}",
                    missing, sheet_id
                )));
            }
        }

        let resolved: Vec<Vec<Cell>> = rows
            .iter()
            .map(|r| r.cells.iter().map(|c| state.resolve(c)).collect())
            .collect();
        let now = state.now;
        let mut written = Vec::with_capacity(rows.len());
        let mut touched = Vec::new();

        for (update, cells) in rows.iter().zip(resolved) {
            let row_id = match (mode, update.id) {
                (WriteMode::Update, Some(id)) => id,
                _ => state.allocate_id(),
            };
            for cell in &cells {
                state.record_history(sheet_id, row_id, cell);
                touched.push((sheet_id, row_id, cell.column_id));
            }
            let Some(sheet) = state.sheets.get_mut(&sheet_id) else {
                continue;
            };
            sheet.modified_at = Some(now);
            let row = match sheet.rows.iter().position(|r| r.id == row_id) {
                Some(position) => &mut sheet.rows[position],
                None => {
                    let row_number = Some(sheet.rows.len() as u32 + 1);
                    sheet.rows.push(Row {
                        id: row_id,
                        row_number,
                        parent_id: None,
                        created_at: Some(now),
                        modified_at: Some(now),
                        cells: Vec::new(),
                    });
                    let last = sheet.rows.len() - 1;
                    &mut sheet.rows[last]
                }
            };
            for cell in cells {
                put_cell(row, cell);
            }
            row.modified_at = Some(now);
            written.push(row.clone());
        }

        state.propagate(&touched);
        state.writes.push(WriteRecord {
            sheet_id,
            mode,
            rows: rows.to_vec(),
        });
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::model::CellLinkRef;
    use serde_json::json;

    #[tokio::test]
    async fn test_add_and_filter_by_modification() {
        let sheets = InMemorySheets::new();
        let start = Utc::now();
        sheets.set_now(start);
        sheets.create_sheet(1, "Plan", &["Tasks"]);
        let old = sheets.add_row(1, &[("Tasks", json!("old"))]);
        sheets.advance(600);
        let new = sheets.add_row(1, &[("Tasks", json!("new"))]);

        let all = sheets.get_sheet(1, None).await.unwrap();
        assert_eq!(all.rows.len(), 2);
        let recent = sheets
            .get_sheet(1, Some(start + Duration::seconds(300)))
            .await
            .unwrap();
        assert_eq!(recent.rows.len(), 1);
        assert_eq!(recent.rows[0].id, new);
        assert_ne!(old, new);
    }

    #[tokio::test]
    async fn test_links_follow_source() {
        let sheets = InMemorySheets::new();
        let index_cols = sheets.create_sheet(1, "Index", &["Jira Status"]);
        sheets.create_sheet(2, "Plan", &["Jira Status"]);
        let index_row = sheets.add_row(1, &[("Jira Status", json!("Open"))]);
        let plan_row = sheets.add_row(2, &[]);
        let plan_col = sheets.sheet(2).unwrap().columns[0].id;

        sheets
            .write_rows(
                2,
                &[RowUpdate::update(
                    plan_row,
                    vec![CellUpdate::link(
                        plan_col,
                        CellLinkRef {
                            sheet_id: 1,
                            row_id: index_row,
                            column_id: index_cols[0],
                        },
                    )],
                )],
                WriteMode::Update,
            )
            .await
            .unwrap();
        assert_eq!(
            sheets.cell_text(2, plan_row, "Jira Status").as_deref(),
            Some("Open")
        );

        sheets.set_cell(1, index_row, "Jira Status", json!("Done"));
        assert_eq!(
            sheets.cell_text(2, plan_row, "Jira Status").as_deref(),
            Some("Done")
        );
    }

    #[tokio::test]
    async fn test_injected_failure_and_history() {
        let sheets = InMemorySheets::new();
        let cols = sheets.create_sheet(1, "Plan", &["Tasks"]);
        let row = sheets.add_row(1, &[("Tasks", json!("a"))]);
        sheets.fail_next_write(1, ErrorKind::Conflict);

        let update = [RowUpdate::update(row, vec![CellUpdate::text(cols[0], "b")])];
        let err = sheets
            .write_chunk(1, &update, WriteMode::Update)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        sheets.advance(5);
        sheets
            .write_chunk(1, &update, WriteMode::Update)
            .await
            .unwrap();
        let history = sheets.get_cell_history(1, row, cols[0], 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, Some(json!("b")));
        assert_eq!(sheets.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_update_of_unknown_row_is_not_found() {
        let sheets = InMemorySheets::new();
        let cols = sheets.create_sheet(1, "Plan", &["Tasks"]);
        let err = sheets
            .write_chunk(
                1,
                &[RowUpdate::update(7, vec![CellUpdate::text(cols[0], "x")])],
                WriteMode::Update,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
