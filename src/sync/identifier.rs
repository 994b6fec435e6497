//! Row identifiers
//!
//! Every non-summary plan row carries `<sheetId>-<rowId>-<columnId>-<created>`
//! in its identifier column, where `created` is the row's creation time in
//! UTC as `YYYYMMDDhhmmss`. The value is derived from the row alone, so
//! rewriting it is idempotent.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::config::PlanColumns;
use crate::error::Result;
use crate::sheets::model::{CellUpdate, ColumnId, Row, RowId, SheetId};
use crate::sheets::{SheetService, SheetSnapshot};

use super::{fatal_error, UpdateBatch, WriteTally};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-(\d+)-(\d+)-(\d+)$").expect("valid identifier regex"));

const CREATED_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowIdentifier {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub column_id: ColumnId,
    pub created: String,
}

impl RowIdentifier {
    /// Canonical identifier of `row`; `None` if the row has no creation time.
    pub fn for_row(sheet_id: SheetId, row: &Row, column_id: ColumnId) -> Option<Self> {
        let created = row.created_at?;
        Some(Self {
            sheet_id,
            row_id: row.id,
            column_id,
            created: created.format(CREATED_FORMAT).to_string(),
        })
    }

    pub fn parse(text: &str) -> Option<Self> {
        let caps = IDENTIFIER.captures(text.trim())?;
        Some(Self {
            sheet_id: caps[1].parse().ok()?,
            row_id: caps[2].parse().ok()?,
            column_id: caps[3].parse().ok()?,
            created: caps[4].to_string(),
        })
    }

    pub fn is_valid(text: &str) -> bool {
        IDENTIFIER.is_match(text.trim())
    }
}

impl fmt::Display for RowIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.sheet_id, self.row_id, self.column_id, self.created
        )
    }
}

/// Identifier cells of `snapshot` that differ from their canonical value.
pub fn pending_updates(snapshot: &SheetSnapshot, columns: &PlanColumns) -> UpdateBatch {
    let mut batch = UpdateBatch::new(snapshot.id);
    let Some(column_id) = snapshot.column_id(&columns.uuid) else {
        return batch;
    };

    for row in snapshot.rows() {
        if snapshot.is_summary(row, &columns.summary) {
            continue;
        }
        let Some(identifier) = RowIdentifier::for_row(snapshot.id, row, column_id) else {
            tracing::warn!(
                sheet_id = snapshot.id,
                row_id = row.id,
                "Row has no creation time; identifier not assigned"
            );
            continue;
        };
        let canonical = identifier.to_string();
        if snapshot.value_by_name(row, &columns.uuid).as_deref() == Some(canonical.as_str()) {
            continue;
        }
        batch.push(
            row.id,
            (snapshot.id, row.id),
            CellUpdate::text(column_id, canonical),
        );
    }
    batch
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierReport {
    pub assigned: usize,
    pub writes: WriteTally,
}

/// Fills and repairs identifier cells on plan sheets.
pub struct IdentifierService {
    service: Arc<dyn SheetService>,
    columns: PlanColumns,
}

impl IdentifierService {
    pub fn new(service: Arc<dyn SheetService>, columns: PlanColumns) -> Self {
        Self { service, columns }
    }

    /// Write canonical identifiers on every snapshot. A rejected batch is
    /// logged and retried next tick; a fatal rejection aborts.
    pub async fn assign(&self, snapshots: &[Arc<SheetSnapshot>]) -> Result<IdentifierReport> {
        let mut report = IdentifierReport::default();
        for snapshot in snapshots {
            let batch = pending_updates(snapshot, &self.columns);
            if batch.is_empty() {
                continue;
            }
            tracing::info!(
                sheet_id = snapshot.id,
                sheet = %snapshot.name,
                rows = batch.len(),
                "Assigning row identifiers"
            );
            let written = batch.flush(self.service.as_ref(), &mut report.writes).await?;
            report.assigned += written.written.len();
            fatal_error(written)?;
        }
        Ok(report)
    }
}
