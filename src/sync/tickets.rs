//! Ticket creation pipeline
//!
//! A plan row asks for a ticket by setting its ticket cell to `Create`. The
//! row is staged on the push sheet and flipped to `Pending…`; the external
//! tracker creates the ticket and writes the key into the push row and into a
//! new index row. Later ticks copy the key back onto the plan row, or the
//! tracker's failure status when creation failed.
//!
//! Phases run in a fixed order, each on the state visible at its start:
//!
//! 1. copy identifiers from push rows into index rows that lack one
//! 2. surface tracker failures on rows still `Pending…`
//! 3. copy created ticket keys back onto `Pending…` rows
//! 4. select rows to stage
//! 5. append staging rows, then flip the accepted rows to `Pending…`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;

use crate::config::{ColumnNames, PlanColumns};
use crate::error::{Result, SyncError};
use crate::sheets::model::{CellUpdate, CellValue, ColumnId, Row, RowId, RowUpdate, SheetId, WriteMode};
use crate::sheets::{SheetService, SheetSnapshot};

use super::identifier::RowIdentifier;
use super::index::ProjectIndex;
use super::ticket::{project_prefix, Ticket, PENDING};
use super::{fatal_error, tolerate, UpdateBatch, WriteTally};

/// Components set on every staged ticket.
pub const COMPONENTS: [&str; 2] = ["Autogenerated by Smartsheet", "Sync to Smartsheet"];

const SUB_TASK: &str = "Sub-Task";
const DEFAULT_ISSUE_TYPE: &str = "Task";

/// Relationship between a staged ticket and its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentLink {
    /// `Issue Links = "implements <parent>"`
    IssueLinks(String),
    /// `Epic Link = <parent>`
    EpicLink(String),
    None,
}

fn is_one_of(value: &str, names: &[&str]) -> bool {
    names.iter().any(|n| value.eq_ignore_ascii_case(n))
}

/// Relationship for a child of `child_type` under `parent` of `parent_type`.
pub fn parent_link(child_type: &str, parent: &str, parent_type: &str) -> ParentLink {
    const WORK: [&str; 3] = ["Task", "Story", "Project"];
    let child_type = child_type.trim();
    let parent_type = parent_type.trim();

    if child_type.eq_ignore_ascii_case("Epic") && is_one_of(parent_type, &["Project", "Epic"]) {
        ParentLink::IssueLinks(format!("implements {}", parent))
    } else if is_one_of(child_type, &WORK) && is_one_of(parent_type, &WORK) {
        ParentLink::IssueLinks(format!("implements {}", parent))
    } else if is_one_of(child_type, &WORK) && parent_type.eq_ignore_ascii_case("Epic") {
        ParentLink::EpicLink(parent.to_string())
    } else {
        ParentLink::None
    }
}

/// Labels from program, initiative and team plus the flag labels.
pub fn build_labels(
    program: Option<&str>,
    initiative: Option<&str>,
    team: Option<&str>,
    inject: bool,
    ktlo: bool,
) -> Vec<String> {
    let mut labels: Vec<&str> = [program, initiative, team]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if inject {
        labels.push("Inject");
    }
    if ktlo {
        labels.push("KTLO");
    }
    labels
        .into_iter()
        .map(|l| l.replace(' ', "-").replace("---", "-"))
        .collect()
}

/// A plan row selected for ticket creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creation {
    pub sheet_id: SheetId,
    pub row_id: RowId,
    pub ticket_column: ColumnId,
    pub identifier: String,
    pub task: Option<String>,
    pub issue_type: String,
    pub project_key: String,
    pub labels: Vec<String>,
    pub parent: ParentLink,
}

/// Outcome of phase 4 for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Stage(Creation),
    /// Parent is itself waiting for creation.
    Deferred,
    Skip,
}

/// Decide whether `row` should be staged.
pub fn select(
    snapshot: &SheetSnapshot,
    row: &Row,
    columns: &PlanColumns,
    default_project_key: &str,
) -> Selection {
    let value = |name: &str| snapshot.value_by_name(row, name);

    if snapshot.is_summary(row, &columns.summary) || value(&columns.team).is_none() {
        return Selection::Skip;
    }
    let Some(identifier) = value(&columns.uuid).filter(|id| RowIdentifier::is_valid(id)) else {
        return Selection::Skip;
    };
    let Some(ticket_column) = snapshot.column_id(&columns.ticket) else {
        return Selection::Skip;
    };
    let issue_type = value(&columns.issue_type).unwrap_or_else(|| DEFAULT_ISSUE_TYPE.to_string());
    let parent_type = value(&columns.parent_issue_type);
    if issue_type.eq_ignore_ascii_case(SUB_TASK)
        || parent_type.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(SUB_TASK))
    {
        return Selection::Skip;
    }
    if Ticket::parse(value(&columns.ticket).as_deref()) != Ticket::Create {
        return Selection::Skip;
    }

    let parent = match Ticket::parse(value(&columns.parent_ticket).as_deref()) {
        Ticket::Empty => None,
        Ticket::Key(key) => Some(key),
        Ticket::Create => return Selection::Deferred,
        other => {
            tracing::debug!(
                sheet_id = snapshot.id,
                row_id = row.id,
                parent = %other,
                "Parent ticket not usable; row not staged"
            );
            return Selection::Skip;
        }
    };

    let project_key = value(&columns.project_key)
        .or_else(|| {
            parent
                .as_deref()
                .and_then(project_prefix)
                .map(str::to_string)
        })
        .unwrap_or_else(|| default_project_key.to_string());

    let parent = match &parent {
        Some(key) => parent_link(
            &issue_type,
            key,
            parent_type.as_deref().unwrap_or(DEFAULT_ISSUE_TYPE),
        ),
        None => ParentLink::None,
    };

    let labels = build_labels(
        value(&columns.program).as_deref(),
        value(&columns.initiative).as_deref(),
        value(&columns.team).as_deref(),
        snapshot.flag_by_name(row, &columns.inject),
        snapshot.flag_by_name(row, &columns.ktlo),
    );

    Selection::Stage(Creation {
        sheet_id: snapshot.id,
        row_id: row.id,
        ticket_column,
        identifier,
        task: value(&columns.task),
        issue_type,
        project_key,
        labels,
        parent,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub identifiers_copied: usize,
    pub errors_surfaced: usize,
    pub tickets_copied: usize,
    pub staged: usize,
    pub deferred: usize,
    pub flipped: usize,
    pub index_written: bool,
    pub writes: WriteTally,
}

pub struct TicketCreationPipeline {
    service: Arc<dyn SheetService>,
    columns: ColumnNames,
    push_sheet_id: SheetId,
    default_project_key: String,
}

impl TicketCreationPipeline {
    pub fn new(
        service: Arc<dyn SheetService>,
        columns: ColumnNames,
        push_sheet_id: SheetId,
        default_project_key: String,
    ) -> Self {
        Self {
            service,
            columns,
            push_sheet_id,
            default_project_key,
        }
    }

    /// Run the five phases over `plans` against `index`.
    pub async fn run(
        &self,
        plans: &[Arc<SheetSnapshot>],
        index: &ProjectIndex,
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        let push = SheetSnapshot::fetch(self.service.as_ref(), self.push_sheet_id, None).await?;

        self.copy_identifiers(&push, index, &mut report).await?;
        self.surface_errors(&push, plans, &mut report).await?;

        let refreshed;
        let index = if report.index_written {
            let snapshot =
                SheetSnapshot::fetch(self.service.as_ref(), index.sheet_id(), None).await?;
            refreshed = ProjectIndex::build(Arc::new(snapshot), &self.columns.index);
            &refreshed
        } else {
            index
        };
        self.copy_tickets(plans, index, &mut report).await?;

        let creations = self.select_creations(plans, &mut report);
        self.stage(&push, creations, &mut report).await?;

        tracing::info!(
            identifiers_copied = report.identifiers_copied,
            errors_surfaced = report.errors_surfaced,
            tickets_copied = report.tickets_copied,
            staged = report.staged,
            deferred = report.deferred,
            flipped = report.flipped,
            "Ticket pipeline finished"
        );
        Ok(report)
    }

    /// Phase 1.
    async fn copy_identifiers(
        &self,
        push: &SheetSnapshot,
        index: &ProjectIndex,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let names = &self.columns.push;
        let mut identifiers: HashMap<String, String> = HashMap::new();
        for row in push.rows() {
            let Some(ticket) = Ticket::parse(push.value_by_name(row, &names.ticket).as_deref())
                .key()
                .map(str::to_ascii_uppercase)
            else {
                continue;
            };
            let Some(identifier) = push
                .value_by_name(row, &names.uuid)
                .filter(|id| RowIdentifier::is_valid(id))
            else {
                continue;
            };
            match identifiers.get(&ticket) {
                Some(existing) if *existing != identifier => {
                    tracing::warn!(
                        ticket = %ticket,
                        kept = %existing,
                        ignored = %identifier,
                        "Ticket staged from several plan rows"
                    );
                }
                Some(_) => {}
                None => {
                    identifiers.insert(ticket, identifier);
                }
            }
        }

        let snapshot = index.snapshot();
        let Some(uuid_column) = snapshot.column_id(&self.columns.index.uuid) else {
            tracing::warn!(sheet_id = snapshot.id, "Index sheet has no identifier column");
            return Ok(());
        };
        let mut batch = UpdateBatch::new(snapshot.id);
        for row in snapshot.rows() {
            if snapshot.value_by_name(row, &self.columns.index.uuid).is_some() {
                continue;
            }
            let Some(ticket) = snapshot.value_by_name(row, &self.columns.index.ticket) else {
                continue;
            };
            if let Some(identifier) = identifiers.get(&ticket.to_ascii_uppercase()) {
                batch.push(
                    row.id,
                    (snapshot.id, row.id),
                    CellUpdate::text(uuid_column, identifier.clone()),
                );
            }
        }

        let written = batch.flush(self.service.as_ref(), &mut report.writes).await?;
        report.identifiers_copied += written.written.len();
        report.index_written = !written.written.is_empty();
        fatal_error(written)
    }

    /// Phase 2.
    async fn surface_errors(
        &self,
        push: &SheetSnapshot,
        plans: &[Arc<SheetSnapshot>],
        report: &mut PipelineReport,
    ) -> Result<()> {
        let names = &self.columns.push;
        let mut ticket_columns: HashMap<SheetId, Option<ColumnId>> = HashMap::new();
        let mut batches: BTreeMap<SheetId, UpdateBatch> = BTreeMap::new();

        for row in push.rows() {
            let Some(status) = push.value_by_name(row, &names.sync_status) else {
                continue;
            };
            // A created ticket is copied back in phase 3
            if Ticket::parse(push.value_by_name(row, &names.ticket).as_deref())
                .key()
                .is_some()
            {
                continue;
            }
            let Some(origin) = push
                .value_by_name(row, &names.uuid)
                .and_then(|id| RowIdentifier::parse(&id))
            else {
                continue;
            };

            let column = match ticket_columns.get(&origin.sheet_id) {
                Some(column) => *column,
                None => {
                    let column = self.ticket_column(origin.sheet_id, plans).await?;
                    ticket_columns.insert(origin.sheet_id, column);
                    column
                }
            };
            let Some(column) = column else {
                continue;
            };

            let plan_row = self.service.get_row(origin.sheet_id, origin.row_id).await;
            let Some(plan_row) = tolerate(plan_row, "Fetch originating plan row")? else {
                continue;
            };
            let current = plan_row.cell(column).and_then(|c| c.text());
            if !Ticket::parse(current.as_deref()).is_pending() {
                continue;
            }

            tracing::info!(
                sheet_id = origin.sheet_id,
                row_id = origin.row_id,
                status = %status,
                "Ticket creation failed upstream"
            );
            batches
                .entry(origin.sheet_id)
                .or_insert_with(|| UpdateBatch::new(origin.sheet_id))
                .push(
                    origin.row_id,
                    (origin.sheet_id, origin.row_id),
                    CellUpdate::text(column, status),
                );
        }

        for batch in batches.into_values() {
            let written = batch.flush(self.service.as_ref(), &mut report.writes).await?;
            report.errors_surfaced += written.written.len();
            fatal_error(written)?;
        }
        Ok(())
    }

    /// Ticket column of a plan sheet, from its snapshot or a column-only fetch.
    async fn ticket_column(
        &self,
        sheet_id: SheetId,
        plans: &[Arc<SheetSnapshot>],
    ) -> Result<Option<ColumnId>> {
        if let Some(snapshot) = plans.iter().find(|s| s.id == sheet_id) {
            return Ok(snapshot.column_id(&self.columns.plan.ticket));
        }
        let sheet = self.service.get_sheet(sheet_id, Some(Utc::now())).await;
        Ok(tolerate(sheet, "Fetch plan sheet columns")?.and_then(|sheet| {
            sheet
                .columns
                .iter()
                .find(|c| c.title == self.columns.plan.ticket)
                .map(|c| c.id)
        }))
    }

    /// Phase 3.
    async fn copy_tickets(
        &self,
        plans: &[Arc<SheetSnapshot>],
        index: &ProjectIndex,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let names = &self.columns.plan;
        for snapshot in plans {
            if !snapshot.has_columns(&[names.uuid.as_str(), names.ticket.as_str()]) {
                continue;
            }
            let Some(ticket_column) = snapshot.column_id(&names.ticket) else {
                continue;
            };
            let mut batch = UpdateBatch::new(snapshot.id);
            for row in snapshot.rows() {
                if snapshot.is_summary(row, &names.summary) {
                    continue;
                }
                if !Ticket::parse(snapshot.value_by_name(row, &names.ticket).as_deref())
                    .is_pending()
                {
                    continue;
                }
                let Some(ticket) = snapshot
                    .value_by_name(row, &names.uuid)
                    .and_then(|id| index.ticket_for(&id))
                else {
                    continue;
                };
                batch.push(
                    row.id,
                    (snapshot.id, row.id),
                    CellUpdate::text(ticket_column, ticket),
                );
            }
            let written = batch.flush(self.service.as_ref(), &mut report.writes).await?;
            report.tickets_copied += written.written.len();
            fatal_error(written)?;
        }
        Ok(())
    }

    /// Phase 4.
    fn select_creations(
        &self,
        plans: &[Arc<SheetSnapshot>],
        report: &mut PipelineReport,
    ) -> Vec<Creation> {
        let mut creations = Vec::new();
        for snapshot in plans {
            for row in snapshot.rows() {
                match select(snapshot, row, &self.columns.plan, &self.default_project_key) {
                    Selection::Stage(creation) => creations.push(creation),
                    Selection::Deferred => report.deferred += 1,
                    Selection::Skip => {}
                }
            }
        }
        creations
    }

    fn staging_row(&self, push: &SheetSnapshot, creation: &Creation) -> Result<RowUpdate> {
        let names = &self.columns.push;
        let column = |name: &str| {
            push.column_id(name).ok_or_else(|| {
                SyncError::configuration(format!("Push sheet has no '{}' column", name))
            })
        };

        let mut cells = vec![CellUpdate::text(column(&names.uuid)?, creation.identifier.clone())];
        if let Some(task) = &creation.task {
            cells.push(CellUpdate::text(column(&names.task)?, task.clone()));
        }
        cells.push(CellUpdate::text(
            column(&names.issue_type)?,
            creation.issue_type.clone(),
        ));
        cells.push(CellUpdate::text(
            column(&names.project_key)?,
            creation.project_key.clone(),
        ));
        cells.push(CellUpdate::with_value(
            column(&names.components)?,
            CellValue::multi_picklist(COMPONENTS),
        ));
        if !creation.labels.is_empty() {
            cells.push(CellUpdate::with_value(
                column(&names.labels)?,
                CellValue::multi_picklist(creation.labels.iter().cloned()),
            ));
        }
        if creation.issue_type.eq_ignore_ascii_case("Epic") {
            if let Some(task) = &creation.task {
                cells.push(CellUpdate::text(column(&names.epic_name)?, task.clone()));
            }
        }
        match &creation.parent {
            ParentLink::IssueLinks(link) => {
                cells.push(CellUpdate::text(column(&names.issue_links)?, link.clone()))
            }
            ParentLink::EpicLink(parent) => {
                cells.push(CellUpdate::text(column(&names.epic_link)?, parent.clone()))
            }
            ParentLink::None => {}
        }
        Ok(RowUpdate::append(cells))
    }

    /// Phase 5.
    async fn stage(
        &self,
        push: &SheetSnapshot,
        creations: Vec<Creation>,
        report: &mut PipelineReport,
    ) -> Result<()> {
        if creations.is_empty() {
            return Ok(());
        }
        let rows = creations
            .iter()
            .map(|c| self.staging_row(push, c))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(rows = rows.len(), "Staging ticket creations");
        let staged = self
            .service
            .write_rows(push.id, &rows, WriteMode::Add)
            .await?;
        report.writes.record(push.id, &staged);
        report.staged += staged.written.len();

        let mut flips: BTreeMap<SheetId, UpdateBatch> = BTreeMap::new();
        for (position, creation) in creations.iter().enumerate() {
            if !staged.accepted(position) {
                continue;
            }
            flips
                .entry(creation.sheet_id)
                .or_insert_with(|| UpdateBatch::new(creation.sheet_id))
                .push(
                    creation.row_id,
                    (creation.sheet_id, creation.row_id),
                    CellUpdate::text(creation.ticket_column, PENDING),
                );
        }

        let mut fatal = fatal_error(staged);
        for batch in flips.into_values() {
            let written = batch.flush(self.service.as_ref(), &mut report.writes).await?;
            report.flipped += written.written.len();
            if let Err(error) = fatal_error(written) {
                fatal = fatal.and(Err(error));
            }
        }
        fatal
    }
}
