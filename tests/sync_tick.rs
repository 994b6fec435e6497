//! End-to-end sync tick scenarios against the in-memory sheet service.
//!
//! Test Flow:
//! 1. Lay out a workspace with a plan sheet, the index sheet and the push sheet
//! 2. Run orchestrator ticks
//! 3. Play the external tracker by editing the index and push sheets
//! 4. Verify the cells the engine wrote and the writes it issued
//!
//! Run with: cargo test --test sync_tick

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use plan_sync::config::{Environment, SyncConfig};
use plan_sync::sheets::model::{
    Cell, CellHistory, Column, ColumnId, FolderContents, FolderId, LinkStatus, Row, RowId,
    RowUpdate, Sheet, SheetId, SheetSummary, WorkspaceId, WriteMode,
};
use plan_sync::sheets::{InMemorySheets, SheetService, SheetSnapshot};
use plan_sync::sync::identifier::RowIdentifier;
use plan_sync::sync::reconciler::BidirectionalReconciler;
use plan_sync::sync::ticket::{unknown_ticket_warning, PENDING};
use plan_sync::sync::{Orchestrator, ProjectIndex};
use plan_sync::{ErrorKind, Result};

const WORKSPACE: i64 = 1;
const PLAN: SheetId = 100;
const INDEX: SheetId = 900;
const PUSH: SheetId = 901;

const PLAN_COLUMNS: [&str; 11] = [
    "Tasks",
    "UUID",
    "Jira Ticket",
    "Jira Status",
    "Assigned To",
    "Summary",
    "Team",
    "Issue Type",
    "Parent Ticket",
    "Parent Issue Type",
    "Project Key",
];
const INDEX_COLUMNS: [&str; 5] = ["Jira Ticket", "Jira Status", "Tasks", "Assignee", "UUID"];
const PUSH_COLUMNS: [&str; 11] = [
    "UUID",
    "Tasks",
    "Jira Ticket",
    "Issue Type",
    "Project Key",
    "Components",
    "Labels",
    "Epic Name",
    "Epic Link",
    "Issue Links",
    "Sync Status",
];

fn config() -> SyncConfig {
    let yaml = format!(
        "dev:\n  workspace_ids: [{}]\n  index_sheet_id: {}\n  push_sheet_id: {}\n  lookback_minutes: 60\n",
        WORKSPACE, INDEX, PUSH
    );
    SyncConfig::from_yaml(&yaml, Environment::Dev).unwrap()
}

/// Workspace with the index and push sheets; the plan sheet is added by
/// each test.
fn workspace() -> Arc<InMemorySheets> {
    let sheets = Arc::new(InMemorySheets::new());
    sheets.create_sheet(INDEX, "Ticket Index", &INDEX_COLUMNS);
    sheets.create_sheet(PUSH, "Push Tickets", &PUSH_COLUMNS);
    sheets.add_workspace(
        WORKSPACE,
        FolderContents {
            id: WORKSPACE,
            name: "Delivery".to_string(),
            folders: vec![],
            sheets: [PLAN, INDEX, PUSH]
                .into_iter()
                .map(|id| SheetSummary {
                    id,
                    name: format!("Sheet {}", id),
                    modified_at: None,
                })
                .collect(),
        },
    );
    sheets
}

fn orchestrator(sheets: &Arc<InMemorySheets>) -> Orchestrator {
    Orchestrator::new(sheets.clone(), config())
}

fn row_ids(sheets: &InMemorySheets, sheet_id: SheetId) -> Vec<RowId> {
    sheets
        .sheet(sheet_id)
        .map(|s| s.rows.iter().map(|r| r.id).collect())
        .unwrap_or_default()
}

fn writes_to(sheets: &InMemorySheets, sheet_id: SheetId) -> usize {
    sheets
        .writes()
        .iter()
        .filter(|w| w.sheet_id == sheet_id)
        .count()
}

/// Canonical identifier of a plan row, written as a user-visible value.
fn assign_identifier(sheets: &InMemorySheets, row_id: RowId) -> String {
    let sheet = sheets.sheet(PLAN).unwrap();
    let uuid_column = sheet.columns.iter().find(|c| c.title == "UUID").unwrap().id;
    let row = sheet.rows.iter().find(|r| r.id == row_id).unwrap();
    let identifier = RowIdentifier::for_row(PLAN, row, uuid_column)
        .unwrap()
        .to_string();
    sheets.set_cell(PLAN, row_id, "UUID", json!(identifier.clone()));
    identifier
}

fn text(sheets: &InMemorySheets, sheet_id: SheetId, row_id: RowId, title: &str) -> Option<String> {
    sheets.cell_text(sheet_id, row_id, title)
}

/// Push row staged for the plan row carrying `identifier`.
fn push_row_for(sheets: &InMemorySheets, identifier: &str) -> RowId {
    row_ids(sheets, PUSH)
        .into_iter()
        .find(|&id| text(sheets, PUSH, id, "UUID").as_deref() == Some(identifier))
        .unwrap_or_else(|| panic!("no push row for {}", identifier))
}

/// Hands control back to the runtime before every call, so that concurrent
/// passes interleave at each request.
struct YieldingSheets(Arc<InMemorySheets>);

#[async_trait]
impl SheetService for YieldingSheets {
    async fn get_sheet(
        &self,
        sheet_id: SheetId,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<Sheet> {
        tokio::task::yield_now().await;
        self.0.get_sheet(sheet_id, modified_since).await
    }

    async fn get_row(&self, sheet_id: SheetId, row_id: RowId) -> Result<Row> {
        tokio::task::yield_now().await;
        self.0.get_row(sheet_id, row_id).await
    }

    async fn get_cell_history(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        column_id: ColumnId,
        limit: usize,
    ) -> Result<Vec<CellHistory>> {
        tokio::task::yield_now().await;
        self.0
            .get_cell_history(sheet_id, row_id, column_id, limit)
            .await
    }

    async fn list_workspace(&self, workspace_id: WorkspaceId) -> Result<FolderContents> {
        tokio::task::yield_now().await;
        self.0.list_workspace(workspace_id).await
    }

    async fn list_folder(&self, folder_id: FolderId) -> Result<FolderContents> {
        tokio::task::yield_now().await;
        self.0.list_folder(folder_id).await
    }

    async fn write_chunk(
        &self,
        sheet_id: SheetId,
        rows: &[RowUpdate],
        mode: WriteMode,
    ) -> Result<Vec<Row>> {
        tokio::task::yield_now().await;
        self.0.write_chunk(sheet_id, rows, mode).await
    }
}

#[tokio::test]
async fn test_identifier_assignment() {
    let sheets = workspace();
    let created: DateTime<Utc> = Utc.with_ymd_and_hms(2021, 11, 18, 21, 23, 54).unwrap();
    sheets.insert_sheet(Sheet {
        id: PLAN,
        name: "Plan".to_string(),
        columns: vec![
            Column {
                id: 7,
                title: "UUID".to_string(),
                ..Default::default()
            },
            Column {
                id: 8,
                title: "Tasks".to_string(),
                ..Default::default()
            },
            Column {
                id: 9,
                title: "Summary".to_string(),
                ..Default::default()
            },
        ],
        rows: vec![
            Row {
                id: 42,
                created_at: Some(created),
                modified_at: Some(created),
                cells: vec![Cell {
                    column_id: 8,
                    value: Some(json!("Write the runbook")),
                    ..Default::default()
                }],
                ..Default::default()
            },
            Row {
                id: 43,
                created_at: Some(created),
                modified_at: Some(created),
                cells: vec![Cell {
                    column_id: 9,
                    value: Some(json!(true)),
                    ..Default::default()
                }],
                ..Default::default()
            },
        ],
        modified_at: Some(created),
    });
    let orchestrator = orchestrator(&sheets);

    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.identifiers_assigned, 1);
    assert_eq!(
        text(&sheets, PLAN, 42, "UUID").as_deref(),
        Some("100-42-7-20211118212354")
    );
    // Summary rows are never written
    assert_eq!(text(&sheets, PLAN, 43, "UUID"), None);

    sheets.clear_writes();
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.identifiers_assigned, 0);
    assert_eq!(report.rows_written, 0);
    assert!(sheets.writes().is_empty());
}

#[tokio::test]
async fn test_ticket_creation_happy_path() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let row = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Build the ingest job")),
            ("Jira Ticket", json!("Create")),
            ("Team", json!("Data Platform")),
        ],
    );
    let orchestrator = orchestrator(&sheets);

    // Tick 1: staged and flipped
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.staged, 1);
    assert_eq!(report.flipped, 1);
    assert_eq!(text(&sheets, PLAN, row, "Jira Ticket").as_deref(), Some(PENDING));

    let identifier = text(&sheets, PLAN, row, "UUID").unwrap();
    assert!(RowIdentifier::is_valid(&identifier));
    let push_rows = row_ids(&sheets, PUSH);
    assert_eq!(push_rows.len(), 1);
    let push_row = push_rows[0];
    assert_eq!(text(&sheets, PUSH, push_row, "UUID"), Some(identifier.clone()));
    assert_eq!(
        text(&sheets, PUSH, push_row, "Tasks").as_deref(),
        Some("Build the ingest job")
    );
    assert_eq!(text(&sheets, PUSH, push_row, "Issue Type").as_deref(), Some("Task"));
    assert_eq!(text(&sheets, PUSH, push_row, "Project Key").as_deref(), Some("PROJ"));
    assert_eq!(text(&sheets, PUSH, push_row, "Jira Ticket"), None);
    assert_eq!(
        text(&sheets, PUSH, push_row, "Components").as_deref(),
        Some("Autogenerated by Smartsheet, Sync to Smartsheet")
    );
    assert_eq!(
        text(&sheets, PUSH, push_row, "Labels").as_deref(),
        Some("Data-Platform")
    );

    // The tracker creates ABC-1
    let index_row = sheets.add_row(
        INDEX,
        &[
            ("Jira Ticket", json!("ABC-1")),
            ("Jira Status", json!("Open")),
            ("Tasks", json!("Build the ingest job")),
            ("Assignee", json!("jane@example.com")),
            ("UUID", json!(identifier.clone())),
        ],
    );
    sheets.set_cell(PUSH, push_row, "Jira Ticket", json!("ABC-1"));

    // Tick 2: key copied back and linked
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.tickets_copied, 1);
    assert_eq!(report.staged, 0);
    assert_eq!(report.links_installed, 4);
    assert_eq!(text(&sheets, PLAN, row, "Jira Ticket").as_deref(), Some("ABC-1"));
    for (title, expected) in [
        ("Jira Ticket", "ABC-1"),
        ("Jira Status", "Open"),
        ("Tasks", "Build the ingest job"),
        ("Assigned To", "jane@example.com"),
    ] {
        let cell = sheets.cell(PLAN, row, title).unwrap();
        let link = cell.link_in_from_cell.clone().unwrap();
        assert_eq!(link.status, Some(LinkStatus::Ok), "{} not linked", title);
        assert_eq!((link.sheet_id, link.row_id), (INDEX, index_row));
        assert_eq!(cell.text().as_deref(), Some(expected));
    }
    assert_eq!(row_ids(&sheets, PUSH).len(), 1);

    // Linked cells follow the index
    sheets.set_cell(INDEX, index_row, "Jira Status", json!("In Progress"));
    assert_eq!(
        text(&sheets, PLAN, row, "Jira Status").as_deref(),
        Some("In Progress")
    );

    // Tick 3: steady state
    sheets.clear_writes();
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.rows_written, 0);
    assert!(sheets.writes().is_empty());
}

#[tokio::test]
async fn test_sync_error_surfaced() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let row = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Migrate the warehouse")),
            ("Jira Ticket", json!(PENDING)),
            ("Team", json!("Data Platform")),
        ],
    );
    let identifier = assign_identifier(&sheets, row);
    sheets.add_row(
        PUSH,
        &[
            ("UUID", json!(identifier)),
            ("Tasks", json!("Migrate the warehouse")),
            ("Sync Status", json!("reasonPhrase: Bad Request")),
        ],
    );
    let orchestrator = orchestrator(&sheets);

    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.errors_surfaced, 1);
    assert_eq!(
        text(&sheets, PLAN, row, "Jira Ticket").as_deref(),
        Some("reasonPhrase: Bad Request")
    );

    // No further creation attempt
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.errors_surfaced, 0);
    assert_eq!(report.staged, 0);
    assert_eq!(row_ids(&sheets, PUSH).len(), 1);
}

#[tokio::test]
async fn test_unknown_ticket_warning() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let row = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Legacy work")),
            ("Jira Ticket", json!("XYZ-999")),
        ],
    );
    let orchestrator = orchestrator(&sheets);

    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.warnings, 1);
    let warning = text(&sheets, PLAN, row, "Jira Ticket").unwrap();
    assert_eq!(warning, unknown_ticket_warning("XYZ-999"));
    assert!(warning.starts_with("[WARNING]; XYZ-999 not found in the index sheet"));

    sheets.clear_writes();
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.warnings, 0);
    assert_eq!(writes_to(&sheets, PLAN), 0);
}

#[tokio::test]
async fn test_last_writer_wins_and_is_idempotent() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    sheets.set_now(start);
    let plan_row = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Ship it")),
            ("Jira Ticket", json!("ABC-1")),
            ("Jira Status", json!("In Progress")),
        ],
    );
    sheets.advance(10);
    let index_row = sheets.add_row(
        INDEX,
        &[
            ("Jira Ticket", json!("ABC-1")),
            ("Jira Status", json!("Done")),
            ("Tasks", json!("Ship it")),
        ],
    );
    // Row edits elsewhere on the index row put it outside the row guard band
    sheets.touch_row(INDEX, index_row, start + Duration::seconds(30));

    let columns = config().columns;
    let reconciler = BidirectionalReconciler::new(sheets.clone(), columns.clone());

    let snapshot = |id| {
        let sheets = sheets.clone();
        async move { Arc::new(SheetSnapshot::fetch(sheets.as_ref(), id, None).await.unwrap()) }
    };
    let plan = snapshot(PLAN).await;
    let index = ProjectIndex::build(snapshot(INDEX).await, &columns.index);

    let report = reconciler.reconcile(&[plan], &index).await.unwrap();
    assert_eq!(report.plan_cells, 1);
    assert_eq!(report.index_cells, 0);
    assert_eq!(
        text(&sheets, PLAN, plan_row, "Jira Status").as_deref(),
        Some("Done")
    );
    assert_eq!(text(&sheets, INDEX, index_row, "Jira Status").as_deref(), Some("Done"));

    let plan = snapshot(PLAN).await;
    let index = ProjectIndex::build(snapshot(INDEX).await, &columns.index);
    sheets.clear_writes();
    let report = reconciler.reconcile(&[plan], &index).await.unwrap();
    assert_eq!(report.plan_cells + report.index_cells, 0);
    assert!(sheets.writes().is_empty());
}

#[tokio::test]
async fn test_plan_edit_flows_to_index() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    sheets.set_now(start);
    let index_row = sheets.add_row(
        INDEX,
        &[("Jira Ticket", json!("ABC-2")), ("Tasks", json!("Old title"))],
    );
    sheets.advance(60);
    let plan_row = sheets.add_row(
        PLAN,
        &[("Jira Ticket", json!("ABC-2")), ("Tasks", json!("New title"))],
    );

    let columns = config().columns;
    let reconciler = BidirectionalReconciler::new(sheets.clone(), columns.clone());
    let plan = Arc::new(SheetSnapshot::fetch(sheets.as_ref(), PLAN, None).await.unwrap());
    let index = ProjectIndex::build(
        Arc::new(SheetSnapshot::fetch(sheets.as_ref(), INDEX, None).await.unwrap()),
        &columns.index,
    );

    let report = reconciler.reconcile(&[plan], &index).await.unwrap();
    assert_eq!(report.index_cells, 1);
    assert_eq!(
        text(&sheets, INDEX, index_row, "Tasks").as_deref(),
        Some("New title")
    );
    assert_eq!(text(&sheets, PLAN, plan_row, "Tasks").as_deref(), Some("New title"));
}

#[tokio::test]
async fn test_rejected_staging_write_is_retried() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let row = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Retry me")),
            ("Jira Ticket", json!("create")),
            ("Team", json!("Ops")),
        ],
    );
    let orchestrator = orchestrator(&sheets);
    orchestrator.initialize().await.unwrap();

    sheets.fail_next_write(PUSH, ErrorKind::Transient);
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.staged, 0);
    assert_eq!(report.flipped, 0);
    assert!(report.rows_failed >= 1);
    assert_eq!(text(&sheets, PLAN, row, "Jira Ticket").as_deref(), Some("create"));
    assert!(row_ids(&sheets, PUSH).is_empty());

    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.staged, 1);
    assert_eq!(text(&sheets, PLAN, row, "Jira Ticket").as_deref(), Some(PENDING));
    assert_eq!(row_ids(&sheets, PUSH).len(), 1);
}

#[tokio::test]
async fn test_fatal_write_aborts_tick() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    sheets.add_row(PLAN, &[("Tasks", json!("Anything"))]);
    let orchestrator = orchestrator(&sheets);

    sheets.fail_next_write(PLAN, ErrorKind::Permanent);
    let err = orchestrator.tick(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);

    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.identifiers_assigned, 1);
    assert_eq!(orchestrator.sheet_ids().await, vec![PLAN]);
}

#[tokio::test]
async fn test_push_identifier_reaches_index_and_ticket_returns() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let first = sheets.add_row(
        PLAN,
        &[("Tasks", json!("Tune the cache")), ("Jira Ticket", json!(PENDING))],
    );
    let second = sheets.add_row(
        PLAN,
        &[("Tasks", json!("Tune the cache again")), ("Jira Ticket", json!(PENDING))],
    );
    let first_id = assign_identifier(&sheets, first);
    let second_id = assign_identifier(&sheets, second);

    // The tracker created ABC-7 and wrote the key on the push rows, but not
    // the identifier on the index row. Both push rows claim the same ticket.
    sheets.add_row(
        PUSH,
        &[("UUID", json!(first_id.clone())), ("Jira Ticket", json!("ABC-7"))],
    );
    sheets.add_row(
        PUSH,
        &[("UUID", json!(second_id)), ("Jira Ticket", json!("ABC-7"))],
    );
    let index_row = sheets.add_row(
        INDEX,
        &[("Jira Ticket", json!("ABC-7")), ("Tasks", json!("Tune the cache"))],
    );
    let orchestrator = orchestrator(&sheets);

    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.identifiers_copied, 1);
    assert_eq!(report.tickets_copied, 1);
    assert_eq!(report.staged, 0);

    // First identifier wins; the ticket maps to exactly one plan row
    assert_eq!(text(&sheets, INDEX, index_row, "UUID"), Some(first_id));
    assert_eq!(text(&sheets, PLAN, first, "Jira Ticket").as_deref(), Some("ABC-7"));
    assert_eq!(text(&sheets, PLAN, second, "Jira Ticket").as_deref(), Some(PENDING));

    sheets.clear_writes();
    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.identifiers_copied, 0);
    assert_eq!(report.tickets_copied, 0);
    assert_eq!(writes_to(&sheets, INDEX), 0);
}

#[tokio::test]
async fn test_staging_rows_carry_parent_relationships() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let epic = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Platform revamp")),
            ("Jira Ticket", json!("Create")),
            ("Team", json!("Core")),
            ("Issue Type", json!("Epic")),
        ],
    );
    let story = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("New login page")),
            ("Jira Ticket", json!("Create")),
            ("Team", json!("Core")),
            ("Issue Type", json!("Story")),
            ("Parent Ticket", json!("ABC-10")),
            ("Parent Issue Type", json!("Epic")),
        ],
    );
    let task = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Rotate keys")),
            ("Jira Ticket", json!("Create")),
            ("Team", json!("Core")),
            ("Issue Type", json!("Task")),
            ("Parent Ticket", json!("XYZ-3")),
            ("Parent Issue Type", json!("Task")),
        ],
    );
    let orchestrator = orchestrator(&sheets);

    let report = orchestrator.tick(None).await.unwrap();
    assert_eq!(report.staged, 3);
    assert_eq!(report.flipped, 3);

    let staged = |row| {
        let identifier = text(&sheets, PLAN, row, "UUID").unwrap();
        push_row_for(&sheets, &identifier)
    };

    let epic_push = staged(epic);
    assert_eq!(text(&sheets, PUSH, epic_push, "Issue Type").as_deref(), Some("Epic"));
    assert_eq!(
        text(&sheets, PUSH, epic_push, "Epic Name").as_deref(),
        Some("Platform revamp")
    );
    assert_eq!(text(&sheets, PUSH, epic_push, "Project Key").as_deref(), Some("PROJ"));
    assert_eq!(text(&sheets, PUSH, epic_push, "Epic Link"), None);
    assert_eq!(text(&sheets, PUSH, epic_push, "Issue Links"), None);

    let story_push = staged(story);
    assert_eq!(
        text(&sheets, PUSH, story_push, "Epic Link").as_deref(),
        Some("ABC-10")
    );
    assert_eq!(text(&sheets, PUSH, story_push, "Issue Links"), None);
    assert_eq!(text(&sheets, PUSH, story_push, "Epic Name"), None);
    assert_eq!(text(&sheets, PUSH, story_push, "Project Key").as_deref(), Some("ABC"));

    let task_push = staged(task);
    assert_eq!(
        text(&sheets, PUSH, task_push, "Issue Links").as_deref(),
        Some("implements XYZ-3")
    );
    assert_eq!(text(&sheets, PUSH, task_push, "Epic Link"), None);
    assert_eq!(text(&sheets, PUSH, task_push, "Project Key").as_deref(), Some("XYZ"));
}

#[tokio::test]
async fn test_edits_within_row_guard_are_left_alone() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    sheets.set_now(start - Duration::seconds(600));
    let plan_row = sheets.add_row(
        PLAN,
        &[("Jira Ticket", json!("ABC-1")), ("Jira Status", json!("Open"))],
    );
    let index_row = sheets.add_row(
        INDEX,
        &[("Jira Ticket", json!("ABC-1")), ("Jira Status", json!("Open"))],
    );

    // Status edited on the plan at T and on the index at T+10s
    sheets.set_now(start);
    sheets.set_cell(PLAN, plan_row, "Jira Status", json!("In Progress"));
    sheets.set_now(start + Duration::seconds(10));
    sheets.set_cell(INDEX, index_row, "Jira Status", json!("Done"));

    let columns = config().columns;
    let reconciler = BidirectionalReconciler::new(sheets.clone(), columns.clone());
    let plan = Arc::new(SheetSnapshot::fetch(sheets.as_ref(), PLAN, None).await.unwrap());
    let index = ProjectIndex::build(
        Arc::new(SheetSnapshot::fetch(sheets.as_ref(), INDEX, None).await.unwrap()),
        &columns.index,
    );

    sheets.clear_writes();
    let report = reconciler.reconcile(&[plan], &index).await.unwrap();
    assert_eq!(report.rows_in_guard, 1);
    assert_eq!(report.plan_cells + report.index_cells, 0);
    assert!(sheets.writes().is_empty());
    assert_eq!(
        text(&sheets, PLAN, plan_row, "Jira Status").as_deref(),
        Some("In Progress")
    );
    assert_eq!(text(&sheets, INDEX, index_row, "Jira Status").as_deref(), Some("Done"));
}

#[tokio::test]
async fn test_overlapping_passes_stage_once() {
    let sheets = workspace();
    sheets.create_sheet(PLAN, "Plan", &PLAN_COLUMNS);
    let row = sheets.add_row(
        PLAN,
        &[
            ("Tasks", json!("Only once")),
            ("Jira Ticket", json!("Create")),
            ("Team", json!("Ops")),
        ],
    );
    let orchestrator = Orchestrator::new(Arc::new(YieldingSheets(sheets.clone())), config());

    // An incremental pass and a full pass fired together
    let (incremental, full) = tokio::join!(
        orchestrator.tick(Some(Duration::minutes(60))),
        orchestrator.tick(None)
    );
    let staged = incremental.unwrap().staged + full.unwrap().staged;

    assert_eq!(staged, 1);
    assert_eq!(row_ids(&sheets, PUSH).len(), 1);
    assert_eq!(text(&sheets, PLAN, row, "Jira Ticket").as_deref(), Some(PENDING));
}
