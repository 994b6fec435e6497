//! Tick orchestration
//!
//! Owns the shared state of the engine behind three coarse locks, always
//! taken in the order `sheet_ids` → `sheet_index` → `project_index`:
//!
//! - `sheet_ids`: plan sheets found by the last discovery
//! - `sheet_index`: plan sheet snapshots by id
//! - `project_index`: index sheet snapshot and its ticket lookup
//!
//! Only `initialize` holds more than one at a time. Components get cloned
//! `Arc<SheetSnapshot>`s and never lock.
//!
//! Passes are serialized by `pass_gate`, taken before any of the above and
//! held for a whole `initialize` or `tick`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::scheduler::Job;
use crate::sheets::model::SheetId;
use crate::sheets::{SheetService, SheetSnapshot};

use super::discovery::Discovery;
use super::identifier::IdentifierService;
use super::index::ProjectIndex;
use super::linker::FieldLinker;
use super::reconciler::BidirectionalReconciler;
use super::tickets::TicketCreationPipeline;
use super::{tolerate, WriteTally};

/// Counts from one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sheets: usize,
    pub identifiers_assigned: usize,
    pub identifiers_copied: usize,
    pub errors_surfaced: usize,
    pub tickets_copied: usize,
    pub staged: usize,
    pub deferred: usize,
    pub flipped: usize,
    pub links_installed: usize,
    pub broken_links_replaced: usize,
    pub warnings: usize,
    pub plan_cells_reconciled: usize,
    pub index_cells_reconciled: usize,
    pub rows_written: usize,
    pub rows_failed: usize,
}

pub struct Orchestrator {
    service: Arc<dyn SheetService>,
    config: SyncConfig,
    discovery: Discovery,
    identifiers: IdentifierService,
    pipeline: TicketCreationPipeline,
    linker: FieldLinker,
    reconciler: BidirectionalReconciler,
    sheet_ids: Mutex<Vec<SheetId>>,
    sheet_index: Mutex<BTreeMap<SheetId, Arc<SheetSnapshot>>>,
    project_index: Mutex<Option<Arc<ProjectIndex>>>,
    pass_gate: Mutex<()>,
}

impl Orchestrator {
    pub fn new(service: Arc<dyn SheetService>, config: SyncConfig) -> Self {
        let columns = config.columns.clone();
        Self {
            discovery: Discovery::new(
                service.clone(),
                config.workspace_ids.clone(),
                vec![config.index_sheet_id, config.push_sheet_id],
            ),
            identifiers: IdentifierService::new(service.clone(), columns.plan.clone()),
            pipeline: TicketCreationPipeline::new(
                service.clone(),
                columns.clone(),
                config.push_sheet_id,
                config.default_project_key.clone(),
            ),
            linker: FieldLinker::new(service.clone(), columns.clone()),
            reconciler: BidirectionalReconciler::new(service.clone(), columns),
            service,
            config,
            sheet_ids: Mutex::new(Vec::new()),
            sheet_index: Mutex::new(BTreeMap::new()),
            project_index: Mutex::new(None),
            pass_gate: Mutex::new(()),
        }
    }

    /// Full discovery and snapshot load, holding all three locks.
    pub async fn initialize(&self) -> Result<()> {
        let _pass = self.pass_gate.lock().await;
        let mut sheet_ids = self.sheet_ids.lock().await;
        let mut sheet_index = self.sheet_index.lock().await;
        let mut project_index = self.project_index.lock().await;

        *sheet_ids = self.discovery.discover(None).await?;
        *sheet_index = self.load_plans(&sheet_ids, None).await?;
        let index = self.load_index().await?;
        if index.is_empty() {
            tracing::warn!(
                sheet_id = self.config.index_sheet_id,
                "Index sheet holds no tickets"
            );
        }
        *project_index = Some(Arc::new(index));

        tracing::info!(
            sheets = sheet_ids.len(),
            tickets = project_index.as_ref().map_or(0, |i| i.len()),
            "Orchestrator initialized"
        );
        Ok(())
    }

    async fn load_index(&self) -> Result<ProjectIndex> {
        let snapshot =
            SheetSnapshot::fetch(self.service.as_ref(), self.config.index_sheet_id, None).await?;
        Ok(ProjectIndex::build(
            Arc::new(snapshot),
            &self.config.columns.index,
        ))
    }

    /// Fetch snapshots for `ids` concurrently; sheets that cannot be read are
    /// left out.
    async fn load_plans(
        &self,
        ids: &[SheetId],
        rows_since: Option<chrono::DateTime<Utc>>,
    ) -> Result<BTreeMap<SheetId, Arc<SheetSnapshot>>> {
        let fetches = ids
            .iter()
            .map(|&id| SheetSnapshot::fetch(self.service.as_ref(), id, rows_since));
        let results = join_all(fetches).await;

        let mut plans = BTreeMap::new();
        for (&id, snapshot) in ids.iter().zip(results) {
            if let Some(snapshot) = tolerate(snapshot, "Fetch plan sheet")? {
                plans.insert(id, Arc::new(snapshot));
            }
        }
        Ok(plans)
    }

    /// Replace the snapshots of `written`.
    async fn refresh_plans(
        &self,
        written: &BTreeSet<SheetId>,
        rows_since: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        let ids: Vec<SheetId> = written
            .iter()
            .copied()
            .filter(|id| *id != self.config.index_sheet_id && *id != self.config.push_sheet_id)
            .collect();
        let fresh = self.load_plans(&ids, rows_since).await?;
        self.sheet_index.lock().await.extend(fresh);
        Ok(())
    }

    async fn refresh_index(&self) -> Result<Arc<ProjectIndex>> {
        let index = Arc::new(self.load_index().await?);
        tracing::debug!(
            tickets = index.len(),
            fetched_at = %index.snapshot().fetched_at,
            "Index refreshed"
        );
        *self.project_index.lock().await = Some(index.clone());
        Ok(index)
    }

    /// Current plan sheet ids.
    pub async fn sheet_ids(&self) -> Vec<SheetId> {
        self.sheet_ids.lock().await.clone()
    }

    /// Current index lookup, if loaded.
    pub async fn project_index(&self) -> Option<Arc<ProjectIndex>> {
        self.project_index.lock().await.clone()
    }

    /// One sync pass over sheets modified within `lookback`; every sheet when
    /// `lookback` is `None`. A pass already in progress is waited for.
    pub async fn tick(&self, lookback: Option<Duration>) -> Result<TickReport> {
        let _pass = self.pass_gate.lock().await;
        let mut report = TickReport::default();
        let now = Utc::now();
        let since = lookback.map(|window| now - window);
        let rows_since = since.filter(|_| self.config.incremental_rows);

        // Discovery
        let ids = self.discovery.discover(since).await?;
        *self.sheet_ids.lock().await = ids.clone();
        report.sheets = ids.len();

        // Plan snapshots
        let loaded = self.load_plans(&ids, rows_since).await?;
        let mut plans: Vec<Arc<SheetSnapshot>> = {
            let mut sheet_index = self.sheet_index.lock().await;
            sheet_index.extend(loaded);
            ids.iter()
                .filter_map(|id| sheet_index.get(id).cloned())
                .collect()
        };
        let mut index = self.refresh_index().await?;

        // Identifiers
        let assigned = self.identifiers.assign(&plans).await?;
        report.identifiers_assigned = assigned.assigned;
        tally(&mut report, &assigned.writes);
        if !assigned.writes.sheets.is_empty() {
            plans = self.current(&ids, &assigned.writes.sheets, rows_since).await?;
        }

        // Ticket creation
        let pipeline = self.pipeline.run(&plans, &index).await?;
        report.identifiers_copied = pipeline.identifiers_copied;
        report.errors_surfaced = pipeline.errors_surfaced;
        report.tickets_copied = pipeline.tickets_copied;
        report.staged = pipeline.staged;
        report.deferred = pipeline.deferred;
        report.flipped = pipeline.flipped;
        tally(&mut report, &pipeline.writes);
        if !pipeline.writes.sheets.is_empty() {
            plans = self.current(&ids, &pipeline.writes.sheets, rows_since).await?;
        }
        index = self.refresh_index().await?;

        // Links
        let links = self.linker.link(&plans, &index).await?;
        report.links_installed = links.linked;
        report.broken_links_replaced = links.unlinked_broken;
        tally(&mut report, &links.writes);
        if !links.writes.sheets.is_empty() {
            plans = self.current(&ids, &links.writes.sheets, rows_since).await?;
        }

        // Reconciliation
        let reconciled = self.reconciler.reconcile(&plans, &index).await?;
        report.warnings = reconciled.warnings;
        report.plan_cells_reconciled = reconciled.plan_cells;
        report.index_cells_reconciled = reconciled.index_cells;
        tally(&mut report, &reconciled.writes);
        if reconciled.writes.sheets.contains(&self.config.index_sheet_id) {
            self.refresh_index().await?;
        }
        if !reconciled.writes.sheets.is_empty() {
            self.refresh_plans(&reconciled.writes.sheets, rows_since)
                .await?;
        }

        tracing::info!(
            sheets = report.sheets,
            rows_written = report.rows_written,
            rows_failed = report.rows_failed,
            staged = report.staged,
            links = report.links_installed,
            warnings = report.warnings,
            "Tick complete"
        );
        Ok(report)
    }

    /// Refresh `written` and return the snapshots of `ids` in order.
    async fn current(
        &self,
        ids: &[SheetId],
        written: &BTreeSet<SheetId>,
        rows_since: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<Arc<SheetSnapshot>>> {
        self.refresh_plans(written, rows_since).await?;
        let sheet_index = self.sheet_index.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| sheet_index.get(id).cloned())
            .collect())
    }
}

fn tally(report: &mut TickReport, writes: &WriteTally) {
    report.rows_written += writes.rows_written;
    report.rows_failed += writes.rows_failed;
}

/// Scheduler job running one tick.
pub struct SyncJob {
    name: String,
    orchestrator: Arc<Orchestrator>,
    lookback: Option<Duration>,
}

impl SyncJob {
    /// Incremental sync over the configured look-back window.
    pub fn incremental(orchestrator: Arc<Orchestrator>) -> Self {
        let lookback = orchestrator.config.lookback();
        Self {
            name: "sync".to_string(),
            orchestrator,
            lookback: Some(lookback),
        }
    }

    /// Sync of every plan sheet regardless of modification time.
    pub fn full(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            name: "full-sync".to_string(),
            orchestrator,
            lookback: None,
        }
    }
}

#[async_trait]
impl Job for SyncJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<()> {
        match self.orchestrator.tick(self.lookback).await {
            Ok(_) => Ok(()),
            Err(error) if error.kind().is_fatal() => Err(error),
            Err(error) => {
                tracing::warn!(
                    job = %self.name,
                    kind = %error.kind(),
                    error = %error,
                    "Tick aborted; retrying next run"
                );
                Ok(())
            }
        }
    }
}
