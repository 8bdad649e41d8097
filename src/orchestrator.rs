use crate::cabinet::CabinetMapping;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::events::{EventSink, EventTally, ReconcileEvent};
use crate::lookup::CategoryLookup;
use crate::model::{PrimaryTable, TargetEntry};
use crate::reconcile::{apply_outcome, reconcile_by_name};
use crate::store::{self, SheetRef};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use log::{debug, info};
use std::time::{Duration, Instant};

/// Where a run stands. A run only reaches `Done` straight after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Loading,
    Reconciling,
    Flushing,
    Done,
}

impl RunPhase {
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        matches!(
            (self, next),
            (RunPhase::Loading, RunPhase::Reconciling)
                | (RunPhase::Loading, RunPhase::Flushing)
                | (RunPhase::Reconciling, RunPhase::Flushing)
                | (RunPhase::Flushing, RunPhase::Reconciling)
                | (RunPhase::Flushing, RunPhase::Done)
        )
    }
}

/// How targets are resolved and how often progress is checkpointed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// One lookup at a time, a single flush at the end.
    Serial,
    /// One lookup at a time, a flush after every `batch_size` targets.
    Batched { batch_size: usize },
    /// Up to `max_in_flight` lookups per batch run together; results are applied in input order.
    Concurrent { batch_size: usize, max_in_flight: usize },
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Batched { batch_size: DEFAULT_BATCH_SIZE }
    }
}

impl Policy {
    fn batch_size(&self, total: usize) -> usize {
        match self {
            Policy::Serial => total.max(1),
            Policy::Batched { batch_size } | Policy::Concurrent { batch_size, .. } => (*batch_size).max(1),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Policy::Serial => "serial".to_string(),
            Policy::Batched { batch_size } => format!("batched (batch size {})", batch_size),
            Policy::Concurrent { batch_size, max_in_flight } => {
                format!("concurrent (batch size {}, up to {} in flight)", batch_size, max_in_flight)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub targets: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub lookup_failures: usize,
    pub identifier_misses: usize,
    /// Resolved targets that wrote at least one row.
    pub targets_applied: usize,
    pub rows_updated: usize,
    pub rows_matched_by_name: usize,
    pub rows_unmatched: usize,
    pub flushes_ok: usize,
    pub flushes_failed: usize,
    pub last_flush_ok: Option<bool>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn from_tally(targets: usize, tally: &EventTally, elapsed: Duration) -> Self {
        Self {
            targets,
            resolved: targets.saturating_sub(tally.unresolved),
            unresolved: tally.unresolved,
            lookup_failures: tally.lookup_failures,
            identifier_misses: tally.identifier_misses,
            targets_applied: tally.targets_applied,
            rows_updated: tally.rows_updated,
            rows_matched_by_name: tally.rows_matched_by_name,
            rows_unmatched: tally.rows_unmatched_by_name,
            flushes_ok: tally.flushes_ok,
            flushes_failed: tally.flushes_failed,
            last_flush_ok: tally.last_flush_ok,
            elapsed,
        }
    }

    /// False when the final state never reached the backing file.
    pub fn persisted(&self) -> bool {
        self.last_flush_ok == Some(true)
    }
}

/// Forwards events while keeping its own counts for the run summary.
struct Tallying<'a> {
    inner: &'a mut dyn EventSink,
    tally: EventTally,
}

impl<'a> Tallying<'a> {
    fn new(inner: &'a mut dyn EventSink) -> Self {
        Self { inner, tally: EventTally::default() }
    }
}

impl EventSink for Tallying<'_> {
    fn record(&mut self, event: ReconcileEvent) {
        self.tally.observe(&event);
        self.inner.record(event);
    }
}

fn advance(phase: &mut RunPhase, next: RunPhase) {
    debug_assert!(phase.can_advance_to(next), "run phase {:?} cannot move to {:?}", phase, next);
    debug!("Run phase {:?} -> {:?}", phase, next);
    *phase = next;
}

/// Loads both sheets. Either failing ends the run before any lookup is made.
pub fn load_inputs(
    primary: &SheetRef,
    targets: &SheetRef,
    mirror_names: bool,
) -> Result<(PrimaryTable, Vec<TargetEntry>)> {
    let table = store::load_primary(primary, mirror_names)
        .with_context(|| format!("Failed to load primary sheet {}", primary.describe()))?;
    let entries =
        store::load_targets(targets).with_context(|| format!("Failed to load target sheet {}", targets.describe()))?;
    Ok((table, entries))
}

/// Writes the table's output columns; a failure is reported and the run carries on.
pub fn checkpoint(sheet: &SheetRef, table: &PrimaryTable, sink: &mut dyn EventSink) -> bool {
    match store::flush(sheet, table) {
        Ok(report) => {
            sink.record(ReconcileEvent::FlushSucceeded {
                rows: report.rows_written,
                inserted_name_column: report.inserted_companion,
            });
            true
        }
        Err(e) => {
            sink.record(ReconcileEvent::FlushFailed { reason: e.to_string() });
            false
        }
    }
}

/// Resolves every target under `policy`, applying results in input order and
/// checkpointing after each batch. The table always ends flushed at least once.
pub async fn run_lookup(
    policy: Policy,
    sheet: &SheetRef,
    table: &mut PrimaryTable,
    targets: &[TargetEntry],
    lookup: &dyn CategoryLookup,
    sink: &mut dyn EventSink,
    progress: &ProgressBar,
) -> RunSummary {
    let started = Instant::now();
    let mut sink = Tallying::new(sink);
    let mut phase = RunPhase::Loading;
    let batch_size = policy.batch_size(targets.len());
    info!("Reconciling {} targets, policy: {}", targets.len(), policy.describe());

    for (batch_no, chunk) in targets.chunks(batch_size).enumerate() {
        advance(&mut phase, RunPhase::Reconciling);
        let base = batch_no * batch_size;

        match policy {
            Policy::Concurrent { max_in_flight, .. } => {
                let outcomes: Vec<_> = stream::iter(chunk.iter().map(|t| lookup.resolve(&t.ym_name)))
                    .buffered(max_in_flight.max(1))
                    .collect()
                    .await;
                for (offset, (target, outcome)) in chunk.iter().zip(outcomes).enumerate() {
                    apply_outcome(table, base + offset, target, outcome, &mut sink);
                    progress.inc(1);
                }
            }
            Policy::Serial | Policy::Batched { .. } => {
                for (offset, target) in chunk.iter().enumerate() {
                    progress.set_message(target.ym_name.clone());
                    let outcome = lookup.resolve(&target.ym_name).await;
                    apply_outcome(table, base + offset, target, outcome, &mut sink);
                    progress.inc(1);
                }
            }
        }

        if policy != Policy::Serial {
            advance(&mut phase, RunPhase::Flushing);
            if checkpoint(sheet, table, &mut sink) {
                progress.set_message(format!("Checkpoint {} saved ({} targets)", batch_no + 1, base + chunk.len()));
            }
        }
    }

    if phase != RunPhase::Flushing {
        advance(&mut phase, RunPhase::Flushing);
        checkpoint(sheet, table, &mut sink);
    }
    advance(&mut phase, RunPhase::Done);
    RunSummary::from_tally(targets.len(), &sink.tally, started.elapsed())
}

/// Name-mapping run: stamps `YM_id` from the cabinet mapping, then flushes once.
pub fn run_cabinet(
    sheet: &SheetRef,
    table: &mut PrimaryTable,
    mapping: &CabinetMapping,
    sink: &mut dyn EventSink,
) -> RunSummary {
    let started = Instant::now();
    let mut sink = Tallying::new(sink);
    let mut phase = RunPhase::Loading;

    advance(&mut phase, RunPhase::Reconciling);
    let updated = reconcile_by_name(table, mapping, &mut sink);
    info!("Name mapping assigned YM_id to {} of {} rows.", updated, table.len());

    advance(&mut phase, RunPhase::Flushing);
    checkpoint(sheet, table, &mut sink);
    advance(&mut phase, RunPhase::Done);
    RunSummary::from_tally(0, &sink.tally, started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{LookupError, Resolution};
    use crate::model::CategoryId;
    use crate::reconcile::tests::{id, target, StubLookup};
    use crate::store::tests::PRIMARY_CSV;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;

    /// Answers after a per-name delay and records the order in which calls finish.
    struct DelayedLookup {
        answers: HashMap<String, (CategoryId, u64)>,
        finished: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CategoryLookup for DelayedLookup {
        async fn resolve(&self, name: &str) -> Result<Resolution, LookupError> {
            let (answer, delay_ms) = self.answers.get(name).cloned().ok_or(LookupError::Transport("unknown".into()))?;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.finished.lock().unwrap().push(name.to_string());
            Ok(Resolution::Found(answer))
        }
    }

    fn csv_sheet(dir: &tempfile::TempDir) -> SheetRef {
        let path = dir.path().join("wb.csv");
        fs::write(&path, PRIMARY_CSV).unwrap();
        SheetRef::new(path, "WB")
    }

    #[tokio::test]
    async fn test_concurrent_results_apply_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let mut table = store::load_primary(&sheet, false).unwrap();
        let lookup = DelayedLookup {
            answers: HashMap::from([
                ("Shoes".to_string(), (id("101"), 60)),
                ("Footwear".to_string(), (id("101"), 0)),
            ]),
            finished: Mutex::new(Vec::new()),
        };
        let targets = vec![target("55", "Shoes"), target("77", "Footwear")];
        let policy = Policy::Concurrent { batch_size: 10, max_in_flight: 2 };

        let summary =
            run_lookup(policy, &sheet, &mut table, &targets, &lookup, &mut Vec::new(), &ProgressBar::hidden()).await;
        assert_eq!(*lookup.finished.lock().unwrap(), vec!["Footwear".to_string(), "Shoes".to_string()]);
        assert_eq!(table.rows[0].ym_id, Some(id("77")));
        assert_eq!(summary.rows_updated, 2);
        assert_eq!(summary.targets_applied, 2);
        assert_eq!(summary.flushes_ok, 1);
    }

    #[tokio::test]
    async fn test_batched_run_checkpoints_each_batch() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let mut table = store::load_primary(&sheet, true).unwrap();
        let lookup = StubLookup::new(&[("Shoes", "101"), ("Boots", "202")]);
        let targets = vec![target("55", "Shoes"), target("56", "Ghost"), target("57", "Boots")];
        let mut events = Vec::new();

        let summary = run_lookup(
            Policy::Batched { batch_size: 2 },
            &sheet,
            &mut table,
            &targets,
            &lookup,
            &mut events,
            &ProgressBar::hidden(),
        )
        .await;
        assert_eq!(summary.flushes_ok, 2);
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.targets_applied, 2);
        assert_eq!(summary.rows_matched_by_name, 0);
        assert!(summary.persisted());
        assert!(matches!(events[1], ReconcileEvent::TargetUnresolved { index: 1, .. }));
        assert!(matches!(events[2], ReconcileEvent::FlushSucceeded { inserted_name_column: true, .. }));

        let reloaded = store::load_primary(&sheet, true).unwrap();
        assert_eq!(reloaded.rows[0].ym_id, Some(id("55")));
        assert_eq!(reloaded.rows[1].ym_name.as_deref(), Some("Boots"));
        assert_eq!(reloaded.rows[2].ym_id, None);
    }

    #[tokio::test]
    async fn test_rerun_from_persisted_state_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let lookup = StubLookup::new(&[("Shoes", "101")]);
        let targets = vec![target("55", "Shoes")];

        let mut first = store::load_primary(&sheet, true).unwrap();
        run_lookup(Policy::Serial, &sheet, &mut first, &targets, &lookup, &mut Vec::new(), &ProgressBar::hidden())
            .await;
        let after_first = fs::read_to_string(&sheet.path).unwrap();

        let mut second = store::load_primary(&sheet, true).unwrap();
        assert_eq!(second.rows, first.rows);
        run_lookup(Policy::Serial, &sheet, &mut second, &targets, &lookup, &mut Vec::new(), &ProgressBar::hidden())
            .await;
        assert_eq!(fs::read_to_string(&sheet.path).unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_failed_flushes_keep_memory_and_report_last_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let mut table = store::load_primary(&sheet, false).unwrap();
        fs::remove_file(&sheet.path).unwrap();
        let lookup = StubLookup::new(&[("Shoes", "101")]);

        let summary = run_lookup(
            Policy::Batched { batch_size: 1 },
            &sheet,
            &mut table,
            &[target("55", "Shoes"), target("56", "Ghost")],
            &lookup,
            &mut Vec::new(),
            &ProgressBar::hidden(),
        )
        .await;
        assert_eq!(summary.flushes_failed, 2);
        assert_eq!(summary.last_flush_ok, Some(false));
        assert!(!summary.persisted());
        assert_eq!(table.rows[0].ym_id, Some(id("55")));
    }

    #[tokio::test]
    async fn test_empty_target_list_still_flushes_once() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let mut table = store::load_primary(&sheet, false).unwrap();
        let summary = run_lookup(
            Policy::default(),
            &sheet,
            &mut table,
            &[],
            &StubLookup::new(&[]),
            &mut Vec::new(),
            &ProgressBar::hidden(),
        )
        .await;
        assert_eq!(summary.flushes_ok, 1);
        assert_eq!(summary.targets, 0);
    }

    #[test]
    fn test_cabinet_run_writes_ids_only() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let mut table = store::load_primary(&sheet, false).unwrap();
        let mapping = CabinetMapping::from_pairs(vec![("Кроссовки".to_string(), id("500"))]);

        let summary = run_cabinet(&sheet, &mut table, &mapping, &mut Vec::new());
        assert_eq!(summary.rows_updated, 1);
        assert_eq!(summary.rows_matched_by_name, 1);
        assert_eq!(summary.targets_applied, 0);
        assert_eq!(summary.rows_unmatched, 2);
        assert!(summary.persisted());

        let written = fs::read_to_string(&sheet.path).unwrap();
        assert!(written.starts_with("parent_id,parent_name,subject_id,subject_name,YM_id,comment\n"));
        assert!(written.contains("1,Обувь,101,Кроссовки,500,keep me"));
    }

    #[test]
    fn test_run_phases_end_with_a_checkpoint() {
        use RunPhase::*;
        assert!(Loading.can_advance_to(Reconciling));
        assert!(Loading.can_advance_to(Flushing));
        assert!(Flushing.can_advance_to(Reconciling));
        assert!(Flushing.can_advance_to(Done));
        assert!(!Reconciling.can_advance_to(Done));
        assert!(!Loading.can_advance_to(Done));
        assert!(!Done.can_advance_to(Reconciling));
        assert!(!Reconciling.can_advance_to(Reconciling));
    }

    #[tokio::test]
    async fn test_serial_run_flushes_once_at_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let mut table = store::load_primary(&sheet, false).unwrap();
        let lookup = StubLookup::new(&[("Shoes", "101"), ("Boots", "202")]);
        let targets = vec![target("55", "Shoes"), target("56", "Boots"), target("57", "Ghost")];
        let mut events = Vec::new();

        let summary =
            run_lookup(Policy::Serial, &sheet, &mut table, &targets, &lookup, &mut events, &ProgressBar::hidden()).await;
        assert_eq!(summary.flushes_ok, 1);
        assert!(matches!(events.last(), Some(ReconcileEvent::FlushSucceeded { rows: 3, .. })));
        assert_eq!(summary.targets_applied, 2);
        assert_eq!(summary.resolved, 2);
    }

    #[test]
    fn test_load_inputs_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = csv_sheet(&dir);
        let missing = SheetRef::new(dir.path().join("ym.csv"), "YM");
        let err = load_inputs(&sheet, &missing, false).unwrap_err();
        assert!(err.to_string().contains("Failed to load target sheet"));
    }
}
