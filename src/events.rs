use crate::lookup::LookupError;
use crate::model::CategoryId;
use log::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    Subject,
    Parent,
}

impl NameSource {
    fn column(self) -> &'static str {
        match self {
            NameSource::Subject => "subject_name",
            NameSource::Parent => "parent_name",
        }
    }
}

/// Everything the reconciler reports while it works. Components push these into an
/// [`EventSink`] instead of logging directly.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent {
    TargetUnresolved { index: usize, name: String },
    LookupFailed { index: usize, name: String, reason: String },
    IdentifierUnmatched { index: usize, local_id: CategoryId },
    RowsUpdated { index: usize, local_id: CategoryId, ym_id: CategoryId, rows: usize },
    RowMatchedByName { row: usize, ym_id: CategoryId, via: NameSource },
    RowUnmatchedByName { row: usize, subject_name: String, parent_name: String },
    FlushSucceeded { rows: usize, inserted_name_column: bool },
    FlushFailed { reason: String },
}

impl ReconcileEvent {
    pub fn lookup_failed(index: usize, name: &str, err: &LookupError) -> Self {
        ReconcileEvent::LookupFailed { index, name: name.to_string(), reason: err.to_string() }
    }
}

pub trait EventSink {
    fn record(&mut self, event: ReconcileEvent);
}

impl EventSink for Vec<ReconcileEvent> {
    fn record(&mut self, event: ReconcileEvent) {
        self.push(event);
    }
}

/// Counters accumulated from the event stream, reported in the final summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventTally {
    pub unresolved: usize,
    pub lookup_failures: usize,
    pub identifier_misses: usize,
    pub targets_applied: usize,
    pub rows_updated: usize,
    pub rows_matched_by_name: usize,
    pub rows_unmatched_by_name: usize,
    pub flushes_ok: usize,
    pub flushes_failed: usize,
    pub last_flush_ok: Option<bool>,
}

impl EventTally {
    pub fn observe(&mut self, event: &ReconcileEvent) {
        match event {
            ReconcileEvent::TargetUnresolved { .. } => self.unresolved += 1,
            ReconcileEvent::LookupFailed { .. } => self.lookup_failures += 1,
            ReconcileEvent::IdentifierUnmatched { .. } => self.identifier_misses += 1,
            ReconcileEvent::RowsUpdated { rows, .. } => {
                self.targets_applied += 1;
                self.rows_updated += rows;
            }
            ReconcileEvent::RowMatchedByName { .. } => {
                self.rows_matched_by_name += 1;
                self.rows_updated += 1;
            }
            ReconcileEvent::RowUnmatchedByName { .. } => self.rows_unmatched_by_name += 1,
            ReconcileEvent::FlushSucceeded { .. } => {
                self.flushes_ok += 1;
                self.last_flush_ok = Some(true);
            }
            ReconcileEvent::FlushFailed { .. } => {
                self.flushes_failed += 1;
                self.last_flush_ok = Some(false);
            }
        }
    }
}

/// Sink that writes each event through the `log` facade and keeps a tally.
#[derive(Debug, Default)]
pub struct LogSink {
    pub tally: EventTally,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for LogSink {
    fn record(&mut self, event: ReconcileEvent) {
        self.tally.observe(&event);
        match &event {
            ReconcileEvent::TargetUnresolved { index, name } => {
                warn!("[{}] No subject id found for last_name='{}' (empty lookup result).", index, name)
            }
            ReconcileEvent::LookupFailed { index, name, reason } => {
                error!("[{}] Lookup failed for '{}': {}", index, name, reason)
            }
            ReconcileEvent::IdentifierUnmatched { index, local_id } => {
                warn!("[{}] subject_id={} from lookup is not present in the primary sheet.", index, local_id)
            }
            ReconcileEvent::RowsUpdated { index, local_id, ym_id, rows } => {
                info!("[{}] subject_id={} -> YM_id={} ({} rows).", index, local_id, ym_id, rows)
            }
            ReconcileEvent::RowMatchedByName { row, ym_id, via } => {
                debug!("Row {} assigned YM_id '{}' (by {}).", row, ym_id, via.column())
            }
            ReconcileEvent::RowUnmatchedByName { row, subject_name, parent_name } => {
                warn!("Row {}: no mapping for subject_name='{}' or parent_name='{}'.", row, subject_name, parent_name)
            }
            ReconcileEvent::FlushSucceeded { rows, inserted_name_column } => {
                if *inserted_name_column {
                    info!("Inserted missing YM_name column next to YM_id.");
                }
                info!("Checkpoint written: {} rows of YM_id persisted.", rows)
            }
            ReconcileEvent::FlushFailed { reason } => {
                error!("Checkpoint failed, in-memory progress kept for the next flush: {}", reason)
            }
        }
    }
}
