use crate::cabinet::CabinetMapping;
use crate::events::{EventSink, NameSource, ReconcileEvent};
use crate::lookup::{CategoryLookup, LookupError, Resolution};
use crate::model::{PrimaryTable, TargetEntry};

/// Stamps one target onto every row whose `subject_id` equals the resolved id.
/// Returns the number of rows written. Parent ids are not considered here.
pub fn apply_resolution(
    table: &mut PrimaryTable,
    index: usize,
    target: &TargetEntry,
    resolution: &Resolution,
    sink: &mut dyn EventSink,
) -> usize {
    let Some(local_id) = resolution.found() else {
        sink.record(ReconcileEvent::TargetUnresolved { index, name: target.ym_name.clone() });
        return 0;
    };

    let mirror = table.mirror_names;
    let mut updated = 0;
    for row in table.rows.iter_mut().filter(|r| r.subject_id.as_ref() == Some(local_id)) {
        row.ym_id = Some(target.ym_id.clone());
        if mirror {
            row.ym_name = Some(target.ym_name.clone());
        }
        updated += 1;
    }

    if updated == 0 {
        sink.record(ReconcileEvent::IdentifierUnmatched { index, local_id: local_id.clone() });
    } else {
        sink.record(ReconcileEvent::RowsUpdated {
            index,
            local_id: local_id.clone(),
            ym_id: target.ym_id.clone(),
            rows: updated,
        });
    }
    updated
}

/// Applies a lookup outcome, degrading a failed call to "not found".
pub fn apply_outcome(
    table: &mut PrimaryTable,
    index: usize,
    target: &TargetEntry,
    outcome: Result<Resolution, LookupError>,
    sink: &mut dyn EventSink,
) -> usize {
    let resolution = match outcome {
        Ok(resolution) => resolution,
        Err(e) => {
            sink.record(ReconcileEvent::lookup_failed(index, &target.ym_name, &e));
            Resolution::NotFound
        }
    };
    apply_resolution(table, index, target, &resolution, sink)
}

/// Serial reconciliation in input order. A later target that resolves to the same id
/// overwrites the earlier assignment.
pub async fn reconcile(
    table: &mut PrimaryTable,
    targets: &[TargetEntry],
    lookup: &dyn CategoryLookup,
    sink: &mut dyn EventSink,
) -> usize {
    let mut updated = 0;
    for (index, target) in targets.iter().enumerate() {
        let outcome = lookup.resolve(&target.ym_name).await;
        updated += apply_outcome(table, index, target, outcome, sink);
    }
    updated
}

/// Name-mapping mode: `subject_name` first, then `parent_name`. Rows without a hit are left as they are.
pub fn reconcile_by_name(table: &mut PrimaryTable, mapping: &CabinetMapping, sink: &mut dyn EventSink) -> usize {
    let mut updated = 0;
    for (row_index, row) in table.rows.iter_mut().enumerate() {
        let hit = mapping
            .get(&row.subject_name)
            .map(|id| (id, NameSource::Subject))
            .or_else(|| mapping.get(&row.parent_name).map(|id| (id, NameSource::Parent)));

        match hit {
            Some((ym_id, via)) => {
                row.ym_id = Some(ym_id.clone());
                updated += 1;
                sink.record(ReconcileEvent::RowMatchedByName { row: row_index, ym_id: ym_id.clone(), via });
            }
            None => sink.record(ReconcileEvent::RowUnmatchedByName {
                row: row_index,
                subject_name: row.subject_name.clone(),
                parent_name: row.parent_name.clone(),
            }),
        }
    }
    updated
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{CategoryId, PrimaryRow};
    use async_trait::async_trait;
    use std::collections::HashMap;

    pub(crate) fn id(raw: &str) -> CategoryId {
        CategoryId::parse(raw).unwrap()
    }

    pub(crate) fn row(subject_id: &str, subject_name: &str) -> PrimaryRow {
        PrimaryRow {
            parent_id: Some(id("1")),
            parent_name: "Одежда".into(),
            subject_id: CategoryId::parse(subject_id),
            subject_name: subject_name.into(),
            ..PrimaryRow::default()
        }
    }

    pub(crate) fn target(ym_id: &str, name: &str) -> TargetEntry {
        TargetEntry { ym_id: id(ym_id), ym_name: name.into() }
    }

    /// Fixed name -> id answers; names listed in `failing` return a transport error.
    pub(crate) struct StubLookup {
        pub answers: HashMap<String, CategoryId>,
        pub failing: Vec<String>,
    }

    impl StubLookup {
        pub(crate) fn new(pairs: &[(&str, &str)]) -> Self {
            Self { answers: pairs.iter().map(|(n, i)| (n.to_string(), id(i))).collect(), failing: Vec::new() }
        }
    }

    #[async_trait]
    impl CategoryLookup for StubLookup {
        async fn resolve(&self, name: &str) -> Result<Resolution, LookupError> {
            if self.failing.iter().any(|f| f == name) {
                return Err(LookupError::Transport("connection reset".into()));
            }
            Ok(self.answers.get(name).cloned().map_or(Resolution::NotFound, Resolution::Found))
        }
    }

    #[tokio::test]
    async fn test_shoes_and_ghost_scenario() {
        let mut table = PrimaryTable { rows: vec![row("101", "Кроссовки"), row("202", "Сумки")], mirror_names: false };
        let before = table.clone();
        let lookup = StubLookup::new(&[("Shoes", "101")]);
        let mut events = Vec::new();

        let updated = reconcile(&mut table, &[target("55", "Shoes")], &lookup, &mut events).await;
        assert_eq!(updated, 1);
        assert_eq!(table.rows[0].ym_id, Some(id("55")));
        assert_eq!(table.rows[1], before.rows[1]);

        let snapshot = table.clone();
        let mut ghost_events = Vec::new();
        let updated = reconcile(&mut table, &[target("56", "Ghost")], &lookup, &mut ghost_events).await;
        assert_eq!(updated, 0);
        assert_eq!(table.rows, snapshot.rows);
        assert_eq!(ghost_events, vec![ReconcileEvent::TargetUnresolved { index: 0, name: "Ghost".into() }]);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let targets = vec![target("55", "Shoes"), target("60", "Bags")];
        let lookup = StubLookup::new(&[("Shoes", "101"), ("Bags", "202")]);
        let mut table = PrimaryTable { rows: vec![row("101", "a"), row("202", "b"), row("303", "c")], mirror_names: true };

        reconcile(&mut table, &targets, &lookup, &mut Vec::new()).await;
        let once = table.clone();
        reconcile(&mut table, &targets, &lookup, &mut Vec::new()).await;
        assert_eq!(table.rows, once.rows);
        assert_eq!(table.rows[1].ym_name.as_deref(), Some("Bags"));
        assert_eq!(table.rows[2].ym_id, None);
    }

    #[tokio::test]
    async fn test_later_target_overwrites_same_rows() {
        let targets = vec![target("55", "Shoes"), target("77", "Footwear")];
        let lookup = StubLookup::new(&[("Shoes", "101"), ("Footwear", "101")]);
        let mut table = PrimaryTable { rows: vec![row("101", "a"), row("101", "a2")], mirror_names: false };

        let updated = reconcile(&mut table, &targets, &lookup, &mut Vec::new()).await;
        assert_eq!(updated, 4);
        assert!(table.rows.iter().all(|r| r.ym_id == Some(id("77"))));
    }

    #[tokio::test]
    async fn test_unmatched_identifier_leaves_rows_alone() {
        let lookup = StubLookup::new(&[("Hats", "999")]);
        let mut table = PrimaryTable { rows: vec![row("101", "a"), row("", "parent only")], mirror_names: true };
        let before = table.clone();
        let mut events = Vec::new();

        reconcile(&mut table, &[target("58", "Hats")], &lookup, &mut events).await;
        assert_eq!(table.rows, before.rows);
        assert_eq!(events, vec![ReconcileEvent::IdentifierUnmatched { index: 0, local_id: id("999") }]);
    }

    #[tokio::test]
    async fn test_parent_ids_are_not_matched_by_lookup() {
        // Row 1 has parent_id 1 but no subject_id; a lookup answering "1" must not touch it.
        let lookup = StubLookup::new(&[("Clothes", "1")]);
        let mut table = PrimaryTable { rows: vec![row("", "")], mirror_names: false };
        assert_eq!(reconcile(&mut table, &[target("9", "Clothes")], &lookup, &mut Vec::new()).await, 0);
        assert_eq!(table.rows[0].ym_id, None);
    }

    #[tokio::test]
    async fn test_lookup_failure_degrades_to_not_found() {
        let mut lookup = StubLookup::new(&[("Shoes", "101")]);
        lookup.failing.push("Shoes".into());
        let mut table = PrimaryTable { rows: vec![row("101", "a")], mirror_names: false };
        let mut events = Vec::new();

        reconcile(&mut table, &[target("55", "Shoes")], &lookup, &mut events).await;
        assert_eq!(table.rows[0].ym_id, None);
        assert!(matches!(events[0], ReconcileEvent::LookupFailed { index: 0, .. }));
        assert_eq!(events[1], ReconcileEvent::TargetUnresolved { index: 0, name: "Shoes".into() });
    }

    #[test]
    fn test_name_mapping_prefers_subject_then_parent() {
        let mapping = CabinetMapping::from_pairs(vec![
            ("Кроссовки".to_string(), id("500")),
            ("Одежда".to_string(), id("600")),
        ]);
        let mut no_parent = row("303", "Неизвестно");
        no_parent.parent_name = "Разное".into();
        let mut table = PrimaryTable {
            rows: vec![row("101", "Кроссовки"), row("202", "Футболки"), no_parent],
            mirror_names: false,
        };
        let mut events = Vec::new();

        let updated = reconcile_by_name(&mut table, &mapping, &mut events);
        assert_eq!(updated, 2);
        assert_eq!(table.rows[0].ym_id, Some(id("500")));
        assert_eq!(table.rows[1].ym_id, Some(id("600")));
        assert_eq!(table.rows[2].ym_id, None);
        assert!(matches!(events[0], ReconcileEvent::RowMatchedByName { via: NameSource::Subject, .. }));
        assert!(matches!(events[1], ReconcileEvent::RowMatchedByName { via: NameSource::Parent, .. }));
        assert!(matches!(events[2], ReconcileEvent::RowUnmatchedByName { row: 2, .. }));
    }
}
