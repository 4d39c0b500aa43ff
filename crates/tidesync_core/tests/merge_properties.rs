//! Property tests for the merge engine.

use proptest::prelude::*;
use tidesync_codec::{Record, Value};
use tidesync_core::{merge, merge_entries, EntityId, EntityKey, EntryId, LogEntry, PendingAction};

const FIELDS: [&str; 4] = ["a", "b", "c", "d"];

fn arb_fields() -> impl Strategy<Value = Record> {
    prop::collection::btree_map(
        prop::sample::select(FIELDS.to_vec()).prop_map(str::to_string),
        any::<i64>().prop_map(Value::Integer),
        0..4,
    )
}

fn arb_action() -> impl Strategy<Value = PendingAction> {
    let id = EntityId::from("e1");
    prop_oneof![
        3 => arb_fields().prop_map({
            let id = id.clone();
            move |data| PendingAction::Update { id: id.clone(), data }
        }),
        1 => arb_fields().prop_map({
            let id = id.clone();
            move |data| PendingAction::Create { id: id.clone(), data }
        }),
        1 => Just(PendingAction::Delete { id }),
    ]
}

fn entries(actions: Vec<PendingAction>) -> Vec<LogEntry> {
    actions
        .into_iter()
        .enumerate()
        .map(|(i, action)| LogEntry {
            entry_id: EntryId::new(i as u64 + 1),
            timestamp: 1_000 + i as u64,
            key: EntityKey::new("t", "e1"),
            action,
        })
        .collect()
}

proptest! {
    #[test]
    fn merging_a_merge_changes_nothing(actions in prop::collection::vec(arb_action(), 1..12)) {
        let merged = merge(&entries(actions)).unwrap();
        prop_assert_eq!(merge(&entries(vec![merged.clone()])), Some(merged));
    }

    #[test]
    fn any_delete_wins(
        actions in prop::collection::vec(arb_action(), 0..8),
        at in 0usize..8,
    ) {
        let mut actions = actions;
        let at = at.min(actions.len());
        actions.insert(at, PendingAction::Delete { id: EntityId::from("e1") });
        prop_assert!(merge(&entries(actions)).unwrap().is_delete());
    }

    #[test]
    fn each_field_takes_its_latest_value(actions in prop::collection::vec(arb_action(), 1..12)) {
        prop_assume!(actions.iter().all(|a| !a.is_delete()));
        let merged = merge(&entries(actions.clone())).unwrap();
        let data = merged.data().unwrap();

        for field in FIELDS {
            let latest = actions
                .iter()
                .rev()
                .find_map(|a| a.data().and_then(|d| d.get(field)));
            prop_assert_eq!(data.get(field), latest);
        }
    }

    #[test]
    fn create_survives_later_updates(actions in prop::collection::vec(arb_action(), 1..12)) {
        prop_assume!(actions.iter().all(|a| !a.is_delete()));
        let any_create = actions.iter().any(|a| matches!(a, PendingAction::Create { .. }));
        let merged = merge(&entries(actions)).unwrap();
        prop_assert_eq!(matches!(merged, PendingAction::Create { .. }), any_create);
    }

    #[test]
    fn shuffled_input_merges_the_same(
        actions in prop::collection::vec(arb_action(), 1..10),
        seed in any::<u64>(),
    ) {
        let ordered = entries(actions);
        let mut shuffled = ordered.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed % len as u64) as usize);
        shuffled.reverse();
        prop_assert_eq!(merge(&shuffled), merge(&ordered));
    }

    #[test]
    fn watermark_covers_every_entry(actions in prop::collection::vec(arb_action(), 1..12)) {
        let log = entries(actions);
        let merged = merge_entries(&log).unwrap();
        prop_assert_eq!(merged.watermark, EntryId::new(log.len() as u64));
        prop_assert_eq!(merged.entry_count, log.len());
    }
}
