//! Foreign-key disable windows.
//!
//! Change tracking reports one net row per key. A row inserted at creation
//! version `c` and updated at version `v` is applied at `c` with its values
//! as of `v`, which may reference a row that is only inserted later in the
//! same change set. For every such reference the owning foreign key is
//! disabled from `c` until the referenced row's creation version.

use sync_core::{Change, Operation};
use tracing::info;

/// Annotate `changes` with the foreign keys each one needs disabled.
///
/// `changes` must be in canonical order (see [`sync_core::change::sort_canonical`]).
/// Every window recorded on a change `C` ends at a version `u` with
/// `C.creation_version < u <= C.version`.
pub fn plan_foreign_key_windows(changes: &mut [Change]) {
    for i in 0..changes.len() {
        let (head, later) = changes.split_at_mut(i + 1);
        let change = &mut head[i];

        if !change.updated_since_creation() || change.table.foreign_keys.is_empty() {
            continue;
        }

        for candidate in later.iter() {
            if candidate.creation_version > change.version {
                break;
            }
            if candidate.operation != Operation::Insert
                || candidate.creation_version <= change.creation_version
            {
                continue;
            }

            for fk in change.table.foreign_keys_to(candidate.table_name()) {
                let value = match change.value(&fk.column) {
                    Some(value) if !value.is_null() => value,
                    _ => continue,
                };
                if candidate.value(&fk.referenced_column) != Some(value) {
                    continue;
                }

                info!(
                    "Foreign key constraint {} needs to be disabled for change #{} from version {} until version {}",
                    fk.name,
                    i + 1,
                    change.creation_version,
                    candidate.creation_version
                );
                let until = change
                    .disabled_constraints
                    .entry(fk.clone())
                    .or_insert(candidate.creation_version);
                *until = (*until).max(candidate.creation_version);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use sync_core::{ChangeSet, ForeignKeyConstraint, TableDescriptor, Version};

    fn users() -> Arc<TableDescriptor> {
        Arc::new(TableDescriptor::new(
            "public.users",
            vec!["user_id".to_string()],
            vec!["name".to_string()],
            true,
        ))
    }

    fn orders() -> Arc<TableDescriptor> {
        let mut table = TableDescriptor::new(
            "public.orders",
            vec!["order_id".to_string()],
            vec!["user_id".to_string()],
            true,
        );
        table.foreign_keys = vec![fk()];
        Arc::new(table)
    }

    fn fk() -> ForeignKeyConstraint {
        ForeignKeyConstraint::new(
            "fk_orders_users",
            "public.orders",
            "user_id",
            "public.users",
            "user_id",
        )
    }

    fn user(op: Operation, version: Version, creation: Version, id: i64) -> Change {
        Change::new(
            users(),
            op,
            version,
            creation,
            [("user_id", json!(id))].into_iter().collect(),
            [("name", json!(format!("user {id}")))].into_iter().collect(),
        )
    }

    fn order(version: Version, creation: Version, id: i64, user_id: Value) -> Change {
        Change::new(
            orders(),
            Operation::Insert,
            version,
            creation,
            [("order_id", json!(id))].into_iter().collect(),
            [("user_id", user_id)].into_iter().collect(),
        )
    }

    fn plan(changes: Vec<Change>) -> ChangeSet {
        let mut set = ChangeSet::new(100, changes);
        plan_foreign_key_windows(&mut set.changes);
        set
    }

    #[test]
    fn test_reference_to_later_insert_opens_window() {
        // user 1 @1, order @2 re-pointed @6 to user 2, user 2 inserted @4
        let set = plan(vec![
            user(Operation::Insert, 1, 1, 1),
            order(6, 2, 10, json!(2)),
            user(Operation::Insert, 4, 4, 2),
        ]);

        let order = set
            .changes
            .iter()
            .find(|c| c.table_name() == "public.orders")
            .unwrap();
        assert_eq!(order.disabled_constraints.len(), 1);
        assert_eq!(order.disabled_constraints[&fk()], 4);
        assert!(set
            .changes
            .iter()
            .filter(|c| c.table_name() == "public.users")
            .all(|c| c.disabled_constraints.is_empty()));
    }

    #[test]
    fn test_no_window_for_rows_never_updated() {
        let set = plan(vec![
            user(Operation::Insert, 1, 1, 1),
            order(2, 2, 10, json!(1)),
        ]);
        assert!(set.changes.iter().all(|c| c.disabled_constraints.is_empty()));
    }

    #[test]
    fn test_insert_outside_window_is_ignored() {
        // user 2 is inserted after the order's last update
        let set = plan(vec![
            order(3, 2, 10, json!(2)),
            user(Operation::Insert, 5, 5, 2),
        ]);
        assert!(set.changes[0].disabled_constraints.is_empty());
    }

    #[test]
    fn test_null_and_non_insert_references_are_ignored() {
        let set = plan(vec![
            order(6, 2, 10, Value::Null),
            order(6, 2, 11, json!(3)),
            user(Operation::Update, 4, 4, 3),
        ]);
        assert!(set.changes.iter().all(|c| c.disabled_constraints.is_empty()));
    }

    #[test]
    fn test_window_extends_to_latest_matching_insert() {
        // user 2 is deleted and re-inserted within the window
        let set = plan(vec![
            order(9, 2, 10, json!(2)),
            user(Operation::Insert, 4, 4, 2),
            user(Operation::Insert, 7, 7, 2),
        ]);
        assert_eq!(set.changes[0].disabled_constraints[&fk()], 7);
    }

    #[test]
    fn test_windows_stay_within_creation_and_version() {
        let set = plan(vec![
            user(Operation::Insert, 1, 1, 1),
            order(8, 2, 10, json!(3)),
            order(5, 3, 11, json!(2)),
            user(Operation::Insert, 4, 4, 2),
            user(Operation::Insert, 6, 6, 3),
            order(9, 7, 12, json!(4)),
            user(Operation::Insert, 8, 8, 4),
        ]);

        let mut windows = 0;
        for change in &set.changes {
            for until in change.disabled_constraints.values() {
                assert!(*until > change.creation_version);
                assert!(*until <= change.version);
                windows += 1;
            }
        }
        assert_eq!(windows, 3);
    }
}
