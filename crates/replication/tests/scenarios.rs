//! End-to-end replication scenarios against the in-memory backend.

use replication::backend::Backend;
use replication::planner::plan_foreign_key_windows;
use replication::testing::{MemoryBackend, MemoryDatabase};
use replication::{Executor, SyncOptions, Synchronizer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    Change, ChangeSet, Config, DatabaseInfo, ForeignKeyConstraint, Operation, ReplicationSet,
    SyncError, TableDescriptor,
};
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "memory://source";
const USERS: &str = "public.users";
const ORDERS: &str = "public.orders";

fn users_table() -> TableDescriptor {
    TableDescriptor::new(
        USERS,
        vec!["user_id".into()],
        vec!["name".into(), "age".into()],
        true,
    )
}

fn orders_table() -> TableDescriptor {
    TableDescriptor::new(
        ORDERS,
        vec!["order_id".into()],
        vec!["user_id".into()],
        false,
    )
}

fn orders_fk() -> ForeignKeyConstraint {
    ForeignKeyConstraint::new("fk_orders_users", ORDERS, "user_id", USERS, "user_id")
}

fn create_schema(db: &MemoryDatabase, tracked: bool) {
    db.create_table(users_table());
    db.create_table(orders_table());
    db.add_foreign_key(orders_fk());
    if tracked {
        db.enable_change_tracking();
        db.track_table(USERS).unwrap();
        db.track_table(ORDERS).unwrap();
    }
}

fn user(id: i64, name: &str, age: i64) -> Value {
    json!({"user_id": id, "name": name, "age": age})
}

fn order(id: i64, user_id: i64) -> Value {
    json!({"order_id": id, "user_id": user_id})
}

struct Fixture {
    backend: MemoryBackend,
    source: MemoryDatabase,
}

impl Fixture {
    fn new() -> Self {
        let backend = MemoryBackend::new();
        let source = backend.database(SOURCE);
        create_schema(&source, true);
        Self { backend, source }
    }

    fn destination(&self, name: &str) -> MemoryDatabase {
        let db = self.backend.database(&format!("memory://{name}"));
        create_schema(&db, false);
        db
    }

    fn replication_set(&self, name: &str, destinations: &[&str]) -> ReplicationSet {
        ReplicationSet {
            name: name.to_string(),
            source: DatabaseInfo::new("source", SOURCE),
            destinations: destinations
                .iter()
                .map(|d| DatabaseInfo::new(*d, format!("memory://{d}")))
                .collect(),
            tables: vec!["users".to_string(), "public.orders".to_string()],
        }
    }

    fn synchronizer(&self, sets: Vec<ReplicationSet>) -> Synchronizer<MemoryBackend> {
        self.synchronizer_with(sets, SyncOptions::default())
    }

    fn synchronizer_with(
        &self,
        sets: Vec<ReplicationSet>,
        options: SyncOptions,
    ) -> Synchronizer<MemoryBackend> {
        let config = Config {
            replication_sets: sets,
        };
        config.validate().unwrap();
        Synchronizer::new(self.backend.clone(), config, options)
    }
}

#[tokio::test]
async fn test_insert_then_update_replicates_final_row() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "Michael Jordan", 54)).unwrap();
    fx.source
        .update(USERS, user(1, "Michael Jeffrey Jordan", 54))
        .unwrap();

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);
    assert!(sync.sync().await);

    assert_eq!(replica.rows(USERS), vec![user(1, "Michael Jeffrey Jordan", 54)]);
    assert_eq!(replica.watermark(), fx.source.current_version());
    assert_eq!(replica.watermark(), Some(2));
}

#[tokio::test]
async fn test_foreign_key_disabled_until_referenced_insert() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "A", 30)).unwrap(); // 1
    fx.source.insert(ORDERS, order(10, 1)).unwrap(); // 2
    fx.source.insert(USERS, user(2, "B", 40)).unwrap(); // 3
    fx.source.update(ORDERS, order(10, 2)).unwrap(); // 4

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);
    assert!(sync.sync().await);

    assert_eq!(
        replica.statements(),
        vec![
            "BEGIN",
            "INSERT public.users [1]",
            "DISABLE public.orders:fk_orders_users",
            "INSERT public.orders [10]",
            "INSERT public.users [2]",
            "ENABLE public.orders:fk_orders_users",
            "WATERMARK 4",
            "COMMIT",
        ]
    );
    assert!(replica.is_foreign_key_enabled(&orders_fk()));
    assert_eq!(replica.rows(ORDERS), vec![order(10, 2)]);
    assert_eq!(replica.rows(USERS), fx.source.rows(USERS));
}

#[tokio::test]
async fn test_orders_repointed_to_later_users() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "Michael Jordan", 54)).unwrap();
    fx.source.insert(ORDERS, order(1, 1)).unwrap();
    fx.source.insert(ORDERS, order(2, 1)).unwrap();
    fx.source.insert(USERS, user(2, "Larry Bird", 60)).unwrap();
    fx.source.update(ORDERS, order(1, 2)).unwrap();
    fx.source.insert(USERS, user(3, "Karl Malone", 53)).unwrap();
    fx.source.update(ORDERS, order(2, 3)).unwrap();

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);
    assert!(sync.sync().await);

    assert_eq!(replica.rows(ORDERS), vec![order(1, 2), order(2, 3)]);
    assert_eq!(replica.rows(USERS).len(), 3);
    assert!(replica.is_foreign_key_enabled(&orders_fk()));
    let disables = replica
        .statements()
        .iter()
        .filter(|s| s.starts_with("DISABLE"))
        .count();
    assert_eq!(disables, 1);
}

#[tokio::test]
async fn test_unplanned_change_set_rolls_back() {
    let backend = MemoryBackend::new();
    let replica = backend.database("memory://replica");
    create_schema(&replica, false);

    let users = Arc::new(users_table());
    let mut orders = orders_table();
    orders.foreign_keys = vec![orders_fk()];
    let orders = Arc::new(orders);

    let changes = vec![
        Change::new(
            orders,
            Operation::Insert,
            4,
            2,
            [("order_id", json!(10))].into_iter().collect(),
            [("user_id", json!(2))].into_iter().collect(),
        ),
        Change::new(
            users,
            Operation::Insert,
            3,
            3,
            [("user_id", json!(2))].into_iter().collect(),
            [("name", json!("B")), ("age", json!(40))].into_iter().collect(),
        ),
    ];
    let info = DatabaseInfo::new("replica", "memory://replica");
    let executor = Executor::new(false);

    let unplanned = ChangeSet::new(4, changes.clone());
    let mut session = backend.connect_destination(&info).await.unwrap();
    let err = executor
        .apply(&mut session, "replica", &unplanned)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ApplyFailed { .. }));
    assert!(err.to_string().contains("fk_orders_users"));
    assert!(replica.rows(USERS).is_empty());
    assert!(replica.rows(ORDERS).is_empty());
    assert_eq!(replica.watermark(), None);
    assert_eq!(replica.statements().last().map(String::as_str), Some("ROLLBACK"));

    let mut planned = ChangeSet::new(4, changes);
    plan_foreign_key_windows(&mut planned.changes);
    let mut session = backend.connect_destination(&info).await.unwrap();
    executor
        .apply(&mut session, "replica", &planned)
        .await
        .unwrap();
    assert_eq!(replica.rows(ORDERS), vec![order(10, 2)]);
    assert_eq!(replica.watermark(), Some(4));
}

#[tokio::test]
async fn test_retention_exceeded_leaves_destination_unchanged() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "Michael Jordan", 54)).unwrap();

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);
    assert!(sync.sync().await);
    assert_eq!(replica.watermark(), Some(1));

    fx.source
        .update(USERS, user(1, "Michael Jeffrey Jordan", 54))
        .unwrap();
    // re-enabling tracking discards the update from the history
    fx.source.track_table(USERS).unwrap();
    replica.clear_statements();

    let report = sync.run_once().await;
    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    match &report.failures[0].error {
        SyncError::RetentionExceeded {
            table,
            min_valid_version,
            watermark,
            destinations,
        } => {
            assert_eq!(table, USERS);
            assert_eq!(*min_valid_version, 2);
            assert_eq!(*watermark, 1);
            assert_eq!(destinations, &vec!["replica".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!report.failures[0].error.is_retryable());

    assert_eq!(replica.rows(USERS), vec![user(1, "Michael Jordan", 54)]);
    assert_eq!(replica.watermark(), Some(1));
    assert!(replica.statements().is_empty());
}

#[tokio::test]
async fn test_destinations_at_different_watermarks() {
    let fx = Fixture::new();
    let fresh = fx.destination("fresh");
    let behind = fx.destination("behind");

    fx.source.insert(USERS, user(1, "A", 30)).unwrap();
    fx.source.insert(USERS, user(2, "B", 40)).unwrap();
    let mut first = fx.synchronizer(vec![fx.replication_set("Test", &["behind"])]);
    assert!(first.sync().await);
    assert_eq!(behind.watermark(), Some(2));

    fx.source.insert(USERS, user(3, "C", 50)).unwrap();
    fx.source.update(USERS, user(1, "A2", 31)).unwrap();
    behind.clear_statements();

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["fresh", "behind"])]);
    assert!(sync.sync().await);

    for replica in [&fresh, &behind] {
        assert_eq!(replica.watermark(), Some(4));
        assert_eq!(replica.rows(USERS), fx.source.rows(USERS));
    }
    assert_eq!(
        behind.statements(),
        vec![
            "BEGIN",
            "INSERT public.users [3]",
            "UPDATE public.users [1]",
            "WATERMARK 4",
            "COMMIT",
        ]
    );
    let fresh_inserts = fresh
        .statements()
        .iter()
        .filter(|s| s.starts_with("INSERT"))
        .count();
    assert_eq!(fresh_inserts, 3);
}

#[tokio::test]
async fn test_dry_run_never_mutates_destination() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();
    fx.source.insert(ORDERS, order(10, 1)).unwrap();
    fx.source.update(USERS, user(1, "A2", 31)).unwrap();
    fx.source.delete(ORDERS, &[json!(10)]).unwrap();

    let options = SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    };
    let mut sync =
        fx.synchronizer_with(vec![fx.replication_set("Test", &["replica"])], options);
    assert!(sync.sync().await);

    assert!(replica.rows(USERS).is_empty());
    assert!(replica.rows(ORDERS).is_empty());
    assert_eq!(replica.watermark(), None);
    assert_eq!(replica.statements(), vec!["BEGIN", "ROLLBACK"]);
}

#[tokio::test]
async fn test_replay_without_source_changes_is_idempotent() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();
    fx.source.update(USERS, user(1, "A2", 31)).unwrap();

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);
    assert!(sync.sync().await);
    let rows = replica.rows(USERS);
    let watermark = replica.watermark();

    assert!(sync.sync().await);
    assert_eq!(replica.rows(USERS), rows);
    assert_eq!(replica.watermark(), watermark);
}

#[tokio::test]
async fn test_watermark_is_monotonic() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);

    let mut last = 0;
    for id in 1..=3 {
        fx.source.insert(USERS, user(id, "user", 20 + id)).unwrap();
        fx.source.update(USERS, user(id, "renamed", 20 + id)).unwrap();
        assert!(sync.sync().await);

        let watermark = replica.watermark().unwrap();
        assert_eq!(Some(watermark), fx.source.current_version());
        assert!(watermark > last);
        last = watermark;
    }
    assert_eq!(replica.rows(USERS), fx.source.rows(USERS));
}

#[tokio::test]
async fn test_failing_destinations_do_not_affect_others() {
    let fx = Fixture::new();
    let healthy = fx.destination("healthy");
    let broken = fx.destination("broken");
    broken.fail_writes_to(USERS);
    let down = fx.destination("down");
    down.set_unavailable(true);
    let unreadable = fx.destination("unreadable");
    unreadable.set_watermark_unreadable(true);

    fx.source.insert(USERS, user(1, "A", 30)).unwrap();

    let mut sync = fx.synchronizer(vec![fx.replication_set(
        "Test",
        &["down", "broken", "unreadable", "healthy"],
    )]);
    let report = sync.run_once().await;

    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 3);
    let failure = |name: &str| {
        report
            .failures
            .iter()
            .find(|f| f.destination.as_deref() == Some(name))
            .map(|f| &f.error)
    };
    assert!(matches!(
        failure("down"),
        Some(SyncError::DestinationUnavailable { .. })
    ));
    assert!(matches!(
        failure("unreadable"),
        Some(SyncError::DestinationUnavailable { .. })
    ));
    assert!(matches!(failure("broken"), Some(SyncError::ApplyFailed { .. })));

    assert_eq!(healthy.rows(USERS), vec![user(1, "A", 30)]);
    assert_eq!(healthy.watermark(), Some(1));
    assert!(broken.rows(USERS).is_empty());
    assert_eq!(broken.watermark(), None);
}

#[tokio::test]
async fn test_source_failure_only_fails_its_replication_set() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    let other = fx.destination("other");
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();

    let mut broken = fx.replication_set("Broken", &["other"]);
    broken.source = DatabaseInfo::new("missing", "memory://missing");

    let mut sync = fx.synchronizer(vec![broken, fx.replication_set("Test", &["replica"])]);
    let report = sync.run_once().await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].replication_set, "Broken");
    assert!(matches!(
        report.failures[0].error,
        SyncError::SourceUnavailable { .. }
    ));
    assert_eq!(replica.rows(USERS), vec![user(1, "A", 30)]);
    assert!(other.statements().is_empty());
}

#[tokio::test]
async fn test_init_retries_sets_whose_source_was_down() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();
    fx.source.set_unavailable(true);

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);
    let report = sync.init().await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].replication_set, "Test");
    assert!(matches!(
        report.failures[0].error,
        SyncError::SourceUnavailable { .. }
    ));

    fx.source.set_unavailable(false);
    assert!(sync.init().await.is_success());
    assert!(sync.sync().await);
    assert_eq!(replica.rows(USERS), vec![user(1, "A", 30)]);
}

#[tokio::test]
async fn test_no_matching_tables_succeeds() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();

    let mut set = fx.replication_set("Test", &["replica"]);
    set.tables = vec!["Test".to_string()];
    let mut sync = fx.synchronizer(vec![set]);

    assert!(sync.sync().await);
    assert!(replica.statements().is_empty());
    assert_eq!(replica.watermark(), None);
}

#[tokio::test]
async fn test_restored_destination_starts_from_its_tracked_version() {
    let fx = Fixture::new();
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();
    fx.source.insert(USERS, user(2, "B", 40)).unwrap();

    // a restored copy of the source, change tracking included
    let restored = fx.backend.database("memory://restored");
    create_schema(&restored, true);
    restored.insert(USERS, user(1, "A", 30)).unwrap();
    restored.insert(USERS, user(2, "B", 40)).unwrap();

    fx.source.insert(USERS, user(3, "C", 50)).unwrap();

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["restored"])]);
    assert!(sync.sync().await);

    assert_eq!(restored.rows(USERS), fx.source.rows(USERS));
    assert_eq!(restored.watermark(), Some(3));
    let inserts: Vec<_> = restored
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("INSERT"))
        .collect();
    assert_eq!(inserts, vec!["INSERT public.users [3]"]);
}

async fn late_write_is_deferred(snapshot_isolation: bool) {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.set_snapshot_isolation(snapshot_isolation);
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();
    fx.source.on_next_fetch(|data| {
        data.insert_json(USERS, user(2, "late", 99)).unwrap();
    });

    let mut sync = fx.synchronizer(vec![fx.replication_set("Test", &["replica"])]);
    assert!(sync.sync().await);
    assert_eq!(replica.rows(USERS), vec![user(1, "A", 30)]);
    assert_eq!(replica.watermark(), Some(1));

    assert!(sync.sync().await);
    assert_eq!(replica.rows(USERS), fx.source.rows(USERS));
    assert_eq!(replica.watermark(), Some(2));
}

#[tokio::test]
async fn test_late_write_without_snapshot_is_discarded() {
    late_write_is_deferred(false).await;
}

#[tokio::test]
async fn test_late_write_invisible_in_snapshot() {
    late_write_is_deferred(true).await;
}

fn loop_options() -> SyncOptions {
    SyncOptions {
        interval: Duration::from_millis(10),
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn test_sync_loop_follows_source_until_cancelled() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "Michael Jordan", 54)).unwrap();
    fx.source.insert(USERS, user(2, "Larry Bird", 60)).unwrap();
    fx.source.insert(USERS, user(3, "Karl Malone", 53)).unwrap();

    let mut sync =
        fx.synchronizer_with(vec![fx.replication_set("Test", &["replica"])], loop_options());
    let mut events = sync.subscribe();
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { sync.sync_loop(token).await }
    });

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.replication_set, "Test");
    assert_eq!(event.version, 3);
    assert_eq!(replica.rows(USERS), fx.source.rows(USERS));

    fx.source
        .update(USERS, user(1, "Michael Jeffrey Jordan", 54))
        .unwrap();
    fx.source.update(USERS, user(2, "Larry Joe Bird", 60)).unwrap();
    fx.source.delete(USERS, &[json!(3)]).unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if event.version == 6 {
            break;
        }
    }
    assert_eq!(replica.rows(USERS), fx.source.rows(USERS));
    assert_eq!(replica.rows(USERS).len(), 2);
    assert_eq!(replica.watermark(), Some(6));

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_sync_loop_retries_failed_pass_and_still_notifies() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    replica.fail_writes_to(USERS);
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();

    let mut sync =
        fx.synchronizer_with(vec![fx.replication_set("Test", &["replica"])], loop_options());
    let mut events = sync.subscribe();
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { sync.sync_loop(token).await }
    });

    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.version, 1);
    }
    assert!(replica.rows(USERS).is_empty());
    assert_eq!(replica.watermark(), None);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_loop_does_no_work() {
    let fx = Fixture::new();
    let replica = fx.destination("replica");
    fx.source.insert(USERS, user(1, "A", 30)).unwrap();

    let mut sync =
        fx.synchronizer_with(vec![fx.replication_set("Test", &["replica"])], loop_options());
    let mut events = sync.subscribe();
    let token = CancellationToken::new();
    token.cancel();

    sync.sync_loop(token).await;

    assert!(events.try_recv().is_err());
    assert!(replica.statements().is_empty());
}
