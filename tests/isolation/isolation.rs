//! Savepoint and flush isolation between sequential tests

use crate::common::*;
use isodb::{DatabaseConfig, DatabaseSelection, IsolationMode};

fn insert(ctx: &TestContext<'_>, alias: &str, name: &str) -> anyhow::Result<i64> {
    let conn = ctx.connection(alias)?;
    conn.execute("INSERT INTO shop_item (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_id()?)
}

#[test]
fn test_sequential_db_tests_do_not_see_each_other() {
    let env = TestEnv::new();
    let items = vec![
        TestItem::new("first").fixture("db"),
        TestItem::new("second").fixture("db"),
    ];
    let session = env.session(SessionConfig::new(), &items);

    for item in &items {
        let report = session.run_item(item, |ctx| {
            // only the seed row from the data migration
            assert_eq!(count(ctx.connections(), "shop_item")?, 1);
            insert(ctx, "default", item.node_id())?;
            assert_eq!(count(ctx.connections(), "shop_item")?, 2);
            Ok(())
        });
        assert!(report.passed(), "{:?}", report);
        assert_eq!(report.plan.as_ref().map(|p| p.mode), Some(IsolationMode::Savepoint));
    }
    assert!(session.finish().warnings.is_empty());
}

#[test]
fn test_transactional_db_flushes_tables() {
    let env = TestEnv::new();
    let items = vec![
        TestItem::new("writer").fixture("transactional_db"),
        TestItem::new("reader").fixture("db"),
    ];
    let session = env.session(SessionConfig::new(), &items);

    let report = session.run_item(&items[0], |ctx| {
        insert(ctx, "default", "kept until teardown")?;
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert_eq!(report.plan.as_ref().map(|p| p.mode), Some(IsolationMode::Flush));

    let report = session.run_item(&items[1], |ctx| {
        // the flush also removed the seed row
        assert_eq!(count(ctx.connections(), "shop_item")?, 0);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_reset_sequences_restarts_ids() {
    let env = TestEnv::new();
    let plain = TestItem::new("plain").fixture("transactional_db");
    let reset = TestItem::new("reset").fixture("django_db_reset_sequences");
    let session = env.session(SessionConfig::new(), &[plain.clone(), reset.clone()]);

    let report = session.run_item(&plain, |ctx| {
        assert!(insert(ctx, "default", "a")? > 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);

    let report = session.run_item(&reset, |ctx| {
        assert_eq!(insert(ctx, "default", "b")?, 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);

    let report = session.run_item(&plain, |ctx| {
        assert!(insert(ctx, "default", "c")? > 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_serialized_rollback_restores_initial_data() {
    let env = TestEnv::new();
    let wipe = TestItem::new("wipe").fixture("transactional_db");
    let restore = TestItem::new("restore").mark(DjangoDbMark::new().serialized_rollback(true));
    let session = env.session(SessionConfig::new(), &[wipe.clone(), restore.clone()]);
    assert!(session
        .database_state("default")
        .is_some());

    let report = session.run_item(&wipe, |ctx| {
        ctx.connection("default")?
            .execute("DELETE FROM shop_item", params![])?;
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);

    for _ in 0..2 {
        let report = session.run_item(&restore, |ctx| {
            let rows = ctx
                .connection("default")?
                .query("SELECT name FROM shop_item", params![])?;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get_str("name"), Some("seed"));
            Ok(())
        });
        assert!(report.passed(), "{:?}", report);
        assert!(report.plan.as_ref().map_or(false, |p| p.request.transactional));
    }
    session.finish();
}

#[test]
fn test_available_apps_limits_flush() {
    let env = TestEnv::new();
    let item = TestItem::new("scoped").mark(
        DjangoDbMark::new()
            .transaction(true)
            .available_apps(["auth"]),
    );
    let check = TestItem::new("check").fixture("db");
    let session = env.session(SessionConfig::new(), &[item.clone(), check.clone()]);

    let report = session.run_item(&item, |ctx| {
        insert(ctx, "default", "survivor")?;
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);

    let report = session.run_item(&check, |ctx| {
        assert_eq!(count(ctx.connections(), "shop_item")?, 2);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_backend_without_transactions_degrades_to_flush() {
    let env = TestEnv::without_transactions();
    let items = vec![
        TestItem::new("first").fixture("db"),
        TestItem::new("second").fixture("db"),
    ];
    let session = env.session(SessionConfig::new(), &items);

    let report = session.run_item(&items[0], |ctx| {
        insert(ctx, "default", "x")?;
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    let plan = report.plan.expect("plan");
    assert_eq!(plan.mode, IsolationMode::Flush);
    assert!(plan.degraded);

    let report = session.run_item(&items[1], |ctx| {
        assert_eq!(count(ctx.connections(), "shop_item")?, 0);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_backend_without_transactions_keeps_sequence_reset() {
    let env = TestEnv::without_transactions();
    let plain = TestItem::new("plain").mark(DjangoDbMark::new().transaction(true));
    let reset = TestItem::new("reset")
        .mark(DjangoDbMark::new().transaction(true).reset_sequences(true));
    let session = env.session(SessionConfig::new(), &[plain.clone(), reset.clone()]);

    let report = session.run_item(&plain, |ctx| {
        assert!(insert(ctx, "default", "a")? > 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);

    for _ in 0..2 {
        let report = session.run_item(&reset, |ctx| {
            assert_eq!(insert(ctx, "default", "b")?, 1);
            Ok(())
        });
        assert!(report.passed(), "{:?}", report);
        let plan = report.plan.expect("plan");
        assert_eq!(plan.mode, IsolationMode::Flush);
        assert!(plan.request.reset_sequences);
    }
    session.finish();
}

#[test]
fn test_backend_without_savepoints_skips_db_tests() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let backend = std::sync::Arc::new(SqliteBackend::new(dir.path()).without_savepoints());
    let db = TestItem::new("db").fixture("db");
    let trans = TestItem::new("trans").fixture("transactional_db");
    let mut session = Session::builder(SessionConfig::new(), backend)
        .with_apps(apps())
        .with_blocker(AccessBlocker::new_shared())
        .with_worker_env(WorkerEnv::new())
        .build()
        .unwrap();
    session.prepare(&[db.clone(), trans.clone()]).unwrap();

    let skipped = session.run_item(&db, |_| panic!("must not run"));
    assert_eq!(skipped.outcome, Outcome::Skipped);
    assert!(session.run_item(&trans, |_| Ok(())).passed());
    session.finish();
}

#[test]
fn test_mirror_shares_target_and_rolls_back() {
    let env = TestEnv::new();
    let config = SessionConfig::new()
        .with_database(DatabaseConfig::new("replica", "app_replica").with_mirror("default"));
    let item = TestItem::new("replica")
        .mark(DjangoDbMark::new().databases(DatabaseSelection::aliases(["replica"])));
    let check = TestItem::new("check").fixture("db");
    let session = env.session(config, &[item.clone(), check.clone()]);

    let report = session.run_item(&item, |ctx| {
        insert(ctx, "replica", "via mirror")?;
        let err = ctx
            .connection("default")?
            .query("SELECT 1", params![])
            .unwrap_err();
        assert!(matches!(err, IsoError::AliasNotAllowed { ref alias } if alias == "default"));
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);

    let report = session.run_item(&check, |ctx| {
        assert_eq!(count(ctx.connections(), "shop_item")?, 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_unknown_alias_is_setup_error() {
    let env = TestEnv::new();
    let item =
        TestItem::new("bad").mark(DjangoDbMark::new().databases(DatabaseSelection::aliases(["nope"])));
    let session = env.session(SessionConfig::new(), &[item.clone()]);
    let report = session.run_item(&item, |_| panic!("must not run"));
    assert_eq!(report.outcome, Outcome::Error);
    assert!(report.message.unwrap_or_default().contains("'nope'"));
    session.finish();
}

#[test]
fn test_body_panic_still_rolls_back() {
    let env = TestEnv::new();
    let item = TestItem::new("panics").fixture("db");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        insert(ctx, "default", "lost").unwrap();
        ctx.connection("default").unwrap().enter_atomic().unwrap();
        panic!("boom");
    });
    assert_eq!(report.outcome, Outcome::Failed);

    let report = session.run_item(&item, |ctx| {
        assert_eq!(count(ctx.connections(), "shop_item")?, 1);
        assert_eq!(ctx.connection("default")?.atomic_depth(), 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert!(session.blocker().is_blocked());
    session.finish();
}

#[test]
fn test_transactional_panic_inside_atomic_is_unwound() {
    let env = TestEnv::new();
    let item = TestItem::new("panics").fixture("transactional_db");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let conn = ctx.connection("default").unwrap();
        conn.enter_atomic().unwrap();
        insert(ctx, "default", "lost").unwrap();
        panic!("boom");
    });
    assert_eq!(report.outcome, Outcome::Failed);

    // the write lock of the abandoned transaction is gone
    let mut raw = env.backend.connect("test_app").unwrap();
    raw.execute("INSERT INTO shop_item (name) VALUES ('outside')", params![])
        .unwrap();

    let report = session.run_item(&item, |ctx| {
        assert_eq!(ctx.connection("default")?.atomic_depth(), 0);
        assert_eq!(count(ctx.connections(), "shop_item")?, 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}
