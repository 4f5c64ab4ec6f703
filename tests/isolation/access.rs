//! Default-deny access, thread confinement and native test cases

use crate::common::*;
use isodb::{NativeCaseKind, ACCESS_BLOCKED_MESSAGE};
use std::thread;

#[test]
fn test_item_without_db_is_denied() {
    let env = TestEnv::new();
    let plain = TestItem::new("plain");
    let session = env.session(SessionConfig::new(), &[plain.clone()]);

    let report = session.run_item(&plain, |ctx| {
        let err = ctx
            .connection("default")?
            .query("SELECT 1", params![])
            .unwrap_err();
        assert!(err.is_access_error());
        assert_eq!(err.to_string(), ACCESS_BLOCKED_MESSAGE);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert!(report.plan.is_none());

    // the error surfaces as a test failure when propagated
    let report = session.run_item(&plain, |ctx| {
        ctx.connection("default")?.query("SELECT 1", params![])?;
        Ok(())
    });
    assert_eq!(report.outcome, Outcome::Failed);
    assert!(report.message.unwrap_or_default().contains("django_db"));
    session.finish();
}

#[test]
fn test_client_without_db_gets_server_error() {
    let env = TestEnv::new();
    let item = TestItem::new("client_only").fixture("client");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let response = ctx.client()?.get("/items");
        assert_eq!(response.status(), 500);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_other_thread_is_refused() {
    let env = TestEnv::new();
    let item = TestItem::new("threads").fixture("db");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let conn = ctx.connection("default")?;
        let result = thread::Builder::new()
            .name("worker".to_string())
            .spawn(move || conn.query("SELECT 1", params![]).map(|_| ()))?
            .join()
            .expect("worker thread");
        match result {
            Err(IsoError::NotMainThread { thread }) => assert_eq!(thread, "worker"),
            other => panic!("expected NotMainThread, got {:?}", other),
        }
        // the owning thread keeps access
        ctx.connection("default")?.query("SELECT 1", params![])?;
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_blocker_fixture_unblocks_for_setup_work() {
    let env = TestEnv::new();
    let item = TestItem::new("blocker").fixture("django_db_blocker");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let blocker = ctx.django_db_blocker()?;
        assert!(blocker.is_blocked());
        {
            let _guard = blocker.unblock();
            assert!(!blocker.is_blocked());
            assert_eq!(blocker.depth(), 1);
        }
        assert!(blocker.is_blocked());
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_fixture_not_requested() {
    let env = TestEnv::new();
    let item = TestItem::new("needs_nothing").fixture("db");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let err = ctx.client().unwrap_err();
        assert!(err
            .to_string()
            .ends_with("fixture 'client' was not requested by needs_nothing"));
        assert!(ctx.django_db_blocker().is_ok());
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_native_case_manages_itself() {
    let env = TestEnv::new();
    let native = TestItem::new("native").native(NativeCaseKind::TestCase);
    let session = env.session(SessionConfig::new(), &[native.clone()]);

    let report = session.run_item(&native, |ctx| {
        let conn = ctx.connection("default")?;
        conn.atomic(|c| -> IsoResult<()> {
            c.execute("INSERT INTO shop_item (name) VALUES ('own')", params![])?;
            Err(IsoError::invalid_operation("roll back"))
        })
        .unwrap_err();
        assert_eq!(count(ctx.connections(), "shop_item")?, 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert!(report.plan.is_none());
    assert!(session.blocker().is_blocked());
    session.finish();
}
