//! Query-count assertions and on-commit capture through fixtures

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_num_queries_exact_and_max() {
    let env = TestEnv::new();
    let item = TestItem::new("queries").fixtures([
        "db",
        "django_assert_num_queries",
        "django_assert_max_num_queries",
    ]);
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let conn = ctx.connection("default")?;
        let rows = ctx
            .django_assert_num_queries(1)?
            .run(|| conn.query("SELECT name FROM shop_item", params![]))??;
        assert_eq!(rows.len(), 1);

        // savepoints and transaction control are not counted
        ctx.django_assert_num_queries(1)?.run(|| {
            conn.atomic(|c| c.execute("INSERT INTO shop_item (name) VALUES ('x')", params![]))
        })??;

        let err = ctx
            .django_assert_max_num_queries(1)?
            .info("listing")
            .run(|| {
                conn.query("SELECT 1", params![]).map(|_| ())?;
                conn.query("SELECT 2", params![]).map(|_| ())
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Expected to perform 1 queries or less but 2 were done\n\
             listing (add -v option to show queries)"
        );
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_num_queries_lists_queries_when_verbose() {
    let env = TestEnv::new();
    let item = TestItem::new("verbose").fixtures(["db", "django_assert_num_queries"]);
    let session = env.session(SessionConfig::new().with_verbosity(1), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let conn = ctx.connection("default")?;
        let err = ctx
            .django_assert_num_queries(0)?
            .run(|| conn.query("SELECT COUNT(*) FROM shop_item", params![]))
            .unwrap_err();
        assert!(err
            .to_string()
            .ends_with("Queries:\n========\n\nSELECT COUNT(*) FROM shop_item"));
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_capture_on_commit_callbacks() {
    let env = TestEnv::new();
    let item = TestItem::new("on_commit").fixtures(["db", "django_capture_on_commit_callbacks"]);
    let session = env.session(SessionConfig::new(), &[item.clone()]);
    let hits = Arc::new(AtomicUsize::new(0));

    let report = session.run_item(&item, |ctx| {
        let conn = ctx.connection("default")?;

        // the test transaction never commits, so callbacks only run captured
        let h = Arc::clone(&hits);
        let ((), captured) = ctx.django_capture_on_commit_callbacks()?.run(|| {
            conn.on_commit(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .expect("on_commit")
        })?;
        assert_eq!(captured.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(captured.run_all(), 1);

        let h = Arc::clone(&hits);
        let inner = conn.clone();
        let ((), captured) = ctx
            .django_capture_on_commit_callbacks()?
            .execute(true)
            .run(|| {
                conn.on_commit(move || {
                    let h2 = Arc::clone(&h);
                    h.fetch_add(1, Ordering::SeqCst);
                    inner
                        .on_commit(move || {
                            h2.fetch_add(1, Ordering::SeqCst);
                        })
                        .expect("nested on_commit");
                })
                .expect("on_commit")
            })?;
        assert_eq!(captured.executed(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    session.finish();
}
