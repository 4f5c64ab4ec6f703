//! Test clients, request factories, admin fixtures, settings and urls

use crate::common::*;
use isodb::http::ROOT_URLCONF;
use isodb::Mark;
use std::sync::Arc;
use serde_json::json;

#[test]
fn test_client_sees_test_data() {
    let env = TestEnv::new();
    let item = TestItem::new("client").fixtures(["db", "client"]);
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let client = ctx.client()?;
        assert_eq!(client.post("/items", "widget", "text/plain").status(), 201);
        let response = client.get("/items");
        assert_eq!(response.status(), 200);
        assert_eq!(response.text_body(), "2");
        assert_eq!(client.get("/missing").status(), 404);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_admin_client_and_user_rolled_back() {
    let env = TestEnv::new();
    let admin = TestItem::new("admin").fixture("admin_client");
    let check = TestItem::new("check").fixture("db");
    let session = env.session(SessionConfig::new(), &[admin.clone(), check.clone()]);

    let report = session.run_item(&admin, |ctx| {
        assert_eq!(ctx.django_username_field()?, "username");
        let user = ctx.admin_user()?;
        assert_eq!(user.username, "admin");
        assert!(user.is_superuser);
        assert_eq!(ctx.admin_client()?.get("/whoami").text_body(), "admin");
        assert_eq!(count(ctx.connections(), "auth_user")?, 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert_eq!(
        report.plan.as_ref().map(|p| p.request.transactional),
        Some(false)
    );

    let report = session.run_item(&check, |ctx| {
        assert_eq!(count(ctx.connections(), "auth_user")?, 0);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_async_client_runs_on_tokio() {
    let env = TestEnv::new();
    let item = TestItem::new("async").fixtures(["db", "async_client", "async_rf"]);
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let client = ctx.async_client()?;
        let request = ctx.async_rf()?.get("/items");
        assert!(request.is_async());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (created, listed) = runtime.block_on(async {
            let created = client.post("/items", "async widget", "text/plain").await;
            let listed = client.request(request).await;
            (created, listed)
        });
        assert_eq!(created.status(), 201);
        assert_eq!(listed.text_body(), "2");
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_rf_builds_requests() {
    let env = TestEnv::new();
    let item = TestItem::new("rf").fixture("rf");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let request = ctx.rf()?.post("/items?x=1", "body", "text/plain");
        assert_eq!(request.method(), "POST");
        assert_eq!(request.path(), "/items");
        assert_eq!(request.query(), Some("x=1"));
        assert_eq!(request.host(), "testserver");
        assert_eq!(request.header("content-type"), Some("text/plain"));
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_urls_mark_overrides_root_urlconf() {
    let env = TestEnv::new();
    let item = TestItem::new("urls")
        .fixture("client")
        .mark(Mark::new("urls").arg("shop.urls_alt"));
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        assert_eq!(ctx.client()?.get("/urlconf").text_body(), "shop.urls_alt");
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert_eq!(session.settings().get_str(ROOT_URLCONF), None);
    session.finish();
}

#[test]
fn test_invalid_urls_mark_is_setup_error() {
    let env = TestEnv::new();
    let item = TestItem::new("urls").mark(Mark::new("urls"));
    let session = env.session(SessionConfig::new(), &[item.clone()]);
    let report = session.run_item(&item, |_| panic!("must not run"));
    assert_eq!(report.outcome, Outcome::Error);
    session.finish();
}

#[test]
fn test_settings_fixture_restores_values() {
    let env = TestEnv::new();
    let item = TestItem::new("settings").fixture("settings");
    let session = env.session(SessionConfig::new(), &[item.clone()]);
    session.settings().set_base("LANGUAGE_CODE", json!("en-us"));

    let report = session.run_item(&item, |ctx| {
        let settings = ctx.settings()?;
        settings.set("LANGUAGE_CODE", "de")?;
        settings.set("FEATURE_FLAG", true)?;
        settings.delete("LANGUAGE_CODE")?;
        assert_eq!(settings.get("LANGUAGE_CODE"), None);
        assert_eq!(settings.get("FEATURE_FLAG"), Some(json!(true)));
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert_eq!(session.settings().get_str("LANGUAGE_CODE").as_deref(), Some("en-us"));
    assert!(!session.settings().contains("FEATURE_FLAG"));
    assert_eq!(session.settings().get_bool("DEBUG"), Some(false));
    assert!(session
        .settings()
        .get_str_list("ALLOWED_HOSTS")
        .contains(&"testserver".to_string()));

    let settings = Arc::clone(session.settings());
    session.finish();
    assert!(!settings.contains("DEBUG"));
    assert!(settings.get_str_list("ALLOWED_HOSTS").is_empty());
}
