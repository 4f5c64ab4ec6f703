//! Live server readiness, requests over TCP and bind failures

use crate::common::*;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

fn live_item(name: &str) -> TestItem {
    TestItem::new(name).fixture("live_server")
}

#[test]
fn test_live_server_serves_test_database() {
    let env = TestEnv::new();
    let item = live_item("live");
    let session = env.session(SessionConfig::new().with_liveserver("127.0.0.1"), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let server = ctx.live_server()?;
        assert!(server.is_running());
        assert_ne!(server.port(), 0);
        let url = server.url();
        assert_eq!(url, format!("http://127.0.0.1:{}", server.port()));

        let resp = ureq::post(&format!("{}/items", url)).send("widget")?;
        assert_eq!(resp.status().as_u16(), 201);

        let mut resp = ureq::get(&format!("{}/items", url)).call()?;
        assert_eq!(resp.body_mut().read_to_string()?, "2");

        // the server thread writes to the same test database
        assert_eq!(count(ctx.connections(), "shop_item")?, 2);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert_eq!(
        report.plan.as_ref().map(|p| p.request.transactional),
        Some(true)
    );
    session.finish();
}

#[test]
fn test_live_server_is_session_scoped_and_host_override_is_per_test() {
    let env = TestEnv::new();
    let live = live_item("live");
    let plain = TestItem::new("plain");
    let session = env.session(
        SessionConfig::new().with_liveserver("127.0.0.1"),
        &[live.clone(), plain.clone()],
    );

    let mut urls = Vec::new();
    for _ in 0..2 {
        let report = session.run_item(&live, |ctx| {
            urls.push(ctx.live_server()?.url());
            assert!(ctx.connections().blocker().check_access().is_ok());
            Ok(())
        });
        assert!(report.passed(), "{:?}", report);
    }
    assert_eq!(urls[0], urls[1]);

    // outside a live_server test the server host is no longer allowed
    let report = session.run_item(&plain, |_| {
        let err = ureq::get(&format!("{}/items", urls[0])).call().unwrap_err();
        assert!(matches!(err, ureq::Error::StatusCode(400)), "{:?}", err);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    assert!(!session
        .settings()
        .get_str_list("ALLOWED_HOSTS")
        .contains(&"127.0.0.1".to_string()));
    session.finish();
}

#[test]
fn test_oversized_body_is_refused_and_server_survives() {
    let env = TestEnv::new();
    let item = live_item("live");
    let session = env.session(SessionConfig::new().with_liveserver("127.0.0.1"), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        let server = ctx.live_server()?;
        let mut stream = TcpStream::connect(server.addr())?;
        stream.write_all(
            b"POST /items HTTP/1.1\r\nHost: 127.0.0.1\r\n\
              Content-Length: 18446744073709551615\r\n\r\n",
        )?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply)?;
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{}", reply);

        let mut resp = ureq::get(&format!("{}/items", server.url())).call()?;
        assert_eq!(resp.body_mut().read_to_string()?, "1");
        assert_eq!(server.error(), None);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_live_server_bind_failure_is_setup_error() {
    let env = TestEnv::new();
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let item = live_item("live");
    let session = env.session(
        SessionConfig::new().with_liveserver(format!("127.0.0.1:{}", port)),
        &[item.clone()],
    );

    let report = session.run_item(&item, |_| panic!("must not run"));
    assert_eq!(report.outcome, Outcome::Error);
    assert!(report
        .message
        .unwrap_or_default()
        .contains("could not bind"));
    session.finish();
}

#[test]
fn test_malformed_address_is_setup_error() {
    let env = TestEnv::new();
    let item = live_item("live");
    let session = env.session(
        SessionConfig::new().with_liveserver("127.0.0.1:80-"),
        &[item.clone()],
    );
    let report = session.run_item(&item, |_| panic!("must not run"));
    assert_eq!(report.outcome, Outcome::Error);
    session.finish();
}
