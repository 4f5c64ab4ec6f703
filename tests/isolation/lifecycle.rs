//! Test database creation, reuse, teardown and worker suffixes

use crate::common::*;
use isodb::{
    AppRegistry, Connection, Features, MigrationExecutor, RawConnection, SchemaStrategy, SetupState,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Migration executor that counts schema builds
#[derive(Debug, Default)]
struct CountingMigrations {
    calls: AtomicUsize,
}

impl CountingMigrations {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SchemaStrategy for CountingMigrations {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn apply(&self, conn: &Connection, apps: &AppRegistry) -> IsoResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        MigrationExecutor.apply(conn, apps)
    }
}

/// SQLite backend whose databases cannot be destroyed
#[derive(Debug)]
struct UndeletableBackend(SqliteBackend);

impl Backend for UndeletableBackend {
    fn vendor(&self) -> &'static str {
        self.0.vendor()
    }

    fn features(&self) -> Features {
        self.0.features()
    }

    fn database_exists(&self, name: &str) -> IsoResult<bool> {
        self.0.database_exists(name)
    }

    fn create_database(&self, name: &str) -> IsoResult<()> {
        self.0.create_database(name)
    }

    fn destroy_database(&self, _name: &str) -> IsoResult<()> {
        Err(IsoError::database("sqlite", "permission denied"))
    }

    fn connect(&self, name: &str) -> IsoResult<Box<dyn RawConnection>> {
        self.0.connect(name)
    }
}

fn db_item() -> TestItem {
    TestItem::new("uses_db").fixture("db")
}

#[test]
fn test_databases_created_and_destroyed() {
    let env = TestEnv::new();
    let session = env.session(SessionConfig::new(), &[db_item()]);
    assert_eq!(session.handles()[0].test_name(), "test_app");
    assert_eq!(session.database_state("default"), Some(SetupState::Created));
    assert!(env.backend.database_exists("test_app").unwrap());

    let report = session.finish();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(!env.backend.database_exists("test_app").unwrap());
}

#[test]
fn test_database_teardown_failure_is_a_warning() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(UndeletableBackend(SqliteBackend::new(dir.path())));
    let items = vec![db_item(), TestItem::new("transactional").fixture("transactional_db")];
    let mut session = Session::builder(SessionConfig::new(), backend.clone())
        .with_apps(apps())
        .with_blocker(AccessBlocker::new_shared())
        .with_worker_env(WorkerEnv::new())
        .build()
        .unwrap();
    session.prepare(&items).unwrap();

    for item in &items {
        let report = session.run_item(item, |ctx| {
            assert_eq!(count(ctx.connections(), "shop_item")?, 1);
            Ok(())
        });
        assert_eq!(report.outcome, Outcome::Passed);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    let report = session.finish();
    assert_eq!(
        report.warnings,
        vec![
            "Error when trying to teardown test databases: \
             default: Database error (sqlite): permission denied"
                .to_string()
        ]
    );
    assert!(backend.database_exists("test_app").unwrap());
}

#[test]
fn test_isolation_teardown_failure_keeps_outcome() {
    let env = TestEnv::new();
    let item = TestItem::new("drops_table").fixture("transactional_db");
    let session = env.session(SessionConfig::new(), &[item.clone()]);

    let report = session.run_item(&item, |ctx| {
        ctx.connection("default")?.execute_batch("DROP TABLE shop_item")?;
        Ok(())
    });
    assert_eq!(report.outcome, Outcome::Passed);
    assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
    assert!(report.warnings[0]
        .starts_with("Error when trying to teardown test databases: "));
    assert!(report.warnings[0].contains("shop_item"), "{}", report.warnings[0]);
    assert!(session.blocker().is_blocked());
    assert!(session.finish().warnings.is_empty());
}

#[test]
fn test_no_database_items_skip_setup() {
    let env = TestEnv::new();
    let session = env.session(SessionConfig::new(), &[TestItem::new("pure")]);
    assert_eq!(session.database_state("default"), None);
    assert!(!env.backend.database_exists("test_app").unwrap());
    session.finish();
}

#[test]
fn test_reuse_db_keeps_and_reuses() {
    let env = TestEnv::new();
    let strategy = Arc::new(CountingMigrations::default());
    let config = SessionConfig::new().with_reuse_db(true);

    let mut first = env
        .builder(config.clone())
        .with_migration_strategy(strategy.clone())
        .build()
        .unwrap();
    first.prepare(&[db_item()]).unwrap();
    assert_eq!(first.database_state("default"), Some(SetupState::Created));
    first.finish();
    assert_eq!(strategy.calls(), 1);
    assert!(env.backend.database_exists("test_app").unwrap());

    // marker left outside any test survives only if the database is reused
    {
        let mut raw = env.backend.connect("test_app").unwrap();
        raw.execute_batch("CREATE TABLE reuse_marker (id INTEGER)").unwrap();
    }

    let mut second = env
        .builder(config.clone())
        .with_migration_strategy(strategy.clone())
        .build()
        .unwrap();
    second.prepare(&[db_item()]).unwrap();
    assert_eq!(second.database_state("default"), Some(SetupState::Reused));
    assert!(second.handles()[0].exists_from_prior_run());
    assert_eq!(strategy.calls(), 1);

    let report = second.run_item(&db_item(), |ctx| {
        let tables = ctx.connection("default")?.table_names()?;
        assert!(tables.iter().any(|t| t == "reuse_marker"));
        assert_eq!(count(ctx.connections(), "shop_item")?, 1);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    second.finish();
    assert!(env.backend.database_exists("test_app").unwrap());
}

#[test]
fn test_create_db_forces_recreation() {
    let env = TestEnv::new();
    let strategy = Arc::new(CountingMigrations::default());

    let first = {
        let mut s = env
            .builder(SessionConfig::new().with_reuse_db(true))
            .with_migration_strategy(strategy.clone())
            .build()
            .unwrap();
        s.prepare(&[db_item()]).unwrap();
        s
    };
    first.finish();

    let mut second = env
        .builder(SessionConfig::new().with_reuse_db(true).with_create_db(true))
        .with_migration_strategy(strategy.clone())
        .build()
        .unwrap();
    second.prepare(&[db_item()]).unwrap();
    assert_eq!(second.database_state("default"), Some(SetupState::Created));
    assert_eq!(strategy.calls(), 2);
    second.finish();
}

#[test]
fn test_nomigrations_builds_from_models() {
    let env = TestEnv::new();
    let session = env.session(SessionConfig::new().with_nomigrations(true), &[db_item()]);
    let report = session.run_item(&db_item(), |ctx| {
        let tables = ctx.connection("default")?.table_names()?;
        assert!(tables.iter().any(|t| t == "shop_item"));
        assert!(tables.iter().any(|t| t == "auth_user"));
        // data migrations do not run
        assert_eq!(count(ctx.connections(), "shop_item")?, 0);
        Ok(())
    });
    assert!(report.passed(), "{:?}", report);
    session.finish();
}

#[test]
fn test_worker_suffix_names_database() {
    let env = TestEnv::new();
    let mut session = env
        .builder(SessionConfig::new())
        .with_worker_env(WorkerEnv::new().with_tox_parallel("py311").with_xdist_worker("gw1"))
        .build()
        .unwrap();
    assert_eq!(session.handles()[0].test_name(), "test_app_py311_gw1");
    session.prepare(&[db_item()]).unwrap();
    assert!(env.backend.database_exists("test_app_py311_gw1").unwrap());
    assert!(!env.backend.database_exists("test_app").unwrap());
    session.finish();
}

#[test]
fn test_prepare_twice_is_rejected() {
    let env = TestEnv::new();
    let mut session = env.session(SessionConfig::new(), &[db_item()]);
    assert!(session.prepare(&[db_item()]).is_err());
    session.finish();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_worker_suffix_applied_once(worker in "gw[0-9]{1,3}") {
        let env = TestEnv::new();
        let session = env
            .builder(SessionConfig::new())
            .with_worker_env(WorkerEnv::new().with_xdist_worker(worker.clone()))
            .build()
            .unwrap();
        let name = session.handles()[0].test_name().to_string();
        prop_assert_eq!(&name, &format!("test_app_{}", worker));
        prop_assert_eq!(name.matches(worker.as_str()).count(), 1);
        prop_assert_eq!(
            isodb::test_database_name("app", None, &[worker.clone(), worker.clone()]),
            name
        );
    }
}
