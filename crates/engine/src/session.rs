//! Test session orchestration
//!
//! A [`Session`] owns everything that lives as long as a test run: the
//! resolved test databases, the connections, the settings environment
//! layer and the lazily started live server. Per test, [`Session::run_item`]
//! performs the whole fixture dance:
//!
//! 1. plan the isolation from marks and fixtures
//! 2. apply the `urls` override and the live server's `ALLOWED_HOSTS`
//! 3. unblock database access and establish isolation
//! 4. restrict connections to the test's aliases
//! 5. run the body, catching panics
//! 6. undo everything in reverse order
//!
//! Items never overlap: `run_item` holds the session-wide item lock.

use crate::config::{SessionConfig, WorkerEnv};
use crate::connection::{Connection, ConnectionHandler};
use crate::fixtures::{admin_user, AssertNumQueries, CaptureOnCommitCallbacks};
use crate::http::client::{AsyncClient, AsyncRequestFactory, Client, RequestFactory};
use crate::http::live_server::{parse_address, LiveServer};
use crate::http::{AppContext, HttpApp, User, UserModel, ALLOWED_HOSTS, ROOT_URLCONF, TEST_SERVER_HOST};
use crate::isolation::{IsolationGuard, IsolationPlan};
use crate::item::{databases_for_setup, TestItem};
use crate::lifecycle::{DatabaseSetup, LifecycleManager, SetupOptions, SetupState};
use crate::naming::{resolve_handles, TestDatabaseHandle};
use crate::schema::{AppRegistry, SchemaStrategy};
use isodb_backend::Backend;
use isodb_core::{
    AccessBlocker, FixtureName, IsoError, IsoResult, Settings, SettingsOverride, SettingsWrapper,
};
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Reports
// ============================================================================

/// Result of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Body returned `Ok`
    Passed,
    /// Body returned `Err` or panicked
    Failed,
    /// Setup failed; the body did not run
    Error,
    /// Not runnable on this backend
    Skipped,
}

/// Report of one test
#[derive(Debug, Clone)]
pub struct TestReport {
    /// Node id of the item
    pub node_id: String,
    /// Outcome
    pub outcome: Outcome,
    /// Failure, error or skip reason
    pub message: Option<String>,
    /// Teardown problems
    pub warnings: Vec<String>,
    /// Isolation used, if any
    pub plan: Option<IsolationPlan>,
}

impl TestReport {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            outcome: Outcome::Passed,
            message: None,
            warnings: Vec::new(),
            plan: None,
        }
    }

    fn with(mut self, outcome: Outcome, message: impl Into<String>) -> Self {
        self.outcome = outcome;
        self.message = Some(message.into());
        self
    }

    /// True for [`Outcome::Passed`]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }
}

/// Report of the session teardown
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Teardown problems
    pub warnings: Vec<String>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Session`]
pub struct SessionBuilder {
    config: SessionConfig,
    backend: Arc<dyn Backend>,
    apps: AppRegistry,
    blocker: Option<Arc<AccessBlocker>>,
    settings: Option<Arc<Settings>>,
    app: Option<Arc<dyn HttpApp>>,
    user_model: Option<Arc<dyn UserModel>>,
    worker_env: Option<WorkerEnv>,
    migration_strategy: Option<Arc<dyn SchemaStrategy>>,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("backend", &self.backend)
            .field("worker_env", &self.worker_env)
            .finish()
    }
}

impl SessionBuilder {
    /// Builder for `config` on `backend`
    pub fn new(config: SessionConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            backend,
            apps: AppRegistry::new(),
            blocker: None,
            settings: None,
            app: None,
            user_model: None,
            worker_env: None,
            migration_strategy: None,
        }
    }

    /// Installed apps
    pub fn with_apps(mut self, apps: AppRegistry) -> Self {
        self.apps = apps;
        self
    }

    /// Blocker to use instead of the process-wide one
    pub fn with_blocker(mut self, blocker: Arc<AccessBlocker>) -> Self {
        self.blocker = Some(blocker);
        self
    }

    /// Settings shared with the application
    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Application served by clients and the live server
    pub fn with_app(mut self, app: Arc<dyn HttpApp>) -> Self {
        self.app = Some(app);
        self
    }

    /// User model behind the admin fixtures
    pub fn with_user_model(mut self, model: Arc<dyn UserModel>) -> Self {
        self.user_model = Some(model);
        self
    }

    /// Parallel-run identity (read from the environment otherwise)
    pub fn with_worker_env(mut self, env: WorkerEnv) -> Self {
        self.worker_env = Some(env);
        self
    }

    /// Schema strategy used when migrations are enabled
    pub fn with_migration_strategy(mut self, strategy: Arc<dyn SchemaStrategy>) -> Self {
        self.migration_strategy = Some(strategy);
        self
    }

    /// Resolve the databases and create the session
    ///
    /// Worker suffixes are applied here, before any connection opens.
    ///
    /// # Errors
    ///
    /// Configuration errors from the database configuration.
    pub fn build(self) -> IsoResult<Session> {
        let blocker = self.blocker.unwrap_or_else(AccessBlocker::global);
        let settings = self.settings.unwrap_or_default();
        let apps = Arc::new(self.apps);
        let mut handles = resolve_handles(&self.config, self.backend.as_ref())?;
        let connections =
            ConnectionHandler::new(&handles, Arc::clone(&self.backend), Arc::clone(&blocker));

        let mut lifecycle = LifecycleManager::new(Arc::clone(&self.backend), Arc::clone(&apps));
        if let Some(strategy) = self.migration_strategy {
            lifecycle = lifecycle.with_migration_strategy(strategy);
        }
        let worker_env = self.worker_env.unwrap_or_else(WorkerEnv::from_env);
        lifecycle.apply_suffixes(&mut handles, &connections, worker_env.suffix().as_deref());

        debug!(
            target: "isodb::session",
            aliases = ?connections.aliases(),
            vendor = self.backend.vendor(),
            "session built"
        );
        Ok(Session {
            config: self.config,
            backend: self.backend,
            apps,
            blocker,
            settings,
            app: self.app,
            user_model: self.user_model,
            lifecycle,
            handles,
            connections,
            state: Mutex::new(SessionState::default()),
            item_lock: Mutex::new(()),
        })
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Default)]
struct SessionState {
    setup: Option<DatabaseSetup>,
    environment: Option<SettingsOverride>,
    live_server: Option<Arc<LiveServer>>,
}

/// One test run
pub struct Session {
    config: SessionConfig,
    backend: Arc<dyn Backend>,
    apps: Arc<AppRegistry>,
    blocker: Arc<AccessBlocker>,
    settings: Arc<Settings>,
    app: Option<Arc<dyn HttpApp>>,
    user_model: Option<Arc<dyn UserModel>>,
    lifecycle: LifecycleManager,
    handles: Vec<TestDatabaseHandle>,
    connections: ConnectionHandler,
    state: Mutex<SessionState>,
    item_lock: Mutex<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("handles", &self.handles)
            .finish()
    }
}

impl Session {
    /// Start building a session
    pub fn builder(config: SessionConfig, backend: Arc<dyn Backend>) -> SessionBuilder {
        SessionBuilder::new(config, backend)
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolved test databases
    pub fn handles(&self) -> &[TestDatabaseHandle] {
        &self.handles
    }

    /// Connections used by test bodies
    pub fn connections(&self) -> &ConnectionHandler {
        &self.connections
    }

    /// The access blocker
    pub fn blocker(&self) -> &Arc<AccessBlocker> {
        &self.blocker
    }

    /// Shared settings
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Installed apps
    pub fn apps(&self) -> &Arc<AppRegistry> {
        &self.apps
    }

    /// What setup did with an alias (mirrors report their target)
    pub fn database_state(&self, alias: &str) -> Option<SetupState> {
        let target = self.connections.mirror_target(alias).unwrap_or(alias);
        self.state.lock().setup.as_ref()?.state(target)
    }

    /// Enable the test environment and set up the databases `items` need
    ///
    /// # Errors
    ///
    /// `Provisioning` when a database cannot be created; no item may run
    /// after that.
    pub fn prepare(&mut self, items: &[TestItem]) -> IsoResult<()> {
        {
            let mut state = self.state.lock();
            if state.setup.is_some() {
                return Err(IsoError::invalid_operation("session is already prepared"));
            }
            let mut environment = SettingsOverride::builder(&self.settings)
                .set("DEBUG", json!(self.config.debug_mode))
                .append(ALLOWED_HOSTS, [TEST_SERVER_HOST])
                .build();
            environment.enable()?;
            state.environment = Some(environment);
        }

        let plan = databases_for_setup(items, &self.handles);
        let setup = if plan.is_empty() {
            debug!(target: "isodb::session", "no item uses a database");
            DatabaseSetup::empty()
        } else {
            let opts = SetupOptions {
                use_migrations: !self.config.nomigrations,
                keep_existing: self.config.reuse_db,
                force_create: self.config.create_db,
                aliases: plan.aliases,
                serialized_aliases: plan.serialized,
                verbosity: self.config.verbosity,
            };
            let _unblock = self.blocker.unblock();
            self.lifecycle
                .ensure_databases(&mut self.handles, &self.connections, &opts)?
        };
        info!(
            target: "isodb::session",
            databases = ?setup.aliases(),
            keep = setup.keep(),
            "test databases ready"
        );
        self.state.lock().setup = Some(setup);
        Ok(())
    }

    fn live_server(&self) -> IsoResult<Arc<LiveServer>> {
        if let Some(server) = &self.state.lock().live_server {
            return Ok(Arc::clone(server));
        }
        let app = self.app.clone().ok_or_else(|| {
            IsoError::configuration("the live_server fixture requires an application")
        })?;
        let address = parse_address(self.config.live_server_address())?;
        let ctx = AppContext::new(self.connections.fork(), Arc::clone(&self.settings));
        let server = Arc::new(LiveServer::start(
            &address,
            app,
            ctx,
            Arc::clone(&self.blocker),
            Duration::from_millis(self.config.live_server_timeout_ms),
        )?);
        self.state.lock().live_server = Some(Arc::clone(&server));
        Ok(server)
    }

    fn check_provisioned(&self, plan: &IsolationPlan) -> IsoResult<()> {
        let state = self.state.lock();
        let setup = state
            .setup
            .as_ref()
            .ok_or_else(|| IsoError::invalid_operation("Session::prepare was not called"))?;
        for alias in &plan.aliases {
            let target = self.connections.mirror_target(alias).unwrap_or(alias);
            if setup.state(target).is_none() {
                return Err(IsoError::configuration(format!(
                    "test database for '{}' was not set up; pass the item to Session::prepare",
                    alias
                )));
            }
        }
        Ok(())
    }

    /// Run one test
    ///
    /// Setup failures yield [`Outcome::Error`] without running `body`;
    /// teardown failures are recorded as warnings.
    pub fn run_item<F>(&self, item: &TestItem, body: F) -> TestReport
    where
        F: FnOnce(&TestContext<'_>) -> anyhow::Result<()>,
    {
        let _serial = self.item_lock.lock();
        let report = TestReport::new(item.node_id());

        if item.is_native() {
            let _unblock = self.blocker.unblock();
            let ctx = TestContext::bare(self, item);
            return run_body(report, &ctx, body);
        }

        let plan = match IsolationPlan::for_item(item, self.connections.aliases(), self.backend.features()) {
            Ok(plan) => plan,
            Err(IsoError::Unsupported(reason)) => return report.with(Outcome::Skipped, reason),
            Err(e) => return report.with(Outcome::Error, e.to_string()),
        };
        if let Some(plan) = &plan {
            if let Err(e) = self.check_provisioned(plan) {
                return report.with(Outcome::Error, e.to_string());
            }
        }
        let mut report = TestReport {
            plan: plan.clone(),
            ..report
        };

        let mut overrides: Vec<SettingsOverride> = Vec::new();
        let urls = match item.urls() {
            Ok(urls) => urls,
            Err(e) => return report.with(Outcome::Error, e.to_string()),
        };
        if let Some(urls) = urls {
            let mut token = SettingsOverride::builder(&self.settings)
                .set(ROOT_URLCONF, urls)
                .build();
            if let Err(e) = token.enable() {
                return report.with(Outcome::Error, e.to_string());
            }
            overrides.push(token);
        }

        let live_server = if item.requests(FixtureName::LiveServer) {
            let server = match self.live_server() {
                Ok(server) => server,
                Err(e) => return report.with(Outcome::Error, e.to_string()),
            };
            let mut token = SettingsOverride::builder(&self.settings)
                .append(ALLOWED_HOSTS, [server.host()])
                .build();
            if let Err(e) = token.enable() {
                return report.with(Outcome::Error, e.to_string());
            }
            overrides.push(token);
            Some(server)
        } else {
            None
        };

        let unblock = plan.as_ref().map(|_| self.blocker.unblock());
        let snapshots = self
            .state
            .lock()
            .setup
            .as_ref()
            .map(|s| s.snapshots().clone())
            .unwrap_or_default();
        let guard = match plan {
            Some(plan) => match IsolationGuard::setup(plan, &self.connections, &self.apps, &snapshots) {
                Ok(guard) => Some(guard),
                Err(e) => return report.with(Outcome::Error, e.to_string()),
            },
            None => None,
        };
        if let Some(guard) = &guard {
            self.connections.restrict(guard.plan().aliases.iter().cloned());
        }

        let mut ctx = TestContext::bare(self, item);
        ctx.live_server = live_server;
        if item.requests(FixtureName::Settings) {
            ctx.settings = Some(SettingsWrapper::new(Arc::clone(&self.settings)));
        }
        report = match ctx.resolve_admin() {
            Ok(()) => run_body(report, &ctx, body),
            Err(e) => report.with(Outcome::Error, e.to_string()),
        };

        // teardown, newest first
        if let Some(settings) = &ctx.settings {
            if let Err(e) = settings.finalize() {
                report.warnings.push(e.to_string());
            }
        }
        self.connections.unrestrict();
        if let Some(guard) = guard {
            if let Err(e) = guard.teardown() {
                let warning = IsoError::Teardown(e.to_string()).to_string();
                warn!(target: "isodb::session", node = %item.node_id(), "{}", warning);
                report.warnings.push(warning);
            }
        }
        drop(unblock);
        while let Some(mut token) = overrides.pop() {
            if let Err(e) = token.disable() {
                report.warnings.push(e.to_string());
            }
        }
        debug!(target: "isodb::session", node = %item.node_id(), outcome = ?report.outcome, "item finished");
        report
    }

    /// Stop the live server, drop the environment layer, destroy databases
    pub fn finish(self) -> SessionReport {
        let state = std::mem::take(&mut *self.state.lock());
        if let Some(server) = &state.live_server {
            server.stop();
        }
        let mut warnings = Vec::new();
        if let Some(mut environment) = state.environment {
            if let Err(e) = environment.disable() {
                warnings.push(e.to_string());
            }
        }
        if let Some(setup) = state.setup {
            warnings.extend(self.lifecycle.teardown_databases(
                setup,
                &self.connections,
                self.config.verbosity,
            ));
        }
        info!(target: "isodb::session", warnings = warnings.len(), "session finished");
        SessionReport { warnings }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked".to_string()
    }
}

fn run_body<F>(report: TestReport, ctx: &TestContext<'_>, body: F) -> TestReport
where
    F: FnOnce(&TestContext<'_>) -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(Ok(())) => report,
        Ok(Err(e)) => report.with(Outcome::Failed, format!("{:#}", e)),
        Err(payload) => report.with(Outcome::Failed, panic_message(payload.as_ref())),
    }
}

// ============================================================================
// Test context
// ============================================================================

/// Fixture values available to a test body
pub struct TestContext<'s> {
    session: &'s Session,
    item: &'s TestItem,
    settings: Option<SettingsWrapper>,
    live_server: Option<Arc<LiveServer>>,
    admin: Option<User>,
}

impl fmt::Debug for TestContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("item", &self.item.node_id())
            .finish()
    }
}

impl<'s> TestContext<'s> {
    fn bare(session: &'s Session, item: &'s TestItem) -> Self {
        Self {
            session,
            item,
            settings: None,
            live_server: None,
            admin: None,
        }
    }

    fn require(&self, fixture: FixtureName) -> IsoResult<()> {
        if self.item.requests(fixture) {
            Ok(())
        } else {
            Err(IsoError::configuration(format!(
                "fixture '{}' was not requested by {}",
                fixture,
                self.item.node_id()
            )))
        }
    }

    fn resolve_admin(&mut self) -> IsoResult<()> {
        if self.item.requests(FixtureName::AdminUser) {
            let model = self.django_user_model()?;
            self.admin = Some(admin_user(model.as_ref(), &self.session.connections)?);
        }
        Ok(())
    }

    fn app_context(&self) -> AppContext {
        AppContext::new(
            self.session.connections.clone(),
            Arc::clone(&self.session.settings),
        )
    }

    fn app(&self) -> IsoResult<Arc<dyn HttpApp>> {
        self.session
            .app
            .clone()
            .ok_or_else(|| IsoError::configuration("no application configured for the test client"))
    }

    /// The running item
    pub fn item(&self) -> &TestItem {
        self.item
    }

    /// All connections (access is still gated)
    pub fn connections(&self) -> &ConnectionHandler {
        &self.session.connections
    }

    /// Connection for an alias
    pub fn connection(&self, alias: &str) -> IsoResult<Connection> {
        self.session.connections.get(alias)
    }

    /// `django_db_blocker`
    pub fn django_db_blocker(&self) -> IsoResult<&Arc<AccessBlocker>> {
        self.require(FixtureName::DjangoDbBlocker)?;
        Ok(&self.session.blocker)
    }

    /// `settings`
    pub fn settings(&self) -> IsoResult<&SettingsWrapper> {
        self.require(FixtureName::Settings)?;
        self.settings
            .as_ref()
            .ok_or_else(|| IsoError::invalid_operation("settings fixture is not active"))
    }

    /// `client`
    pub fn client(&self) -> IsoResult<Client> {
        self.require(FixtureName::Client)?;
        Ok(Client::new(self.app()?, self.app_context()))
    }

    /// `admin_client`: a client logged in as the admin user
    pub fn admin_client(&self) -> IsoResult<Client> {
        self.require(FixtureName::AdminClient)?;
        let client = Client::new(self.app()?, self.app_context());
        client.force_login(self.admin_user()?);
        Ok(client)
    }

    /// `async_client`
    pub fn async_client(&self) -> IsoResult<AsyncClient> {
        self.require(FixtureName::AsyncClient)?;
        Ok(AsyncClient::new(self.app()?, self.app_context()))
    }

    /// `rf`
    pub fn rf(&self) -> IsoResult<RequestFactory> {
        self.require(FixtureName::Rf)?;
        Ok(RequestFactory::new())
    }

    /// `async_rf`
    pub fn async_rf(&self) -> IsoResult<AsyncRequestFactory> {
        self.require(FixtureName::AsyncRf)?;
        Ok(AsyncRequestFactory::new())
    }

    /// `admin_user`
    pub fn admin_user(&self) -> IsoResult<User> {
        self.require(FixtureName::AdminUser)?;
        self.admin
            .clone()
            .ok_or_else(|| IsoError::invalid_operation("admin user was not created"))
    }

    /// `django_user_model`
    pub fn django_user_model(&self) -> IsoResult<Arc<dyn UserModel>> {
        self.require(FixtureName::DjangoUserModel)?;
        self.session
            .user_model
            .clone()
            .ok_or_else(|| IsoError::configuration("no user model configured"))
    }

    /// `django_username_field`
    pub fn django_username_field(&self) -> IsoResult<String> {
        self.require(FixtureName::DjangoUsernameField)?;
        Ok(self.django_user_model()?.username_field().to_string())
    }

    /// `live_server`
    pub fn live_server(&self) -> IsoResult<&LiveServer> {
        self.require(FixtureName::LiveServer)?;
        self.live_server
            .as_deref()
            .ok_or_else(|| IsoError::LiveServer("live server is not running".to_string()))
    }

    /// `django_assert_num_queries`
    pub fn django_assert_num_queries(&self, num: usize) -> IsoResult<AssertNumQueries> {
        self.require(FixtureName::DjangoAssertNumQueries)?;
        Ok(AssertNumQueries::exact(&self.session.connections, num)
            .verbosity(self.session.config.verbosity))
    }

    /// `django_assert_max_num_queries`
    pub fn django_assert_max_num_queries(&self, num: usize) -> IsoResult<AssertNumQueries> {
        self.require(FixtureName::DjangoAssertMaxNumQueries)?;
        Ok(AssertNumQueries::max(&self.session.connections, num)
            .verbosity(self.session.config.verbosity))
    }

    /// `django_capture_on_commit_callbacks`
    pub fn django_capture_on_commit_callbacks(&self) -> IsoResult<CaptureOnCommitCallbacks> {
        self.require(FixtureName::DjangoCaptureOnCommitCallbacks)?;
        Ok(CaptureOnCommitCallbacks::new(&self.session.connections))
    }
}
