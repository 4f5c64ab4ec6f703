//! Test clients and request factories
//!
//! Clients dispatch straight into the application on the calling thread, so
//! whatever the handler does with the database is subject to the same
//! access blocker and alias gate as the test body. The async variants run
//! inline as well; awaiting them never moves work to another thread.

use super::{dispatch, AppContext, HttpApp, Request, Response, User, TEST_SERVER_HOST};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Builds requests without sending them
#[derive(Debug, Clone, Default)]
pub struct RequestFactory {
    defaults: Vec<(String, String)>,
}

impl RequestFactory {
    /// Factory adding only the `host` header
    pub fn new() -> Self {
        Self::default()
    }

    /// Header added to every request
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.push((name.into(), value.into()));
        self
    }

    /// Request with an arbitrary method
    pub fn request(&self, method: &str, path: &str) -> Request {
        let mut request = Request::new(method, path).with_header("host", TEST_SERVER_HOST);
        for (name, value) in &self.defaults {
            request = request.with_header(name, value.clone());
        }
        request
    }

    /// `GET` request
    pub fn get(&self, path: &str) -> Request {
        self.request("GET", path)
    }

    /// `POST` request with a body
    pub fn post(&self, path: &str, body: impl Into<Vec<u8>>, content_type: &str) -> Request {
        self.request("POST", path)
            .with_header("content-type", content_type)
            .with_body(body)
    }
}

/// Request factory for async handlers
#[derive(Debug, Clone, Default)]
pub struct AsyncRequestFactory {
    inner: RequestFactory,
}

impl AsyncRequestFactory {
    /// Factory adding only the `host` header
    pub fn new() -> Self {
        Self::default()
    }

    /// Request with an arbitrary method
    pub fn request(&self, method: &str, path: &str) -> Request {
        self.inner.request(method, path).into_async()
    }

    /// `GET` request
    pub fn get(&self, path: &str) -> Request {
        self.request("GET", path)
    }

    /// `POST` request with a body
    pub fn post(&self, path: &str, body: impl Into<Vec<u8>>, content_type: &str) -> Request {
        self.inner.post(path, body, content_type).into_async()
    }
}

/// In-process test client with a login session
#[derive(Clone)]
pub struct Client {
    app: Arc<dyn HttpApp>,
    ctx: AppContext,
    factory: RequestFactory,
    user: Arc<Mutex<Option<User>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("user", &*self.user.lock())
            .finish()
    }
}

impl Client {
    /// Client for `app` in `ctx`
    pub fn new(app: Arc<dyn HttpApp>, ctx: AppContext) -> Self {
        Self {
            app,
            ctx,
            factory: RequestFactory::new(),
            user: Arc::new(Mutex::new(None)),
        }
    }

    /// Log in without credentials
    pub fn force_login(&self, user: User) {
        *self.user.lock() = Some(user);
    }

    /// End the login session
    pub fn logout(&self) {
        *self.user.lock() = None;
    }

    /// Logged-in user
    pub fn user(&self) -> Option<User> {
        self.user.lock().clone()
    }

    /// Send a request built elsewhere
    pub fn request(&self, request: Request) -> Response {
        let request = request.with_user(self.user());
        dispatch(self.app.as_ref(), &request, &self.ctx)
    }

    /// `GET path`
    pub fn get(&self, path: &str) -> Response {
        self.request(self.factory.get(path))
    }

    /// `POST path`
    pub fn post(&self, path: &str, body: impl Into<Vec<u8>>, content_type: &str) -> Response {
        self.request(self.factory.post(path, body, content_type))
    }
}

/// Async test client; shares nothing with [`Client`] but the application
#[derive(Debug, Clone)]
pub struct AsyncClient {
    inner: Client,
    factory: AsyncRequestFactory,
}

impl AsyncClient {
    /// Client for `app` in `ctx`
    pub fn new(app: Arc<dyn HttpApp>, ctx: AppContext) -> Self {
        Self {
            inner: Client::new(app, ctx),
            factory: AsyncRequestFactory::new(),
        }
    }

    /// Log in without credentials
    pub fn force_login(&self, user: User) {
        self.inner.force_login(user);
    }

    /// End the login session
    pub fn logout(&self) {
        self.inner.logout();
    }

    /// Send a request built elsewhere
    pub async fn request(&self, request: Request) -> Response {
        self.inner.request(request.into_async())
    }

    /// `GET path`
    pub async fn get(&self, path: &str) -> Response {
        self.inner.request(self.factory.get(path))
    }

    /// `POST path`
    pub async fn post(&self, path: &str, body: impl Into<Vec<u8>>, content_type: &str) -> Response {
        self.inner.request(self.factory.post(path, body, content_type))
    }
}
