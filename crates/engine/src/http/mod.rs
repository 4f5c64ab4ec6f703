//! In-process HTTP plumbing
//!
//! The application under test is an [`HttpApp`]: a function from a
//! [`Request`] to a [`Response`], given the connections and settings of the
//! calling context. Test clients call it directly; the live server calls it
//! from its own thread with its own connections.

pub mod client;
pub mod live_server;

use crate::connection::ConnectionHandler;
use isodb_core::{IsoResult, Settings};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::error;

/// Host used by test clients
pub const TEST_SERVER_HOST: &str = "testserver";

/// Setting listing the host names the application serves
pub const ALLOWED_HOSTS: &str = "ALLOWED_HOSTS";

/// Setting naming the URL configuration
pub const ROOT_URLCONF: &str = "ROOT_URLCONF";

/// Hosts accepted with `DEBUG` on and an empty `ALLOWED_HOSTS`
const DEBUG_HOSTS: [&str; 3] = [".localhost", "127.0.0.1", "[::1]"];

// ============================================================================
// Users
// ============================================================================

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Primary key
    pub id: i64,
    /// Natural key
    pub username: String,
    /// Superuser flag
    pub is_superuser: bool,
    /// Staff flag
    pub is_staff: bool,
}

/// The application's user model
pub trait UserModel: Send + Sync + Debug {
    /// Name of the natural-key field
    fn username_field(&self) -> &str {
        "username"
    }

    /// Look up a user by natural key
    fn get_by_natural_key(
        &self,
        connections: &ConnectionHandler,
        username: &str,
    ) -> IsoResult<Option<User>>;

    /// Create a superuser
    fn create_superuser(
        &self,
        connections: &ConnectionHandler,
        username: &str,
        email: &str,
        password: &str,
    ) -> IsoResult<User>;
}

// ============================================================================
// Request / Response
// ============================================================================

/// An HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: String,
    path: String,
    query: Option<String>,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    user: Option<User>,
    is_async: bool,
}

impl Request {
    /// Request for `path`, which may carry a query string
    pub fn new(method: impl AsRef<str>, path: impl AsRef<str>) -> Self {
        let (path, query) = match path.as_ref().split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path.as_ref().to_string(), None),
        };
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            path: if path.is_empty() { "/".to_string() } else { path },
            query,
            headers: BTreeMap::new(),
            body: Vec::new(),
            user: None,
            is_async: false,
        }
    }

    /// Set a header; names are case-insensitive
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach an authenticated user
    pub fn with_user(mut self, user: Option<User>) -> Self {
        self.user = user;
        self
    }

    pub(crate) fn into_async(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Upper-case method
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path without query string
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string without `?`
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers, lower-cased
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Host header without port, `testserver` when absent
    pub fn host(&self) -> &str {
        let host = self.header("host").unwrap_or(TEST_SERVER_HOST);
        strip_port(host)
    }

    /// Body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Authenticated user
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// True for requests built by the async client or factory
    pub fn is_async(&self) -> bool {
        self.is_async
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// An HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Empty response with a status
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `200 OK` with a text body
    pub fn ok(body: impl Into<String>) -> Self {
        Self::text(200, body)
    }

    /// Text response
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// First header with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers, in insertion order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text (lossy)
    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Standard reason phrase of the status
    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            _ => "Unknown",
        }
    }
}

// ============================================================================
// Application
// ============================================================================

/// What a request handler sees of its environment
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Connections of the calling thread
    pub connections: ConnectionHandler,
    /// Effective settings
    pub settings: Arc<Settings>,
}

impl AppContext {
    /// Context over `connections` and `settings`
    pub fn new(connections: ConnectionHandler, settings: Arc<Settings>) -> Self {
        Self {
            connections,
            settings,
        }
    }
}

/// The application under test
pub trait HttpApp: Send + Sync {
    /// Handle one request
    ///
    /// Errors become `500` responses.
    fn handle(&self, request: &Request, ctx: &AppContext) -> IsoResult<Response>;
}

impl<F> HttpApp for F
where
    F: Fn(&Request, &AppContext) -> IsoResult<Response> + Send + Sync,
{
    fn handle(&self, request: &Request, ctx: &AppContext) -> IsoResult<Response> {
        self(request, ctx)
    }
}

/// True if `host` matches one of the `ALLOWED_HOSTS` patterns
///
/// `*` matches anything; `.example.com` matches the domain and its
/// subdomains; anything else must match exactly (case-insensitive).
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    allowed.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        if pattern == "*" {
            true
        } else if let Some(domain) = pattern.strip_prefix('.') {
            host == domain || host.ends_with(&pattern)
        } else {
            host == pattern
        }
    })
}

/// Run a request through the application
///
/// Requests for hosts outside `ALLOWED_HOSTS` get a `400`; handler errors a
/// `500`.
pub fn dispatch(app: &dyn HttpApp, request: &Request, ctx: &AppContext) -> Response {
    let mut allowed = ctx.settings.get_str_list(ALLOWED_HOSTS);
    if allowed.is_empty() && ctx.settings.get_bool("DEBUG").unwrap_or(false) {
        allowed = DEBUG_HOSTS.iter().map(|h| h.to_string()).collect();
    }
    if !host_allowed(request.host(), &allowed) {
        return Response::text(
            400,
            format!("Invalid HTTP_HOST header: '{}'.", request.host()),
        );
    }
    match app.handle(request, ctx) {
        Ok(response) => response,
        Err(e) => {
            error!(
                target: "isodb::http",
                method = %request.method(),
                path = %request.path(),
                error = %e,
                "request handler failed"
            );
            Response::text(500, e.to_string())
        }
    }
}
