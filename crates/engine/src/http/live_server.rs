//! Live HTTP server
//!
//! A background thread serving the application over real sockets, for
//! browser-driven and out-of-process tests. The thread:
//! 1. registers itself with the access blocker as a shared thread
//! 2. binds the first free candidate port
//! 3. reports the bound address (or the bind error) over a channel
//! 4. serves one request per connection with its own connections to the
//!    same test databases
//!
//! The caller blocks until readiness, bounded by a timeout, and re-raises
//! any error the thread reported. A request that panics the application is
//! recorded in the error slot and the thread keeps serving.

use super::{dispatch, AppContext, HttpApp, Request, Response};
use crate::session::panic_message;
use isodb_core::{AccessBlocker, IsoError, IsoResult};
use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const STREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEADER_LINES: usize = 100;
/// Largest request body the server reads
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// Address parsing
// ============================================================================

/// Parsed `host[:ports]` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveServerAddress {
    /// Host to bind and advertise
    pub host: String,
    /// Candidate ports in order; `0` asks for an ephemeral port
    pub ports: Vec<u16>,
}

fn bad_address(input: &str, reason: &str) -> IsoError {
    IsoError::configuration(format!("invalid live server address '{}': {}", input, reason))
}

/// Parse `host`, `host:port` or `host:8000-8010,8080`
///
/// # Errors
///
/// Configuration error for an empty host, non-numeric ports, or reversed
/// ranges.
pub fn parse_address(input: &str) -> IsoResult<LiveServerAddress> {
    let input = input.trim();
    let (host, ports) = if let Some(rest) = input.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| bad_address(input, "unterminated IPv6 host"))?;
        let host = &input[..end + 2];
        match &rest[end + 1..] {
            "" => (host, None),
            tail => match tail.strip_prefix(':') {
                Some(ports) => (host, Some(ports)),
                None => return Err(bad_address(input, "expected ':' after IPv6 host")),
            },
        }
    } else {
        match input.split_once(':') {
            Some((host, ports)) => (host, Some(ports)),
            None => (input, None),
        }
    };
    if host.is_empty() {
        return Err(bad_address(input, "empty host"));
    }

    let ports = match ports {
        None => vec![0],
        Some(list) => {
            let mut ports = Vec::new();
            for part in list.split(',') {
                let part = part.trim();
                match part.split_once('-') {
                    Some((start, end)) => {
                        let start = parse_port(input, start)?;
                        let end = parse_port(input, end)?;
                        if start > end {
                            return Err(bad_address(input, "port range start exceeds end"));
                        }
                        ports.extend(start..=end);
                    }
                    None => ports.push(parse_port(input, part)?),
                }
            }
            ports
        }
    };
    Ok(LiveServerAddress {
        host: host.to_string(),
        ports,
    })
}

fn parse_port(input: &str, text: &str) -> IsoResult<u16> {
    text.trim()
        .parse::<u16>()
        .map_err(|_| bad_address(input, &format!("'{}' is not a port", text.trim())))
}

// ============================================================================
// Server
// ============================================================================

/// A running live server
#[derive(Debug)]
pub struct LiveServer {
    host: String,
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    error: Arc<Mutex<Option<String>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LiveServer {
    /// Start serving `app` on the first free candidate of `address`
    ///
    /// `ctx` should carry connections dedicated to the server thread
    /// (see [`ConnectionHandler::fork`](crate::connection::ConnectionHandler::fork)).
    ///
    /// # Errors
    ///
    /// `LiveServer` when no candidate can be bound or the thread does not
    /// report readiness within `timeout`.
    pub fn start(
        address: &LiveServerAddress,
        app: Arc<dyn HttpApp>,
        ctx: AppContext,
        blocker: Arc<AccessBlocker>,
        timeout: Duration,
    ) -> IsoResult<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<IsoResult<SocketAddr>>();
        let stop = Arc::new(AtomicBool::new(false));
        let error_slot = Arc::new(Mutex::new(None));
        let host = address.host.clone();
        let ports = address.ports.clone();

        let thread_stop = Arc::clone(&stop);
        let thread_error = Arc::clone(&error_slot);
        let handle = thread::Builder::new()
            .name("isodb-live-server".to_string())
            .spawn(move || {
                let id = thread::current().id();
                blocker.share_with_thread(id);
                match bind_first(&host, &ports) {
                    Ok((listener, addr)) => {
                        // the receiver may have timed out already
                        let _ = ready_tx.send(Ok(addr));
                        serve(listener, app.as_ref(), &ctx, &thread_stop, &thread_error);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
                ctx.connections.close_all();
                blocker.unshare_thread(id);
            })?;

        let addr = match ready_rx.recv_timeout(timeout) {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                return Err(IsoError::LiveServer(format!(
                    "server did not become ready within {} ms",
                    timeout.as_millis()
                )));
            }
        };
        info!(target: "isodb::live_server", %addr, host = %address.host, "live server started");
        Ok(Self {
            host: address.host.clone(),
            addr,
            stop,
            error: error_slot,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Advertised host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bound port
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Bound socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://host:port`
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port())
    }

    /// Last failure of the serving thread: an accept error that stopped
    /// the loop, or a request that panicked
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// True until [`stop`](Self::stop) is called
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Stop serving and join the thread; calling it again is a no-op
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            error!(target: "isodb::live_server", "live server thread panicked");
        }
        info!(target: "isodb::live_server", addr = %self.addr, "live server stopped");
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Display for LiveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

fn bind_first(host: &str, ports: &[u16]) -> IsoResult<(TcpListener, SocketAddr)> {
    let bind_host = host.trim_start_matches('[').trim_end_matches(']');
    let mut last_error = None;
    for &port in ports {
        match TcpListener::bind((bind_host, port)) {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                listener.set_nonblocking(true)?;
                return Ok((listener, addr));
            }
            Err(e) => {
                debug!(target: "isodb::live_server", host, port, error = %e, "bind failed");
                last_error = Some(e);
            }
        }
    }
    Err(IsoError::LiveServer(format!(
        "could not bind to {} on any of {:?}: {}",
        host,
        ports,
        last_error.map_or_else(|| "no candidate ports".to_string(), |e| e.to_string())
    )))
}

fn serve(
    listener: TcpListener,
    app: &dyn HttpApp,
    ctx: &AppContext,
    stop: &AtomicBool,
    error_slot: &Mutex<Option<String>>,
) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                match catch_unwind(AssertUnwindSafe(|| handle_stream(stream, app, ctx))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(target: "isodb::live_server", %peer, error = %e, "request failed");
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(target: "isodb::live_server", %peer, error = %message, "request panicked");
                        *error_slot.lock() = Some(message);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                error!(target: "isodb::live_server", error = %e, "accept failed");
                *error_slot.lock() = Some(e.to_string());
                break;
            }
        }
    }
}

fn handle_stream(stream: TcpStream, app: &dyn HttpApp, ctx: &AppContext) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(STREAM_TIMEOUT))?;
    stream.set_write_timeout(Some(STREAM_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let response = match read_request(BufReader::new(stream))? {
        Incoming::Request(request) => dispatch(app, &request, ctx),
        Incoming::Rejected(response) => response,
    };
    write_response(&mut writer, &response)
}

/// A parsed request, or the error response for one that cannot be served
#[derive(Debug)]
enum Incoming {
    Request(Request),
    Rejected(Response),
}

fn bad_request() -> Incoming {
    Incoming::Rejected(Response::text(400, "Bad Request"))
}

fn read_request<R: BufRead>(mut reader: R) -> io::Result<Incoming> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Ok(bad_request());
    };
    let mut request = Request::new(method, target);

    let mut content_length = 0usize;
    for _ in 0..MAX_HEADER_LINES {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                match value.parse() {
                    Ok(length) => content_length = length,
                    Err(_) => return Ok(bad_request()),
                }
            }
            request = request.with_header(name.trim(), value);
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Ok(Incoming::Rejected(Response::text(413, "Payload Too Large")));
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
        request = request.with_body(body);
    }
    Ok(Incoming::Request(request))
}

fn write_response<W: Write>(writer: &mut W, response: &Response) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status(), response.reason());
    for (name, value) in response.headers() {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.body().len()
    ));
    writer.write_all(head.as_bytes())?;
    writer.write_all(response.body())?;
    writer.flush()
}
