//! Per-connection handler: owns the client connection, the shared request
//! parser, and the ordered list of core connection plugins (spec §4.7).
//!
//! Generalizes the teacher's `Client::handle`, which blocks on one
//! `stream.read` with a 500ms timeout, parses exactly one request, and
//! returns. Here the same "non-blocking socket, short timeout, retry" shape
//! (the teacher's `read_http_request`/`read_tls_data` loops) becomes a
//! persistent readiness loop so a connection can pipeline requests, relay a
//! CONNECT tunnel, or drive a WebSocket — all without the pack's manifests
//! offering an async runtime or an epoll crate to build on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::ProxyError;
use crate::http::HttpMessage;
use crate::net::{BufferedConnection, Tag};
use crate::plugins::{ConnectionPlugin, RequestOutcome};

/// How long one readiness-loop iteration sleeps when there is nothing to
/// do. A pragmatic stand-in for the spec's "poll 1s" selector wait, scaled
/// down so per-connection threads don't feel laggy in the threaded model.
const IDLE_SLEEP: Duration = Duration::from_millis(15);

pub struct Handler {
    peer: String,
    // `Option` only so a TLS upgrade can `take()` the plaintext wrapper, pull
    // its socket out via `into_parts`, and install a TLS-wrapped one in its
    // place; it is `Some` at every point other callers can observe.
    client: Option<BufferedConnection>,
    plugins: Vec<Box<dyn ConnectionPlugin>>,
    request: HttpMessage,
    last_activity: Instant,
    timeout: Duration,
    done: bool,
}

impl Handler {
    pub fn new(
        peer: String,
        client: BufferedConnection,
        plugins: Vec<Box<dyn ConnectionPlugin>>,
        timeout: Duration,
    ) -> Self {
        Self {
            peer,
            client: Some(client),
            plugins,
            request: HttpMessage::request(),
            last_activity: Instant::now(),
            timeout,
            done: false,
        }
    }

    fn client(&mut self) -> &mut BufferedConnection {
        self.client.as_mut().expect("client connection present between steps")
    }

    /// Drives this connection to completion. Intended to run on its own OS
    /// thread in "threaded" mode (spec §4.8); the cooperative worker calls
    /// [`Handler::step`] directly instead.
    pub fn run(mut self) {
        loop {
            match self.step() {
                Ok(()) => {
                    if self.done || self.client().is_closed() {
                        break;
                    }
                    let idle = self.last_activity.elapsed() > self.timeout;
                    if idle && !self.client().has_pending_send() {
                        debug!("{}: idle timeout, tearing down", self.peer);
                        break;
                    }
                    std::thread::sleep(IDLE_SLEEP);
                }
                Err(e) => {
                    if !matches!(e, ProxyError::PeerClosed) {
                        warn!("{}: {e}", self.peer);
                    }
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Runs one iteration of the readiness loop: drive handshakes, flush
    /// pending writes, read and dispatch one round of client/upstream data.
    /// Returns `Ok(())` even when nothing was ready; callers check `done`.
    pub fn step(&mut self) -> Result<(), ProxyError> {
        if !self.client().drive_handshake()? {
            return Ok(());
        }

        self.client().flush()?;
        for plugin in self.plugins.iter_mut() {
            if let Some(conn) = plugin.upstream() {
                conn.flush()?;
            }
        }

        self.poll_client()?;
        self.poll_upstreams()?;

        if self.plugins.iter().any(|p| p.is_finished()) {
            self.done = true;
        }
        Ok(())
    }

    fn poll_client(&mut self) -> Result<(), ProxyError> {
        let mut buf = Vec::new();
        let n = self.client().recv(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        self.last_activity = Instant::now();

        let mut chunk = Some(buf);
        for plugin in self.plugins.iter_mut() {
            let mut client = self.client.take().expect("client present");
            chunk = match chunk {
                Some(bytes) => plugin.on_client_data(&mut client, &bytes),
                None => None,
            };
            self.client = Some(client);
        }
        let Some(bytes) = chunk else { return Ok(()) };

        self.request.feed(&bytes).map_err(|detail| ProxyError::ProtocolViolation { status: Some(400), detail })?;
        if !self.request.is_complete() {
            return Ok(());
        }

        let completed = std::mem::replace(&mut self.request, HttpMessage::request());
        self.dispatch_request(completed)
    }

    fn dispatch_request(&mut self, request: HttpMessage) -> Result<(), ProxyError> {
        for plugin in self.plugins.iter_mut() {
            let mut client = self.client.take().expect("client present");
            let outcome = plugin.on_request_complete(&mut client, &request);
            self.client = Some(client);
            match outcome? {
                RequestOutcome::NotApplicable => continue,
                RequestOutcome::Continue => return Ok(()),
                RequestOutcome::Teardown => {
                    self.done = true;
                    return Ok(());
                }
                RequestOutcome::UpgradeClientTls(server_config) => {
                    self.upgrade_client_tls(server_config)?;
                    return Ok(());
                }
            }
        }
        warn!("{}: no plugin claimed a completed request", self.peer);
        self.done = true;
        Ok(())
    }

    fn upgrade_client_tls(&mut self, server_config: Arc<rustls::ServerConfig>) -> Result<(), ProxyError> {
        let old = self.client.take().expect("client present");
        let (stream, pending) = old.into_parts();
        let mut upgraded = BufferedConnection::tls_server(Tag::Client, stream, server_config)?;
        for chunk in pending.chunks(8192) {
            upgraded.queue(chunk);
        }
        self.client = Some(upgraded);
        Ok(())
    }

    fn poll_upstreams(&mut self) -> Result<(), ProxyError> {
        for plugin in self.plugins.iter_mut() {
            let mut buf = Vec::new();
            let (got_data, newly_closed) = match plugin.upstream() {
                Some(conn) if conn.drive_handshake()? => {
                    let n = conn.recv(&mut buf)?;
                    (n > 0, n == 0 && conn.is_closed())
                }
                _ => (false, false),
            };
            if got_data {
                self.last_activity = Instant::now();
                let mut client = self.client.take().expect("client present");
                let result = plugin.on_upstream_data(&mut client, &buf);
                self.client = Some(client);
                result?;
            }
            if newly_closed {
                plugin.on_upstream_closed();
            }
        }
        Ok(())
    }

    /// Runs one [`step`](Self::step); consumes and tears `self` down if the
    /// connection is finished, closed, or idle-timed-out, returning `None`
    /// in that case. Used by the cooperative (threadless) worker, which
    /// owns a pool of handlers rather than dedicating a thread to one.
    pub fn step_and_continue(mut self) -> Option<Self> {
        match self.step() {
            Ok(()) => {
                let idle = self.last_activity.elapsed() > self.timeout;
                if self.done || self.client().is_closed() || (idle && !self.client().has_pending_send()) {
                    self.shutdown();
                    None
                } else {
                    Some(self)
                }
            }
            Err(e) => {
                if !matches!(e, ProxyError::PeerClosed) {
                    warn!("{}: {e}", self.peer);
                }
                self.shutdown();
                None
            }
        }
    }

    fn shutdown(mut self) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.client().has_pending_send() && Instant::now() < deadline {
            if self.client().flush().is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        for plugin in self.plugins.iter_mut() {
            plugin.on_client_connection_close();
        }
        self.client().shutdown();
    }
}
