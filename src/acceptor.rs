//! One worker's accept loop (spec §4.8).
//!
//! Grounded on the teacher's `WebServer::start`
//! (`webserver::WebServer::start`, `for stream in listener.incoming() {
//! thread::spawn(...) }`) for the threaded dispatch path. The threadless
//! path — accepted connections handed to a single cooperative loop instead
//! of a fresh OS thread — has no teacher precedent (`Sunnickel-RustWebservice`
//! is thread-per-connection only), so it's built from the same non-blocking
//! + short-timeout polling idiom the teacher already uses for socket reads,
//! applied to `accept()` instead of `read()`.

use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::cert::CertStore;
use crate::config::Config;
use crate::devtools::DevtoolsSender;
use crate::handler::Handler;
use crate::net::{BufferedConnection, Tag};
use crate::plugins::{PluginRegistry, ProxyCorePlugin, WebCorePlugin};
use crate::pool::CooperativeWorker;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// A single worker process's listener, plugin factories, and dispatch mode.
pub struct Acceptor {
    listener: TcpListener,
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
    cert_store: Option<Arc<CertStore>>,
    devtools: Option<DevtoolsSender>,
    accept_lock: OwnedFd,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        config: Arc<Config>,
        registry: Arc<PluginRegistry>,
        cert_store: Option<Arc<CertStore>>,
        devtools: Option<DevtoolsSender>,
        accept_lock: OwnedFd,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self { listener, config, registry, cert_store, devtools, accept_lock })
    }

    pub fn build_plugins(&self) -> Vec<Box<dyn crate::plugins::ConnectionPlugin>> {
        vec![
            Box::new(ProxyCorePlugin::new(
                Arc::clone(&self.config),
                self.cert_store.clone(),
                self.registry.instantiate_proxy_plugins(),
            )),
            Box::new(WebCorePlugin::new(Arc::clone(&self.config), self.registry.instantiate_web_plugins())),
        ]
    }

    /// Runs the accept loop forever. Never returns in practice; `running`
    /// lets a future signal handler request graceful shutdown (spec §5).
    pub fn run(self, running: Arc<AtomicBool>) {
        if self.config.threadless {
            self.run_threadless(running);
        } else {
            self.run_threaded(running);
        }
    }

    fn run_threaded(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match self.try_accept() {
                Some((stream, peer)) => {
                    let plugins = self.build_plugins();
                    let timeout = self.config.client_timeout;
                    thread::spawn(move || {
                        let Ok(conn) = BufferedConnection::plain(Tag::Client, stream) else { return };
                        Handler::new(peer, conn, plugins, timeout).run();
                    });
                }
                None => thread::sleep(ACCEPT_POLL),
            }
        }
    }

    fn run_threadless(self, running: Arc<AtomicBool>) {
        let mut worker = CooperativeWorker::new(self.config.client_timeout);
        while running.load(Ordering::Relaxed) {
            if let Some((stream, peer)) = self.try_accept() {
                let plugins = self.build_plugins();
                if let Ok(conn) = BufferedConnection::plain(Tag::Client, stream) {
                    worker.add(Handler::new(peer, conn, plugins, self.config.client_timeout));
                }
            }
            worker.step_all();
            thread::sleep(ACCEPT_POLL);
        }
    }

    /// Accepts at most one connection, serialized across worker processes
    /// via `accept_lock` so a thundering herd of workers doesn't all wake
    /// for the same pending connection.
    fn try_accept(&self) -> Option<(std::net::TcpStream, String)> {
        if unsafe { libc::flock(self.accept_lock.as_raw_fd(), libc::LOCK_EX) } != 0 {
            warn!("accept lock failed: {}", std::io::Error::last_os_error());
            return None;
        }
        let result = self.listener.accept();
        unsafe {
            libc::flock(self.accept_lock.as_raw_fd(), libc::LOCK_UN);
        }
        match result {
            Ok((stream, addr)) => {
                info!("accepted {addr}");
                if let Some(devtools) = &self.devtools {
                    devtools.publish(crate::devtools::DevtoolsEvent::ConnectionOpened { peer: addr.to_string() });
                }
                Some((stream, addr.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("accept() failed: {e}");
                None
            }
        }
    }
}

/// Reconstructs a `TcpListener` from a descriptor received over an IPC
/// channel (spec §4.8 "worker receives the listening-socket descriptor").
pub fn listener_from_owned_fd(fd: OwnedFd) -> TcpListener {
    unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) }
}
