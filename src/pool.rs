//! The acceptor pool: binds the listening socket once in a parent process,
//! then forks `config.num_workers` acceptor processes and hands each one a
//! duplicate of the listening socket over a `socketpair` + `SCM_RIGHTS`
//! channel (spec §4.8).
//!
//! The fork/FD-passing choreography mirrors `original_source/proxy.py`'s
//! `AcceptorPool.setup` almost line for line; nothing in the example pack
//! does multi-process fan-out, so the shape here is ported directly from
//! the original rather than grounded in the teacher.

use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{error, info};

use crate::acceptor::{listener_from_owned_fd, Acceptor};
use crate::cert::CertStore;
use crate::config::Config;
use crate::devtools::DevtoolsSender;
use crate::handler::Handler;
use crate::net::fd;
use crate::plugins::PluginRegistry;

/// Binds the proxy's listening socket and forks off `config.num_workers`
/// acceptor processes, one listening-socket descriptor each. Blocks in the
/// parent until every worker has exited.
pub struct AcceptorPool {
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
    cert_store: Option<Arc<CertStore>>,
    devtools: Option<DevtoolsSender>,
}

impl AcceptorPool {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<PluginRegistry>,
        cert_store: Option<Arc<CertStore>>,
        devtools: Option<DevtoolsSender>,
    ) -> Self {
        Self { config, registry, cert_store, devtools }
    }

    pub fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind((self.config.hostname, self.config.port))?;
        listener.set_nonblocking(true)?;
        unsafe {
            libc::listen(listener.as_raw_fd(), self.config.backlog);
        }
        info!("listening on {}:{}", self.config.hostname, self.config.port);

        let lock_path = std::env::temp_dir().join(format!("relayproxy-accept-{}.lock", self.config.port));
        let accept_lock_fd = open_lock_file(&lock_path)?;

        let mut children = Vec::new();
        for worker_id in 0..self.config.num_workers {
            let (parent_end, child_end) = fd::socketpair()?;
            let child_lock = dup_owned_fd(&accept_lock_fd)?;

            match unsafe { fd::fork()? } {
                Some(pid) => {
                    drop(child_end);
                    fd::send_fd(&parent_end, listener.as_raw_fd())?;
                    children.push(pid);
                }
                None => {
                    drop(parent_end);
                    let received = fd::recv_fd(&child_end)?;
                    drop(listener);
                    let worker_listener = listener_from_owned_fd(received);
                    let running = Arc::new(AtomicBool::new(true));
                    match Acceptor::new(
                        worker_listener,
                        Arc::clone(&self.config),
                        Arc::clone(&self.registry),
                        self.cert_store.clone(),
                        self.devtools.clone(),
                        child_lock,
                    ) {
                        Ok(acceptor) => acceptor.run(running),
                        Err(e) => error!("worker {worker_id} failed to start: {e}"),
                    }
                    std::process::exit(0);
                }
            }
        }
        drop(listener);

        for pid in children {
            let mut status: libc::c_int = 0;
            unsafe {
                libc::waitpid(pid, &mut status, 0);
            }
        }
        Ok(())
    }
}

fn open_lock_file(path: &std::path::Path) -> std::io::Result<std::os::fd::OwnedFd> {
    use std::os::fd::FromRawFd;
    let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes()).unwrap();
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) })
}

fn dup_owned_fd(fd: &std::os::fd::OwnedFd) -> std::io::Result<std::os::fd::OwnedFd> {
    use std::os::fd::FromRawFd;
    let dup = unsafe { libc::dup(fd.as_raw_fd()) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(dup) })
}

/// Drives many [`Handler`]s from a single thread, one `step()` each per
/// sweep, instead of spawning an OS thread per connection ("threadless"
/// mode, spec §4.8). Grounded on the same non-blocking-plus-retry idiom
/// `Handler::run` itself uses, just applied across a `Vec` of handlers
/// instead of one.
pub struct CooperativeWorker {
    handlers: Vec<Option<Handler>>,
}

impl CooperativeWorker {
    pub fn new(_timeout: std::time::Duration) -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn add(&mut self, handler: Handler) {
        self.handlers.push(Some(handler));
    }

    /// Steps every live handler once, dropping any that finished or died.
    pub fn step_all(&mut self) {
        for slot in self.handlers.iter_mut() {
            if let Some(handler) = slot.take() {
                *slot = handler.step_and_continue();
            }
        }
        self.handlers.retain(|h| h.is_some());
    }

    pub fn active_count(&self) -> usize {
        self.handlers.len()
    }
}
