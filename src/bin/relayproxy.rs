//! Binary entry point: parses CLI flags, builds the shared plugin registry
//! and (optional) certificate store, and runs the acceptor pool.
//!
//! Grounded on the teacher's own `main.rs` shape (parse config, build
//! middleware/route tables once, hand them to `WebServer::start`): here the
//! registry plays the role of the teacher's middleware/route `Vec`s, built
//! once in `main` and shared (via `Arc`) across every forked worker.

use std::sync::Arc;

use log::info;

use relayproxy::cert::CertStore;
use relayproxy::config::Config;
use relayproxy::devtools;
use relayproxy::plugins::PluginRegistry;
use relayproxy::pool::AcceptorPool;

fn main() {
    relayproxy::logger::init(log::LevelFilter::Info);

    let config = Config::from_args(std::env::args().skip(1));
    let config = Arc::new(config);

    // No first-party plugins ship in this crate; embedders add their own
    // via `PluginRegistry::with_proxy_plugin`/`with_web_plugin` before
    // constructing their own `AcceptorPool`. This binary demonstrates the
    // bare proxy core with no sub-plugins registered.
    let registry = Arc::new(PluginRegistry::new());

    let cert_store = config.ca_material.clone().map(|material| Arc::new(CertStore::new(material)));

    let devtools_sender = if config.enable_devtools {
        let (tx, _rx) = devtools::channel(256);
        Some(tx)
    } else {
        None
    };

    if let Some(pid_file) = &config.pid_file {
        let _ = std::fs::write(pid_file, std::process::id().to_string());
    }

    info!(
        "starting relayproxy: {} worker(s), threadless={}, tls_interception={}",
        config.num_workers,
        config.threadless,
        config.tls_interception_enabled()
    );

    let pool = AcceptorPool::new(config, registry, cert_store, devtools_sender);
    if let Err(e) = pool.run() {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
