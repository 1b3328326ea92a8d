//! Plugin trait families and factory registries (spec §4.4, §9).
//!
//! The original proxy.py looks plugins up dynamically by dotted class name
//! (`--plugins pkg.module.ClassName`) and instantiates them via
//! `importlib`. Rust has no equivalent runtime class registry, so per the
//! spec's redesign flag this becomes three explicit trait families plus a
//! factory-function registry built at startup — the same shape the teacher
//! uses for `Middleware` (`webserver::middleware::Middleware` holds a
//! `route`/`domain` filter plus a `MiddlewareFn` closure-like enum, built
//! once and stored in an `Arc<Vec<Middleware>>` shared across connections).
//! Here each factory is `Fn() -> Box<dyn Trait>` so every connection gets
//! its own plugin instances, matching "one instance per accepted
//! connection" in the spec.

use crate::http::HttpMessage;
use crate::net::BufferedConnection;
use crate::ws::Frame;

/// What a core connection plugin wants the handler to do after
/// `on_request_complete`.
pub enum RequestOutcome {
    /// This plugin does not claim the completed request; try the next one.
    NotApplicable,
    /// Handled; keep the connection open for the next pipelined request.
    Continue,
    /// Handled; tear the connection down once pending writes flush.
    Teardown,
    /// Handled (a CONNECT with TLS interception); the handler must rebuild
    /// the client `BufferedConnection` as a TLS server using this config
    /// before processing any further bytes.
    UpgradeClientTls(std::sync::Arc<rustls::ServerConfig>),
}

/// Per-connection protocol handler (spec §4.4 "core connection plugin").
///
/// `ConnectionPlugin` is the top-level family driven directly by
/// [`crate::handler::Handler`]; `ProxyCorePlugin` and `WebCorePlugin` are
/// its two concrete implementations, each of which in turn drives a list of
/// [`ProxyPlugin`] or [`WebPlugin`] sub-plugins.
pub trait ConnectionPlugin: Send {
    fn name(&self) -> &'static str;

    /// Called for every chunk of raw bytes read from the client, left to
    /// right across the plugin pipeline. Returning `None` suppresses
    /// parsing of this chunk for the rest of the pipeline.
    fn on_client_data(&mut self, client: &mut BufferedConnection, raw: &[u8]) -> Option<Vec<u8>>;

    /// Called once the client's current request has fully parsed. Plugins
    /// are tried in order; the first to return anything but `NotApplicable`
    /// claims the request.
    fn on_request_complete(
        &mut self,
        client: &mut BufferedConnection,
        request: &HttpMessage,
    ) -> Result<RequestOutcome, crate::error::ProxyError>;

    /// Called for every chunk about to be written to the client, left to
    /// right. Returning `None` drops the chunk.
    fn on_response_chunk(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>>;

    /// A second connection this plugin wants the handler to poll alongside
    /// the client (e.g. the proxy core plugin's upstream socket). `None`
    /// when there is nothing else to poll.
    fn upstream(&mut self) -> Option<&mut BufferedConnection> {
        None
    }

    /// Called with bytes read from `upstream()`, if any.
    fn on_upstream_data(&mut self, client: &mut BufferedConnection, raw: &[u8]) -> Result<(), crate::error::ProxyError> {
        let _ = (client, raw);
        Ok(())
    }

    fn on_client_connection_close(&mut self) {}

    /// Called once `upstream()`'s connection has been observed closed by
    /// the peer (EOF). The default no-op suits plugins without an upstream;
    /// `ProxyCorePlugin` uses this to end the connection once a tunneled or
    /// forwarded upstream finishes sending.
    fn on_upstream_closed(&mut self) {}

    /// True once this plugin considers the connection's work done (e.g. the
    /// web plugin after a non-keep-alive response).
    fn is_finished(&self) -> bool {
        false
    }
}

/// Sub-plugin instantiated by the proxy core plugin (spec §4.4).
pub trait ProxyPlugin: Send {
    fn name(&self) -> &'static str;

    fn before_upstream_connection(&mut self, request: HttpMessage) -> Option<HttpMessage> {
        Some(request)
    }

    fn handle_client_request(&mut self, request: HttpMessage) -> Option<HttpMessage> {
        Some(request)
    }

    fn handle_upstream_chunk(&mut self, chunk: Vec<u8>) -> Vec<u8> {
        chunk
    }

    fn on_upstream_connection_close(&mut self) {}
}

/// Which scheme a web sub-plugin's route is reachable under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WebProtocol {
    Http,
    Https,
    WebSocket,
}

/// Sub-plugin instantiated by the web core plugin (spec §4.4, §4.6).
pub trait WebPlugin: Send {
    fn name(&self) -> &'static str;

    fn routes(&self) -> Vec<(WebProtocol, String)>;

    fn handle_request(&mut self, request: &HttpMessage) -> HttpMessage;

    fn on_websocket_open(&mut self) {}

    /// Returning `None` swallows the frame (no echo/forward).
    fn on_websocket_message(&mut self, frame: Frame) -> Option<Frame> {
        Some(frame)
    }

    fn on_websocket_close(&mut self) {}
}

pub type ProxyPluginFactory = Box<dyn Fn() -> Box<dyn ProxyPlugin> + Send + Sync>;
pub type WebPluginFactory = Box<dyn Fn() -> Box<dyn WebPlugin> + Send + Sync>;

/// The plugin factory lists a worker is configured with, analogous to the
/// teacher's `Arc<Vec<Middleware>>` shared across every `Client`.
#[derive(Default)]
pub struct PluginRegistry {
    pub proxy_plugins: Vec<ProxyPluginFactory>,
    pub web_plugins: Vec<WebPluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxy_plugin(mut self, factory: ProxyPluginFactory) -> Self {
        self.proxy_plugins.push(factory);
        self
    }

    pub fn with_web_plugin(mut self, factory: WebPluginFactory) -> Self {
        self.web_plugins.push(factory);
        self
    }

    pub fn instantiate_proxy_plugins(&self) -> Vec<Box<dyn ProxyPlugin>> {
        self.proxy_plugins.iter().map(|f| f()).collect()
    }

    pub fn instantiate_web_plugins(&self) -> Vec<Box<dyn WebPlugin>> {
        self.web_plugins.iter().map(|f| f()).collect()
    }
}

pub mod proxy;
pub mod web;

pub use proxy::ProxyCorePlugin;
pub use web::WebCorePlugin;
