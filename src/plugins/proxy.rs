//! The proxy core connection plugin: PARSING → CONNECTED → (TUNNEL |
//! INTERCEPTED) → DONE (spec §4.5).
//!
//! Grounded on the teacher's one-shot `Proxy`/`ProxySchema` HTTP(S) client
//! helper (`webserver::proxy::Proxy`, used from `get_proxy_route` to relay a
//! single upstream request/response) and on `Client`'s TLS handshake loop
//! (`perform_tls_handshake`/`read_tls_data`) for the interception path,
//! generalized into a long-lived per-connection state machine that can also
//! tunnel and pipeline.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName};

use crate::cert::CertStore;
use crate::config::Config;
use crate::error::{well_known, ProxyError};
use crate::http::HttpMessage;
use crate::net::{BufferedConnection, Tag};

use super::{ProxyPlugin, RequestOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProxyState {
    Parsing,
    Tunnel,
    Intercepted,
    Done,
}

/// The proxy core plugin. One instance per connection; owns the upstream
/// `BufferedConnection` once established.
pub struct ProxyCorePlugin {
    config: Arc<Config>,
    cert_store: Option<Arc<CertStore>>,
    sub_plugins: Vec<Box<dyn ProxyPlugin>>,
    state: ProxyState,
    server: Option<BufferedConnection>,
    // Tracks response boundaries for a forwarded (non-tunnel) upstream, so
    // chunked bodies and keep-alive pipelining are understood the same way
    // the client-side request parser understands them. `None` while no
    // response is in flight; reset after each one completes.
    response: Option<HttpMessage>,
    bytes_client_to_server: u64,
    bytes_server_to_client: u64,
}

impl ProxyCorePlugin {
    pub fn new(config: Arc<Config>, cert_store: Option<Arc<CertStore>>, sub_plugins: Vec<Box<dyn ProxyPlugin>>) -> Self {
        Self {
            config,
            cert_store,
            sub_plugins,
            state: ProxyState::Parsing,
            server: None,
            response: None,
            bytes_client_to_server: 0,
            bytes_server_to_client: 0,
        }
    }

    /// Whether `request` should be treated as a forward-proxy request at
    /// all (an absolute-URI or CONNECT target, i.e. it names an upstream
    /// host). The web core plugin is the complementary case.
    pub fn applies_to(request: &HttpMessage) -> bool {
        request.request.host.is_some() || request.request.method.eq_ignore_ascii_case("CONNECT")
    }

    fn connect_upstream(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        TcpStream::connect((host, port)).map_err(|e| ProxyError::UpstreamConnectFailed {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })
    }

    fn handle_connect(&mut self, client: &mut BufferedConnection, host: String, port: u16) -> Result<RequestOutcome, ProxyError> {
        let stream = match Self::connect_upstream(&host, port) {
            Ok(s) => s,
            Err(e) => {
                warn!("upstream connect failed for CONNECT {host}:{port}: {e}");
                client.queue(&well_known::bad_gateway());
                self.state = ProxyState::Done;
                return Ok(RequestOutcome::Teardown);
            }
        };
        client.queue(well_known::TUNNEL_ESTABLISHED);

        match &self.cert_store {
            None => {
                self.server = Some(BufferedConnection::plain(Tag::Server, stream)?);
                self.state = ProxyState::Tunnel;
                info!("tunneling CONNECT {host}:{port}");
                Ok(RequestOutcome::Continue)
            }
            Some(cert_store) => {
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|_| ProxyError::ProtocolViolation { status: Some(502), detail: format!("invalid SNI host {host}") })?;
                let tls_client_config = default_client_tls_config();
                let mut server_conn = BufferedConnection::tls_client(Tag::Server, stream, tls_client_config, server_name)?;
                drive_to_completion(&mut server_conn, self.config.client_timeout)?;

                let cert_path = cert_store.certificate_for_host(&host)?;
                let key_path = cert_store.signing_key_path();
                let server_tls_config = build_leaf_server_config(&cert_path, key_path)?;

                self.server = Some(server_conn);
                self.state = ProxyState::Intercepted;
                info!("intercepting CONNECT {host}:{port}");
                Ok(RequestOutcome::UpgradeClientTls(server_tls_config))
            }
        }
    }

    fn forward_request(&mut self, client: &mut BufferedConnection, mut request: HttpMessage) -> Result<RequestOutcome, ProxyError> {
        if self.server.is_none() {
            let host = request.request.host.clone().ok_or_else(|| ProxyError::ProtocolViolation {
                status: Some(400),
                detail: "request lacks a resolvable host".to_string(),
            })?;
            let port = request.request.port.unwrap_or(80);
            match Self::connect_upstream(&host, port) {
                Ok(stream) => self.server = Some(BufferedConnection::plain(Tag::Server, stream)?),
                Err(e) => {
                    warn!("upstream connect failed for {host}:{port}: {e}");
                    client.queue(&well_known::bad_gateway());
                    self.state = ProxyState::Done;
                    return Ok(RequestOutcome::Teardown);
                }
            }
        }

        request.headers.remove("proxy-authorization");
        request.headers.remove("proxy-connection");
        request.headers.insert("Via", &format!("1.1 {}", well_known::proxy_agent()));

        for plugin in self.sub_plugins.iter_mut() {
            match plugin.handle_client_request(request) {
                Some(r) => request = r,
                None => return Ok(RequestOutcome::Continue),
            }
        }

        let bytes = request.build(&self.config.disabled_headers, self.config.server_recvbuf_size);
        self.bytes_client_to_server += bytes.len() as u64;
        self.server.as_mut().unwrap().queue(&bytes);
        Ok(RequestOutcome::Continue)
    }
}

impl super::ConnectionPlugin for ProxyCorePlugin {
    fn name(&self) -> &'static str {
        "proxy-core"
    }

    fn on_client_data(&mut self, client: &mut BufferedConnection, raw: &[u8]) -> Option<Vec<u8>> {
        let _ = client;
        match self.state {
            ProxyState::Tunnel => {
                self.bytes_client_to_server += raw.len() as u64;
                if let Some(server) = self.server.as_mut() {
                    server.queue(raw);
                }
                None
            }
            _ => Some(raw.to_vec()),
        }
    }

    fn on_request_complete(&mut self, client: &mut BufferedConnection, request: &HttpMessage) -> Result<RequestOutcome, ProxyError> {
        if self.state == ProxyState::Done {
            return Ok(RequestOutcome::Teardown);
        }
        if !Self::applies_to(request) && self.server.is_none() {
            return Ok(RequestOutcome::NotApplicable);
        }

        if let Some(auth) = &self.config.auth_code {
            let expected = format!("Basic {auth}");
            if request.headers.get("proxy-authorization") != Some(expected.as_str()) {
                client.queue(&well_known::proxy_auth_required());
                self.state = ProxyState::Done;
                return Ok(RequestOutcome::Teardown);
            }
        }

        let mut candidate = request.clone();
        for plugin in self.sub_plugins.iter_mut() {
            match plugin.before_upstream_connection(candidate) {
                Some(r) => candidate = r,
                None => {
                    self.state = ProxyState::Done;
                    return Ok(RequestOutcome::Teardown);
                }
            }
        }

        if candidate.request.method.eq_ignore_ascii_case("CONNECT") && self.server.is_none() {
            let host = candidate.request.host.clone().ok_or_else(|| ProxyError::ProtocolViolation {
                status: Some(400),
                detail: "CONNECT without resolvable authority".to_string(),
            })?;
            let port = candidate.request.port.unwrap_or(443);
            return self.handle_connect(client, host, port);
        }

        self.forward_request(client, candidate)
    }

    fn on_response_chunk(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        Some(chunk)
    }

    fn upstream(&mut self) -> Option<&mut BufferedConnection> {
        self.server.as_mut()
    }

    fn on_upstream_data(&mut self, client: &mut BufferedConnection, raw: &[u8]) -> Result<(), ProxyError> {
        // A tunnel or an already-intercepted stream carries opaque bytes
        // (TLS records, or arbitrary TCP once CONNECT succeeded) that this
        // plugin must never try to parse as HTTP — only a forwarded
        // request/response pair gets tracked through a response parser.
        if matches!(self.state, ProxyState::Tunnel | ProxyState::Intercepted) {
            let mut chunk = raw.to_vec();
            for plugin in self.sub_plugins.iter_mut() {
                chunk = plugin.handle_upstream_chunk(chunk);
            }
            self.bytes_server_to_client += chunk.len() as u64;
            client.queue(&chunk);
            return Ok(());
        }

        let response = self.response.get_or_insert_with(HttpMessage::response);
        response
            .feed(raw)
            .map_err(|detail| ProxyError::ProtocolViolation { status: Some(502), detail })?;
        let completed = response.is_complete();

        let mut chunk = raw.to_vec();
        for plugin in self.sub_plugins.iter_mut() {
            chunk = plugin.handle_upstream_chunk(chunk);
        }
        self.bytes_server_to_client += chunk.len() as u64;
        client.queue(&chunk);

        if completed {
            // Ready for the next pipelined response on a keep-alive upstream.
            self.response = None;
        }
        Ok(())
    }

    fn on_upstream_closed(&mut self) {
        // A closed upstream always ends this plugin's part of the
        // connection: a tunnel/interception has nothing left to relay, and
        // a forwarded request/response pair is by definition one-shot.
        if self.server.is_some() {
            self.state = ProxyState::Done;
        }
    }

    fn on_client_connection_close(&mut self) {
        for plugin in self.sub_plugins.iter_mut() {
            plugin.on_upstream_connection_close();
        }
        debug!(
            "connection closed: {} bytes client->server, {} bytes server->client",
            self.bytes_client_to_server, self.bytes_server_to_client
        );
    }

    fn is_finished(&self) -> bool {
        self.state == ProxyState::Done
    }
}

fn drive_to_completion(conn: &mut BufferedConnection, timeout: Duration) -> Result<(), ProxyError> {
    let deadline = Instant::now() + timeout;
    loop {
        if conn.drive_handshake()? {
            return Ok(());
        }
        if Instant::now() > deadline {
            return Err(ProxyError::UpstreamConnectFailed {
                host: String::new(),
                port: 0,
                reason: "TLS handshake timed out".to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn default_client_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn build_leaf_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>, ProxyError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| config_error(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| config_error(e.to_string()))?;
    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| config_error(e.to_string()))?;
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| config_error(e.to_string()))?;
    Ok(Arc::new(cfg))
}

fn config_error(reason: String) -> ProxyError {
    ProxyError::UpstreamConnectFailed { host: "tls-config".to_string(), port: 0, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ConnectionPlugin;

    fn connect_request() -> HttpMessage {
        let mut m = HttpMessage::request();
        m.feed(b"CONNECT upstream.example:443 HTTP/1.1\r\nHost: upstream.example:443\r\n\r\n").unwrap();
        m
    }

    #[test]
    fn rejects_missing_proxy_authorization_when_auth_required() {
        use crate::plugins::ConnectionPlugin;
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_stream = TcpStream::connect(addr).unwrap();
        let (server_stream, _) = listener.accept().unwrap();
        let mut client = BufferedConnection::plain(Tag::Client, server_stream).unwrap();
        drop(client_stream);

        let config = Arc::new(Config::new().with_auth_code("dXNlcjpwYXNz".to_string()));
        let mut plugin = ProxyCorePlugin::new(config, None, Vec::new());

        let mut request = HttpMessage::request();
        request.feed(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n").unwrap();

        let outcome = plugin.on_request_complete(&mut client, &request).unwrap();
        assert!(matches!(outcome, RequestOutcome::Teardown));
    }

    #[test]
    fn applies_to_recognizes_absolute_uri_and_connect() {
        let mut m = HttpMessage::request();
        m.feed(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n").unwrap();
        assert!(ProxyCorePlugin::applies_to(&m));

        let connect = connect_request();
        assert!(ProxyCorePlugin::applies_to(&connect));

        let mut local = HttpMessage::request();
        local.feed(b"GET /local HTTP/1.1\r\nHost: me\r\n\r\n").unwrap();
        assert!(!ProxyCorePlugin::applies_to(&local));
    }
}
