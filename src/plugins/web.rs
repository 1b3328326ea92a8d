//! The web core connection plugin: a two-level route table serving static
//! files, custom routes, and WebSocket upgrades (spec §4.6).
//!
//! Grounded on the teacher's `Client::handle_routing`/`RouteType` dispatch
//! (longest-prefix match over `Route { route, route_type, .. }`) and
//! `files::get_static_file_content` for static serving, generalized with a
//! WebSocket upgrade step the teacher doesn't have (`ws::keys::key_to_accept`
//! performs the RFC 6455 handshake math this plugin needs).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;

use crate::config::Config;
use crate::error::ProxyError;
use crate::http::HttpMessage;
use crate::net::BufferedConnection;
use crate::ws::{key_to_accept, Frame, Opcode};

use super::{RequestOutcome, WebPlugin, WebProtocol};

pub struct WebCorePlugin {
    config: Arc<Config>,
    sub_plugins: Vec<Box<dyn WebPlugin>>,
    // protocol -> path -> sub-plugin index (spec §4.6): `Http` and `Https`
    // routes are kept in separate inner maps so the same path can be
    // registered under each without one overwriting the other; dispatch
    // picks the inner map from the connection's TLS status.
    routes: HashMap<WebProtocol, HashMap<String, usize>>,
    // WebSocket routes are reachable regardless of TLS (ws:// and wss:// both
    // upgrade the same way), so they live in their own path -> index map.
    websocket_routes: HashMap<String, usize>,
    websocket_route: Option<usize>,
    done: bool,
    recv_buf: Vec<u8>,
}

impl WebCorePlugin {
    pub fn new(config: Arc<Config>, sub_plugins: Vec<Box<dyn WebPlugin>>) -> Self {
        let mut routes: HashMap<WebProtocol, HashMap<String, usize>> = HashMap::new();
        let mut websocket_routes = HashMap::new();
        for (idx, plugin) in sub_plugins.iter().enumerate() {
            for (protocol, path) in plugin.routes() {
                if protocol == WebProtocol::WebSocket {
                    websocket_routes.insert(path, idx);
                } else {
                    routes.entry(protocol).or_default().insert(path, idx);
                }
            }
        }
        Self { config, sub_plugins, routes, websocket_routes, websocket_route: None, done: false, recv_buf: Vec::new() }
    }

    fn protocol_for(client: &BufferedConnection) -> WebProtocol {
        if client.is_tls() {
            WebProtocol::Https
        } else {
            WebProtocol::Http
        }
    }

    fn is_upgrade_request(request: &HttpMessage) -> bool {
        let connection_ok = request
            .headers
            .get("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        let upgrade_ok = request
            .headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        connection_ok && upgrade_ok
    }

    fn handshake_response(key: &str) -> Vec<u8> {
        let accept = key_to_accept(key.as_bytes());
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        )
        .into_bytes()
    }

    fn serve_static(&self, path: &str) -> HttpMessage {
        let Some(dir) = &self.config.static_server_dir else {
            return not_found();
        };
        let relative = path.split('?').next().unwrap_or(path).trim_start_matches('/');
        let full = PathBuf::from(dir).join(relative);
        match fs::read(&full) {
            Ok(bytes) => {
                let mut response = HttpMessage::response();
                response.version = "HTTP/1.1".to_string();
                response.response.code = 200;
                response.response.reason = "OK".to_string();
                response.headers.insert("Content-Type", guess_content_type(&full));
                response.headers.insert("Content-Length", &bytes.len().to_string());
                response.body = bytes;
                response
            }
            Err(e) => {
                warn!("static file {} unreadable: {e}", full.display());
                not_found()
            }
        }
    }
}

impl super::ConnectionPlugin for WebCorePlugin {
    fn name(&self) -> &'static str {
        "web-core"
    }

    fn on_client_data(&mut self, client: &mut BufferedConnection, raw: &[u8]) -> Option<Vec<u8>> {
        if let Some(route_idx) = self.websocket_route {
            self.recv_buf.extend_from_slice(raw);
            loop {
                let parsed = Frame::parse(&self.recv_buf).map(|(frame, tail)| (frame, self.recv_buf.len() - tail.len()));
                let Some((frame, consumed)) = parsed else { break };
                self.recv_buf.drain(..consumed);
                if frame.opcode == Opcode::Close {
                    self.sub_plugins[route_idx].on_websocket_close();
                    self.done = true;
                    client.shutdown();
                    break;
                }
                if let Some(reply) = self.sub_plugins[route_idx].on_websocket_message(frame) {
                    client.queue(&reply.build());
                }
            }
            return None;
        }
        Some(raw.to_vec())
    }

    fn on_request_complete(&mut self, client: &mut BufferedConnection, request: &HttpMessage) -> Result<RequestOutcome, ProxyError> {
        if request.request.host.is_some() {
            return Ok(RequestOutcome::NotApplicable);
        }
        let path = request.request.path.split('?').next().unwrap_or(&request.request.path).to_string();

        if let Some(&idx) = self.websocket_routes.get(&path) {
            if !Self::is_upgrade_request(request) {
                client.queue(&crate::error::well_known::server_error_page(501, "Not Implemented"));
                self.done = true;
                return Ok(RequestOutcome::Teardown);
            }
            let Some(key) = request.headers.get("sec-websocket-key") else {
                client.queue(&crate::error::well_known::server_error_page(501, "Not Implemented"));
                self.done = true;
                return Ok(RequestOutcome::Teardown);
            };
            client.queue(&Self::handshake_response(key));
            self.websocket_route = Some(idx);
            self.sub_plugins[idx].on_websocket_open();
            return Ok(RequestOutcome::Continue);
        }

        let protocol = Self::protocol_for(client);
        if let Some(&idx) = self.routes.get(&protocol).and_then(|m| m.get(&path)) {
            let response = self.sub_plugins[idx].handle_request(request);
            client.queue(&response.build(&self.config.disabled_headers, self.config.server_recvbuf_size));
            let keep_alive = request
                .headers
                .get("connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(true);
            return Ok(if keep_alive { RequestOutcome::Continue } else { RequestOutcome::Teardown });
        }

        if self.config.enable_static_server {
            let response = self.serve_static(&path);
            client.queue(&response.build(&self.config.disabled_headers, self.config.server_recvbuf_size));
            return Ok(RequestOutcome::Continue);
        }

        client.queue(&not_found().build(&self.config.disabled_headers, self.config.server_recvbuf_size));
        Ok(RequestOutcome::Continue)
    }

    fn on_response_chunk(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        Some(chunk)
    }

    fn on_client_connection_close(&mut self) {
        if let Some(idx) = self.websocket_route {
            self.sub_plugins[idx].on_websocket_close();
        }
    }

    fn is_finished(&self) -> bool {
        self.done
    }
}

fn not_found() -> HttpMessage {
    let mut response = HttpMessage::response();
    response.version = "HTTP/1.1".to_string();
    response.response.code = 404;
    response.response.reason = "Not Found".to_string();
    response.headers.insert("Server", &crate::error::well_known::proxy_agent());
    response.headers.insert("Connection", "close");
    response.body = b"Not Found".to_vec();
    response.headers.insert("Content-Length", &response.body.len().to_string());
    response
}

fn guess_content_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_websocket_upgrade_headers() {
        let mut m = HttpMessage::request();
        m.feed(b"GET /ws HTTP/1.1\r\nHost: me\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n").unwrap();
        assert!(WebCorePlugin::is_upgrade_request(&m));
    }

    #[test]
    fn handshake_response_contains_computed_accept_key() {
        let resp = WebCorePlugin::handshake_response("dGhlIHNhbXBsZSBub25jZQ==");
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(text.starts_with("HTTP/1.1 101"));
    }

    #[test]
    fn guesses_common_content_types() {
        assert_eq!(guess_content_type(std::path::Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(guess_content_type(std::path::Path::new("a.bin")), "application/octet-stream");
    }
}
