//! Immutable per-process configuration (spec §3, §6).
//!
//! A generalization of the teacher's `ServerConfig`
//! (`webserver::server_config::ServerConfig`), which is a builder-style
//! struct (`host`, `port`, `using_https`, `tls_config`, `base_domain`) built
//! up with consuming `self -> Self` setters. This carries the larger field
//! set the proxy needs (CA material, timeouts, disabled headers, the
//! threaded/threadless switch) but keeps the same builder shape.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cert::CaMaterial;

/// TLS material for terminating TLS on the client-facing socket.
#[derive(Clone, Debug)]
pub struct ServerTls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// All state a worker process needs and never mutates after startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub hostname: IpAddr,
    pub port: u16,
    pub backlog: i32,
    pub num_workers: usize,
    pub threadless: bool,

    pub client_timeout: Duration,
    pub client_recvbuf_size: usize,
    pub server_recvbuf_size: usize,

    pub server_tls: Option<ServerTls>,
    pub ca_material: Option<CaMaterial>,

    pub auth_code: Option<String>,
    pub disabled_headers: HashSet<String>,

    pub enable_web_server: bool,
    pub enable_static_server: bool,
    pub static_server_dir: Option<PathBuf>,

    pub enable_devtools: bool,
    pub devtools_ws_path: String,

    pub pid_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".parse().unwrap(),
            port: 8899,
            backlog: 100,
            num_workers: 1,
            threadless: false,
            client_timeout: Duration::from_secs(10),
            client_recvbuf_size: 8192,
            server_recvbuf_size: 8192,
            server_tls: None,
            ca_material: None,
            auth_code: None,
            disabled_headers: HashSet::new(),
            enable_web_server: false,
            enable_static_server: false,
            static_server_dir: None,
            enable_devtools: false,
            devtools_ws_path: "/devtools".to_string(),
            pid_file: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen(mut self, hostname: IpAddr, port: u16) -> Self {
        self.hostname = hostname;
        self.port = port;
        self
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.max(1);
        self
    }

    pub fn with_threadless(mut self, threadless: bool) -> Self {
        self.threadless = threadless;
        self
    }

    pub fn with_server_tls(mut self, cert_file: PathBuf, key_file: PathBuf) -> Self {
        self.server_tls = Some(ServerTls { cert_file, key_file });
        self
    }

    pub fn with_ca_material(mut self, material: CaMaterial) -> Self {
        self.ca_material = Some(material);
        self
    }

    pub fn with_auth_code(mut self, auth_code: String) -> Self {
        self.auth_code = Some(auth_code);
        self
    }

    pub fn with_disabled_headers(mut self, headers: impl IntoIterator<Item = String>) -> Self {
        self.disabled_headers = headers.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_static_server(mut self, dir: PathBuf) -> Self {
        self.enable_web_server = true;
        self.enable_static_server = true;
        self.static_server_dir = Some(dir);
        self
    }

    pub fn with_devtools(mut self, ws_path: String) -> Self {
        self.enable_devtools = true;
        self.devtools_ws_path = ws_path;
        self
    }

    pub fn tls_interception_enabled(&self) -> bool {
        self.ca_material.is_some()
    }

    /// Minimal `--flag value` CLI parser over the flags named in spec §6.
    /// Unknown flags are ignored; this is a collaborator per the spec's
    /// explicit non-goals, kept only so the binary entry point is runnable.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut config = Self::default();
        let mut it = args.into_iter().peekable();
        while let Some(flag) = it.next() {
            let value = || it.next().unwrap_or_default();
            match flag.as_str() {
                "--hostname" => {
                    if let Ok(addr) = value().parse() {
                        config.hostname = addr;
                    }
                }
                "--port" => {
                    if let Ok(p) = value().parse() {
                        config.port = p;
                    }
                }
                "--backlog" => {
                    if let Ok(b) = value().parse() {
                        config.backlog = b;
                    }
                }
                "--num-workers" => {
                    if let Ok(n) = value().parse() {
                        config.num_workers = n;
                    }
                }
                "--threadless" => config.threadless = true,
                "--timeout" => {
                    if let Ok(secs) = value().parse() {
                        config.client_timeout = Duration::from_secs(secs);
                    }
                }
                "--client-recvbuf-size" => {
                    if let Ok(n) = value().parse() {
                        config.client_recvbuf_size = n;
                    }
                }
                "--server-recvbuf-size" => {
                    if let Ok(n) = value().parse() {
                        config.server_recvbuf_size = n;
                    }
                }
                "--basic-auth" => config.auth_code = Some(value()),
                "--disable-headers" => {
                    config.disabled_headers =
                        value().split(',').filter(|s| !s.is_empty()).map(|s| s.to_ascii_lowercase()).collect();
                }
                "--cert-file" => {
                    let cert = PathBuf::from(value());
                    config.server_tls.get_or_insert(ServerTls { cert_file: cert.clone(), key_file: cert }).cert_file = cert;
                }
                "--key-file" => {
                    let key = PathBuf::from(value());
                    config
                        .server_tls
                        .get_or_insert(ServerTls { cert_file: key.clone(), key_file: key.clone() })
                        .key_file = key;
                }
                "--ca-cert-file" | "--ca-key-file" | "--ca-signing-key-file" | "--ca-cert-dir" => {
                    let v = PathBuf::from(value());
                    let material = config.ca_material.get_or_insert(CaMaterial {
                        ca_cert_dir: PathBuf::new(),
                        ca_signing_key_file: PathBuf::new(),
                        ca_cert_file: PathBuf::new(),
                        ca_key_file: PathBuf::new(),
                    });
                    match flag.as_str() {
                        "--ca-cert-file" => material.ca_cert_file = v,
                        "--ca-key-file" => material.ca_key_file = v,
                        "--ca-signing-key-file" => material.ca_signing_key_file = v,
                        "--ca-cert-dir" => material.ca_cert_dir = v,
                        _ => unreachable!(),
                    }
                }
                "--enable-web-server" => config.enable_web_server = true,
                "--enable-static-server" => config.enable_static_server = true,
                "--static-server-dir" => config.static_server_dir = Some(PathBuf::from(value())),
                "--enable-devtools" => config.enable_devtools = true,
                "--devtools-ws-path" => config.devtools_ws_path = value(),
                "--pid-file" => config.pid_file = Some(PathBuf::from(value())),
                _ => {}
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_loopback_with_no_tls() {
        let c = Config::default();
        assert_eq!(c.port, 8899);
        assert!(!c.tls_interception_enabled());
    }

    #[test]
    fn from_args_parses_port_and_threadless() {
        let c = Config::from_args(
            ["--port", "9000", "--threadless"].into_iter().map(str::to_string),
        );
        assert_eq!(c.port, 9000);
        assert!(c.threadless);
    }

    #[test]
    fn from_args_lowercases_disabled_headers() {
        let c = Config::from_args(
            ["--disable-headers", "X-Forwarded-For,Cookie"].into_iter().map(str::to_string),
        );
        assert!(c.disabled_headers.contains("x-forwarded-for"));
        assert!(c.disabled_headers.contains("cookie"));
    }
}
