//! End-to-end exercise of the connection engine: a fake upstream server, a
//! `Handler` wired with the real `ProxyCorePlugin`/`WebCorePlugin` pair, and
//! a plain TCP client driving it — all in-process, without the acceptor
//! pool's fork/FD-passing machinery (that part needs real separate
//! processes and isn't practical to drive from a single-process test).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use relayproxy::config::Config;
use relayproxy::handler::Handler;
use relayproxy::net::{BufferedConnection, Tag};
use relayproxy::plugins::{ProxyCorePlugin, WebCorePlugin};

fn spawn_fake_upstream() -> (std::net::SocketAddr, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /hello HTTP/1.1"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi")
            .unwrap();
    });
    (addr, handle)
}

/// Drives `handler.step()` in a background thread until the test's own
/// assertions are satisfied or a generous deadline passes.
fn run_handler_in_background(handler: Handler) -> thread::JoinHandle<()> {
    thread::spawn(move || handler.run())
}

#[test]
fn relays_a_plain_http_request_to_the_upstream_and_back() {
    let (upstream_addr, upstream) = spawn_fake_upstream();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let config = Arc::new(Config::new());
    let plugins: Vec<Box<dyn relayproxy::plugins::ConnectionPlugin>> = vec![
        Box::new(ProxyCorePlugin::new(Arc::clone(&config), None, Vec::new())),
        Box::new(WebCorePlugin::new(config, Vec::new())),
    ];

    let accept_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let conn = BufferedConnection::plain(Tag::Client, stream).unwrap();
        let handler = Handler::new("test-peer".to_string(), conn, plugins, Duration::from_secs(2));
        run_handler_in_background(handler).join().unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    let request = format!(
        "GET http://{upstream_addr}/hello HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).unwrap();

    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("hi"));

    upstream.join().unwrap();
    accept_thread.join().unwrap();
}

#[test]
fn relays_bytes_both_ways_through_a_connect_tunnel() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream = thread::spawn(move || {
        let (mut stream, _) = upstream_listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        stream.write_all(b"pong").unwrap();
    });

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let config = Arc::new(Config::new());
    let plugins: Vec<Box<dyn relayproxy::plugins::ConnectionPlugin>> = vec![
        Box::new(ProxyCorePlugin::new(Arc::clone(&config), None, Vec::new())),
        Box::new(WebCorePlugin::new(config, Vec::new())),
    ];

    let accept_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let conn = BufferedConnection::plain(Tag::Client, stream).unwrap();
        let handler = Handler::new("test-peer".to_string(), conn, plugins, Duration::from_secs(2));
        run_handler_in_background(handler).join().unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let connect_request = format!("CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n");
    client.write_all(connect_request.as_bytes()).unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).unwrap();
    assert_eq!(&established, b"HTTP/1.1 200 Connection established\r\n\r\n");

    client.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");

    drop(client);
    upstream.join().unwrap();
    accept_thread.join().unwrap();
}

#[test]
fn returns_407_when_proxy_authentication_is_required_and_missing() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let config = Arc::new(Config::new().with_auth_code("dXNlcjpwYXNz".to_string()));
    let plugins: Vec<Box<dyn relayproxy::plugins::ConnectionPlugin>> = vec![
        Box::new(ProxyCorePlugin::new(Arc::clone(&config), None, Vec::new())),
        Box::new(WebCorePlugin::new(config, Vec::new())),
    ];

    let accept_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let conn = BufferedConnection::plain(Tag::Client, stream).unwrap();
        let handler = Handler::new("test-peer".to_string(), conn, plugins, Duration::from_secs(2));
        run_handler_in_background(handler).join().unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client
        .write_all(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .unwrap();

    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required"));

    accept_thread.join().unwrap();
}
