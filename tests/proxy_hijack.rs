//! Transparent proxy end to end over cleartext HTTP.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{eventually, loopback_dialer, start_echo_backend, test_config};
use rawhttp::config::ProxyMode;
use rawhttp::net::Listener;
use rawhttp::normalize::message::set_header;
use rawhttp::normalize::reader::read_response;
use rawhttp::proxy::InterceptedExchange;
use rawhttp::{EngineConfig, Hooks, Shutdown, TransparentProxy};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy(config: EngineConfig, hooks: Hooks) -> (SocketAddr, Shutdown) {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let listener = Listener::from_tcp(tcp, 64);
    let proxy = Arc::new(
        TransparentProxy::new(Arc::new(config), Arc::new(loopback_dialer())).with_hooks(hooks),
    );
    let shutdown = Shutdown::new();
    tokio::spawn(proxy.run(listener, shutdown.clone()));
    (addr, shutdown)
}

async fn exchange(stream: &mut BufReader<TcpStream>, request: &[u8]) -> String {
    stream.get_mut().write_all(request).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), read_response(stream, "GET"))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response.raw).into_owned()
}

#[tokio::test]
async fn hijack_rewrites_request_and_mirrors_original() {
    let backend = start_echo_backend().await;
    let mut config = test_config();
    config.proxy.mode = ProxyMode::Hijack;
    config.proxy.default_http_port = backend.addr.port();

    let mirrored: Arc<Mutex<Vec<InterceptedExchange>>> = Arc::default();
    let hooks = {
        let mirrored = mirrored.clone();
        Hooks::new()
            .on_request(|_, raw| set_header(raw, "X-Test", "1"))
            .mirror(move |exchange| mirrored.lock().unwrap().push(exchange.clone()))
    };
    let (proxy, shutdown) = start_proxy(config, hooks).await;

    let mut client = BufReader::new(TcpStream::connect(proxy).await.unwrap());
    let request = b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let response = exchange(&mut client, request).await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("X-Test: 1"), "{response}");

    let mirrored_once = eventually(Duration::from_secs(2), || {
        let mirrored = mirrored.clone();
        async move { mirrored.lock().unwrap().len() == 1 }
    })
    .await;
    assert!(mirrored_once);
    let seen = mirrored.lock().unwrap()[0].clone();
    assert_eq!(seen.request, request);
    assert!(!seen.is_https);
    assert!(seen.hijacked);

    // The connection stays open for a second exchange.
    let second = exchange(&mut client, b"GET /again HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    assert!(second.contains("GET /again"), "{second}");
    assert_eq!(backend.accepted(), 1);
    shutdown.trigger();
}

#[tokio::test]
async fn request_for_proxy_itself_gets_fallback_page() {
    let backend = start_echo_backend().await;
    let mut config = test_config();
    config.proxy.mode = ProxyMode::Hijack;
    config.proxy.fallback_body = "<h1>proxy</h1>".to_string();
    let (proxy, shutdown) = start_proxy(config, Hooks::new()).await;

    let mut client = BufReader::new(TcpStream::connect(proxy).await.unwrap());
    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", proxy.port());
    let response = exchange(&mut client, request.as_bytes()).await;

    assert!(response.ends_with("<h1>proxy</h1>"), "{response}");
    assert!(response.contains("Connection: close"));
    assert_eq!(backend.accepted(), 0);
    shutdown.trigger();
}

#[tokio::test]
async fn forward_mode_splices_bytes_unchanged() {
    let backend = start_echo_backend().await;
    let mut config = test_config();
    config.proxy.mode = ProxyMode::Forward;
    config.proxy.default_http_port = backend.addr.port();
    let touched = Arc::new(Mutex::new(0usize));
    let hooks = {
        let touched = touched.clone();
        Hooks::new().on_request(move |_, raw| {
            *touched.lock().unwrap() += 1;
            raw.to_vec()
        })
    };
    let (proxy, shutdown) = start_proxy(config, hooks).await;

    let mut client = BufReader::new(TcpStream::connect(proxy).await.unwrap());
    let first = exchange(&mut client, b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    let second = exchange(&mut client, b"GET /b HTTP/1.1\r\nHost: example.com\r\n\r\n").await;

    assert!(first.contains("GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n"));
    assert!(second.contains("GET /b"));
    assert_eq!(*touched.lock().unwrap(), 0);
    shutdown.trigger();
}
