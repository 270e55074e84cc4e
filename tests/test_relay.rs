//! End-to-end tests: caller → exposed socket → target socket

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use veil::http::connection::Connection;
use veil::http::parser::parse_http_request;
use veil::http::request::{Method, Request};
use veil::proxy::{Dispatcher, RelayClient};
use veil::rules::{RoutingMode, RuleTable};
use veil::server::listener;

const OK_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}";

const UNAUTHORIZED: &str =
    r#"{"type":"error","status-code":401,"status":"Unauthorized","result":{"message":"access denied"}}"#;
const BAD_REQUEST: &str =
    r#"{"type":"error","status-code":400,"status":"Invalid Request","result":{"message":"bad request"}}"#;
const NOT_FOUND: &str =
    r#"{"type":"error","status-code":404,"status":"Not Found","result":{"message":"not found"}}"#;
const TIMED_OUT: &str =
    r#"{"type":"error","status-code":408,"status":"Request Timeout","result":{"message":"request timed out"}}"#;

/// Fake target socket recording every request it receives.
struct Backend {
    path: PathBuf,
    hits: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Request>>>,
}

fn spawn_backend(dir: &Path, response: &'static [u8]) -> Backend {
    let path = dir.join("target.sock");
    let socket = UnixListener::bind(&path).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));

    let (task_hits, task_received) = (Arc::clone(&hits), Arc::clone(&received));
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = socket.accept().await.unwrap();
            task_hits.fetch_add(1, Ordering::SeqCst);

            let mut buffer = Vec::new();
            let request = loop {
                if let Ok((request, _)) = parse_http_request(&buffer) {
                    break request;
                }
                let mut chunk = [0u8; 1024];
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "proxy closed before sending a full request");
                buffer.extend_from_slice(&chunk[..n]);
            };
            task_received.lock().unwrap().push(request);

            stream.write_all(response).await.unwrap();
            stream.shutdown().await.unwrap();
        }
    });

    Backend {
        path,
        hits,
        received,
    }
}

/// Fake target socket that accepts connections and never answers.
fn spawn_silent_backend(dir: &Path) -> PathBuf {
    let path = dir.join("silent.sock");
    let socket = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = socket.accept().await.unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(stream);
            });
        }
    });

    path
}

/// Fake target socket that writes `reply` and then holds the connection open.
fn spawn_stalling_backend(dir: &Path, reply: Vec<u8>) -> PathBuf {
    let path = dir.join("stalling.sock");
    let socket = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = socket.accept().await.unwrap();
            let reply = reply.clone();
            tokio::spawn(async move {
                let _ = stream.write_all(&reply).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(stream);
            });
        }
    });

    path
}

fn dispatcher(
    rules: &[&str],
    routing: RoutingMode,
    target: &Path,
    timeout: Duration,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        RuleTable::compile(rules),
        routing,
        RelayClient::new(target, timeout),
    ))
}

/// Starts the proxy on `<dir>/exposed.sock`.
fn spawn_proxy(dir: &Path, dispatcher: Arc<Dispatcher>) -> PathBuf {
    let exposed = dir.join("exposed.sock");
    let socket = listener::bind(&exposed).unwrap();
    tokio::spawn(listener::run(socket, dispatcher));
    exposed
}

async fn roundtrip(exposed: &Path, raw: &[u8]) -> String {
    let mut stream = UnixStream::connect(exposed).await.unwrap();
    stream.write_all(raw).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

/// Runs a single connection over an in-memory stream.
fn spawn_connection(dispatcher: Arc<Dispatcher>) -> tokio::io::DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut conn = Connection::new(server, dispatcher);
        conn.run().await
    });
    client
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}

#[tokio::test]
async fn test_allowlist_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/status"],
            RoutingMode::Method,
            &backend.path,
            Duration::from_secs(5),
        ),
    );

    let relayed = roundtrip(&exposed, b"GET /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert_eq!(relayed.as_bytes(), OK_RESPONSE);

    let other = roundtrip(&exposed, b"GET /other HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(other.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert_eq!(body_of(&other), UNAUTHORIZED);

    let post = roundtrip(
        &exposed,
        b"POST /status HTTP/1.1\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(body_of(&post), UNAUTHORIZED);

    let options =
        roundtrip(&exposed, b"OPTIONS /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(options.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(body_of(&options), BAD_REQUEST);

    // Only the allowed request reached the backend.
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_method_regardless_of_rules() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["OPTIONS~/status", "HEAD~/status"],
            RoutingMode::Method,
            &backend.path,
            Duration::from_secs(5),
        ),
    );

    for raw in [
        &b"OPTIONS /status HTTP/1.1\r\nConnection: close\r\n\r\n"[..],
        &b"HEAD /status HTTP/1.1\r\nConnection: close\r\n\r\n"[..],
        &b"BREW /status HTTP/1.1\r\nConnection: close\r\n\r\n"[..],
    ] {
        assert_eq!(body_of(&roundtrip(&exposed, raw).await), BAD_REQUEST);
    }
    assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_forwards_method_target_and_body() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(
        dir.path(),
        b"HTTP/1.1 201 Created\r\nX-Backend: yes\r\nContent-Length: 2\r\n\r\nok",
    );
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["POST~/jobs"],
            RoutingMode::Method,
            &backend.path,
            Duration::from_secs(5),
        ),
    );

    let response = roundtrip(
        &exposed,
        b"POST /jobs?priority=high HTTP/1.1\r\nHost: caller\r\nContent-Type: text/plain\r\n\
          Connection: close\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwork\r\n0\r\n\r\n",
    )
    .await;
    assert_eq!(
        response,
        "HTTP/1.1 201 Created\r\nX-Backend: yes\r\nContent-Length: 2\r\n\r\nok"
    );

    let received = backend.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let forwarded = &received[0];
    assert_eq!(forwarded.method, Method::POST);
    assert_eq!(forwarded.path, "/jobs?priority=high");
    assert_eq!(forwarded.body, b"work".to_vec());
    assert_eq!(forwarded.header("Host"), Some("unix"));
    assert_eq!(forwarded.header("Content-Type"), Some("text/plain"));
    assert_eq!(forwarded.header("Transfer-Encoding"), None);
}

#[tokio::test]
async fn test_silent_backend_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let target = spawn_silent_backend(dir.path());
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/status"],
            RoutingMode::Method,
            &target,
            Duration::from_millis(300),
        ),
    );

    let started = Instant::now();
    let response = roundtrip(&exposed, b"GET /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    let elapsed = started.elapsed();

    assert!(response.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
    assert_eq!(body_of(&response), TIMED_OUT);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_missing_target_socket() {
    let dir = tempfile::tempdir().unwrap();
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/status"],
            RoutingMode::Method,
            &dir.path().join("absent.sock"),
            Duration::from_secs(5),
        ),
    );

    let started = Instant::now();
    let response = roundtrip(&exposed, b"GET /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;

    assert_eq!(body_of(&response), TIMED_OUT);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_path_routing_mode() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/status"],
            RoutingMode::Path,
            &backend.path,
            Duration::from_secs(5),
        ),
    );

    let unknown = roundtrip(&exposed, b"GET /unknown HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(unknown.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body_of(&unknown), NOT_FOUND);

    let wrong_method =
        roundtrip(&exposed, b"DELETE /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert_eq!(body_of(&wrong_method), UNAUTHORIZED);

    let allowed = roundtrip(&exposed, b"GET /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert_eq!(allowed.as_bytes(), OK_RESPONSE);
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rebind_replaces_stale_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let exposed = dir.path().join("exposed.sock");
    std::fs::write(&exposed, b"stale").unwrap();

    let socket = listener::bind(&exposed).unwrap();
    drop(socket);
    listener::cleanup(&exposed);

    assert!(!exposed.exists());
}

#[tokio::test]
async fn test_keep_alive_connection_handles_pipelined_requests() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let dispatcher = dispatcher(
        &["GET~/status"],
        RoutingMode::Method,
        &backend.path,
        Duration::from_secs(5),
    );

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let conn = tokio::spawn(async move {
        let mut conn = Connection::new(server, dispatcher);
        conn.run().await
    });

    client
        .write_all(b"GET /other HTTP/1.1\r\n\r\nGET /status HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut output = Vec::new();
    client.read_to_end(&mut output).await.unwrap();
    let output = String::from_utf8(output).unwrap();

    let (denied, relayed) = output.split_once("HTTP/1.1 200 OK").unwrap();
    assert!(denied.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert!(denied.ends_with(UNAUTHORIZED));
    assert!(relayed.ends_with("{\"ok\":true}"));

    conn.await.unwrap().unwrap();
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_request_gets_bad_request_and_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut client = spawn_connection(dispatcher(
        &["GET~/status"],
        RoutingMode::Method,
        &dir.path().join("unused.sock"),
        Duration::from_secs(5),
    ));

    client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

    let mut output = Vec::new();
    client.read_to_end(&mut output).await.unwrap();
    let output = String::from_utf8(output).unwrap();

    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(output.contains("Connection: close\r\n"));
    assert_eq!(body_of(&output), BAD_REQUEST);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_table() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/status"],
            RoutingMode::Method,
            &backend.path,
            Duration::from_secs(5),
        ),
    );

    let mut tasks = Vec::new();
    for i in 0..16 {
        let exposed = exposed.clone();
        tasks.push(tokio::spawn(async move {
            let raw = if i % 2 == 0 {
                &b"GET /status HTTP/1.1\r\nConnection: close\r\n\r\n"[..]
            } else {
                &b"GET /secret HTTP/1.1\r\nConnection: close\r\n\r\n"[..]
            };
            (i, roundtrip(&exposed, raw).await)
        }));
    }

    for task in tasks {
        let (i, response) = task.await.unwrap();
        if i % 2 == 0 {
            assert_eq!(response.as_bytes(), OK_RESPONSE);
        } else {
            assert_eq!(body_of(&response), UNAUTHORIZED);
        }
    }
    assert_eq!(backend.hits.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_oversized_body_is_refused_from_its_head() {
    let dir = tempfile::tempdir().unwrap();
    let mut client = spawn_connection(dispatcher(
        &["POST~/upload"],
        RoutingMode::Method,
        &dir.path().join("unused.sock"),
        Duration::from_secs(5),
    ));

    let mut raw = b"POST /upload HTTP/1.1\r\nContent-Length: 1000000000000\r\n\r\n".to_vec();
    raw.resize(raw.len() + 4096, b'x');
    client.write_all(&raw).await.unwrap();

    let mut output = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut output))
        .await
        .expect("connection kept reading the body")
        .unwrap();
    let output = String::from_utf8(output).unwrap();

    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(output.contains("Connection: close\r\n"));
    assert_eq!(body_of(&output), BAD_REQUEST);
}

#[tokio::test]
async fn test_denied_request_is_refused_before_its_body() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let mut client = spawn_connection(dispatcher(
        &["GET~/status"],
        RoutingMode::Method,
        &backend.path,
        Duration::from_secs(5),
    ));

    // Head plus the first KiB of a 1 MiB body.
    let mut raw = b"POST /denied HTTP/1.1\r\nContent-Length: 1048576\r\n\r\n".to_vec();
    raw.resize(raw.len() + 1024, b'x');
    client.write_all(&raw).await.unwrap();

    let mut output = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut output))
        .await
        .expect("denied request waited for its body")
        .unwrap();
    let output = String::from_utf8(output).unwrap();

    assert!(output.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert!(output.contains("Connection: close\r\n"));
    assert_eq!(body_of(&output), UNAUTHORIZED);
    assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_allowed_request_waits_for_late_body() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["POST~/upload"],
            RoutingMode::Method,
            &backend.path,
            Duration::from_secs(5),
        ),
    );

    let mut stream = UnixStream::connect(&exposed).await.unwrap();
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nConnection: close\r\nContent-Length: 10\r\n\r\nfirst")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(b"-half").await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    assert_eq!(response, OK_RESPONSE);
    let received = backend.received.lock().unwrap();
    assert_eq!(received[0].body, b"first-half".to_vec());
}

#[tokio::test]
async fn test_repeated_headers_reach_backend_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), OK_RESPONSE);
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/s"],
            RoutingMode::Method,
            &backend.path,
            Duration::from_secs(5),
        ),
    );

    let response = roundtrip(
        &exposed,
        b"GET /s HTTP/1.1\r\nX-Tag: one\r\nConnection: close\r\nX-Tag: two\r\n\r\n",
    )
    .await;
    assert_eq!(response.as_bytes(), OK_RESPONSE);

    let received = backend.received.lock().unwrap();
    let tags: Vec<&str> = received[0]
        .headers
        .iter()
        .filter(|(k, _)| k == "X-Tag")
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(tags, ["one", "two"]);
}

#[tokio::test]
async fn test_unframed_response_streams_to_eof_and_closes() {
    const UNFRAMED: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstreamed until close";

    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(dir.path(), UNFRAMED);
    let mut client = spawn_connection(dispatcher(
        &["GET~/logs"],
        RoutingMode::Method,
        &backend.path,
        Duration::from_secs(5),
    ));

    // Keep-alive request; the proxy still has to close afterwards.
    client.write_all(b"GET /logs HTTP/1.1\r\n\r\n").await.unwrap();

    let mut output = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut output))
        .await
        .expect("client connection left open after unframed body")
        .unwrap();

    assert_eq!(output, UNFRAMED);
}

#[tokio::test]
async fn test_deadline_after_head_aborts_without_second_response() {
    const PARTIAL: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial";

    let dir = tempfile::tempdir().unwrap();
    let target = spawn_stalling_backend(dir.path(), PARTIAL.to_vec());
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/status"],
            RoutingMode::Method,
            &target,
            Duration::from_millis(300),
        ),
    );

    let started = Instant::now();
    let response = roundtrip(&exposed, b"GET /status HTTP/1.1\r\n\r\n").await;

    assert_eq!(response.as_bytes(), PARTIAL);
    assert!(!response.contains("408"));
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_oversized_upstream_head_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut reply = b"HTTP/1.1 200 OK\r\nX-Fill: ".to_vec();
    reply.resize(reply.len() + 70 * 1024, b'a');
    let target = spawn_stalling_backend(dir.path(), reply);
    let exposed = spawn_proxy(
        dir.path(),
        dispatcher(
            &["GET~/status"],
            RoutingMode::Method,
            &target,
            Duration::from_secs(5),
        ),
    );

    let started = Instant::now();
    let response = roundtrip(&exposed, b"GET /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
    assert_eq!(body_of(&response), TIMED_OUT);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_serve_until_removes_socket_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let exposed = dir.path().join("exposed.sock");
    let socket = listener::bind(&exposed).unwrap();
    let dispatcher = dispatcher(
        &[],
        RoutingMode::Method,
        &dir.path().join("unused.sock"),
        Duration::from_secs(5),
    );

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let path = exposed.clone();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = stopped.await;
        };
        listener::serve_until(socket, &path, dispatcher, shutdown).await
    });

    let denied = roundtrip(&exposed, b"GET /status HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert_eq!(body_of(&denied), UNAUTHORIZED);

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
    assert!(!exposed.exists());
}
