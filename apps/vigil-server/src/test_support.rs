//! Shared fixtures for the async test suites: a minimal HTTP server and a
//! fully wired engine state on a scratch directory.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::engine::build_state;
use crate::notifier::Notifier;
use crate::tasks::TaskHandle;

pub(crate) struct TestServer {
    pub base: String,
    #[allow(dead_code)]
    pub requests: Arc<Mutex<Vec<String>>>,
    /// Requests served, excluding `/robots.txt`.
    pub hits: Arc<AtomicUsize>,
}

/// Minimal HTTP server: parses the request line, asks `respond` for
/// `(status, body)`, answers with `Connection: close`.
pub(crate) async fn spawn_server<F>(respond: F) -> TestServer
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Arc<Mutex<Vec<String>>> = Arc::default();
    let hits: Arc<AtomicUsize> = Arc::default();
    let seen = Arc::clone(&requests);
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let head = String::from_utf8_lossy(&buf[..n]).into_owned();
            let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
            seen.lock().unwrap().push(path.clone());
            if path != "/robots.txt" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            let (status, body) = respond(&path);
            let reason = if status < 400 { "OK" } else { "ERR" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
    TestServer {
        base: format!("http://{addr}"),
        requests,
        hits,
    }
}

pub(crate) struct TestHarness {
    pub state: AppState,
    /// Keeps the writer, drainer and cooldown tasks alive for the test.
    #[allow(dead_code)]
    pub tasks: Vec<TaskHandle>,
}

/// Wire a complete engine state on a scratch directory, applying `tweak` to
/// the test config first.
pub(crate) async fn harness_with<F>(
    dir: &Path,
    notifier: Arc<dyn Notifier>,
    tweak: F,
) -> TestHarness
where
    F: FnOnce(&mut EngineConfig),
{
    let mut config = EngineConfig::for_tests(dir);
    tweak(&mut config);
    let (state, tasks) = build_state(config, notifier).await.expect("build state");
    TestHarness { state, tasks }
}

/// A plausible article page that clears the thin-content block heuristic.
pub(crate) fn article_page(paragraph: &str) -> String {
    format!(
        "<html><head><title>Status board</title></head><body>\
         <article><h1>Daily digest</h1><p>{paragraph}</p>\
         <p>The remainder of this page stays identical between revisions so \
            the fixtures comfortably clear the minimum visible text rule.</p>\
         </article></body></html>"
    )
}
