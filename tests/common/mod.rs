//! Minimal in-process HTTP server for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferc_scraper::models::{Config, PacingConfig, ScraperMode};
use ferc_scraper::services::PageFetcher;
use ferc_scraper::utils::http::{RetryPolicy, build_client};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One canned response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    /// Send the body in pieces of this size with this pause before each
    pub pace: Option<(usize, Duration)>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            pace: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            pace: None,
        }
    }

    /// Trickle the body out `chunk` bytes at a time, `delay` apart.
    pub fn paced(mut self, chunk: usize, delay: Duration) -> Self {
        self.pace = Some((chunk, delay));
        self
    }
}

type Routes = HashMap<String, Vec<Reply>>;

/// Serves each path's replies in order, repeating the last one.
///
/// Query strings are ignored. Unknown paths answer `410 Gone`.
pub struct TestServer {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Vec<Reply>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Routes> = Arc::new(
            routes
                .into_iter()
                .map(|(path, replies)| (path.to_string(), replies))
                .collect(),
        );
        let hits = Arc::new(Mutex::new(HashMap::new()));

        let handle = tokio::spawn({
            let hits = Arc::clone(&hits);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    let hits = Arc::clone(&hits);
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, &routes, &hits).await;
                    });
                }
            }
        });

        Self { addr, hits, handle }
    }

    /// Absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Requests seen for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    routes: &Routes,
    hits: &Mutex<HashMap<String, usize>>,
) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&request);
    let target = head.split_whitespace().nth(1).unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/").to_string();

    let seen = {
        let mut hits = hits.lock().unwrap();
        let count = hits.entry(path.clone()).or_insert(0);
        *count += 1;
        *count - 1
    };

    let reply = match routes.get(&path) {
        Some(replies) if !replies.is_empty() => replies[seen.min(replies.len() - 1)].clone(),
        _ => Reply::status(410),
    };

    let header = format!(
        "HTTP/1.1 {} Test\r\nContent-Length: {}\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n",
        reply.status,
        reply.body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    match reply.pace {
        Some((chunk, delay)) => {
            for piece in reply.body.chunks(chunk.max(1)) {
                tokio::time::sleep(delay).await;
                stream.write_all(piece).await?;
                stream.flush().await?;
            }
        }
        None => stream.write_all(&reply.body).await?,
    }
    stream.shutdown().await
}

/// Fetcher with no jitter, no backoff and no browser fallback.
pub fn fast_fetcher(max_attempts: u32) -> PageFetcher {
    fetcher_with_timeout(max_attempts, Duration::from_secs(5))
}

/// Like [`fast_fetcher`] with a custom per-read timeout.
pub fn fetcher_with_timeout(max_attempts: u32, timeout: Duration) -> PageFetcher {
    PageFetcher::new(
        build_client(None, None).unwrap(),
        timeout,
        RetryPolicy::immediate(max_attempts),
    )
}

/// Config pointed at `base_url` with pacing disabled.
pub fn test_config(base_url: String, mode: ScraperMode) -> Config {
    let mut config = Config::default();
    config.scraper.base_url = base_url;
    config.scraper.mode = mode;
    config.scraper.render_fallback = false;
    config.pacing = PacingConfig::none();
    config.storage.create_tables = true;
    config
}
