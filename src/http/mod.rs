//! HTTP front end
//!
//! Routes:
//! - `GET /status` - [`SessionStatus`] as JSON
//! - `GET /ls` - [`LsInfo`] as JSON
//! - `GET /files/` - HTML listing of the torrent's files
//! - `GET /files/<name>` - file content, `Range` aware
//! - `GET /get/<index>` - file content by index
//! - `GET /shutdown` - ask the session to stop
//!
//! File content goes through [`serve::serve_content`], backed by the virtual
//! file system, so partial content works while the download is in progress.

pub mod range;
pub mod serve;

pub use range::{ByteRange, RangeRequest};
pub use serve::{serve_content, ContentSource};

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Result, StreamError};
use crate::status::{LsInfo, SessionStatus};
use crate::vfs::TorrentFs;

/// How long `stop` waits for in-flight responses
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Entries fetched per `readdir` call when rendering `/files/`
const LISTING_BATCH: usize = 64;

/// What the HTTP handlers need from the session
pub trait StreamBackend: Send + Sync + 'static {
    fn status(&self) -> SessionStatus;

    fn ls(&self) -> LsInfo;

    /// The virtual file system, once the torrent is added
    fn torrent_fs(&self) -> Option<Arc<TorrentFs>>;

    /// Ask the lifecycle loop to shut down
    fn request_stop(&self);
}

type SharedBackend = Arc<dyn StreamBackend>;

/// Build the router over `backend`
pub fn router(backend: SharedBackend) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/ls", get(ls))
        .route("/files/", get(list_files))
        .route("/files/*name", get(serve_file))
        .route("/get/:index", get(serve_index))
        .route("/shutdown", get(shutdown))
        .with_state(backend)
}

fn json_response<T: Serialize>(value: &T) -> Response {
    match serde_json::to_string_pretty(value) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => serve::error_response(&StreamError::from(e)),
    }
}

async fn status(State(backend): State<SharedBackend>) -> Response {
    json_response(&backend.status())
}

async fn ls(State(backend): State<SharedBackend>) -> Response {
    json_response(&backend.ls())
}

async fn shutdown(State(backend): State<SharedBackend>) -> &'static str {
    tracing::debug!("Shutdown requested over HTTP");
    backend.request_stop();
    "OK"
}

fn require_fs(backend: &SharedBackend) -> Result<Arc<TorrentFs>> {
    backend
        .torrent_fs()
        .ok_or_else(|| StreamError::NotFound("no torrent".to_string()))
}

async fn serve_file(
    State(backend): State<SharedBackend>,
    UrlPath(name): UrlPath<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let opened = require_fs(&backend).and_then(|fs| fs.open(&name));
    match opened {
        Ok(file) => {
            tracing::debug!(seq = file.seq(), file = %file.name(), "Serving file");
            serve_content(&method, &headers, file)
        }
        Err(e) => {
            tracing::debug!(name = %name, "Cannot serve file: {}", e);
            serve::error_response(&e)
        }
    }
}

async fn serve_index(
    State(backend): State<SharedBackend>,
    UrlPath(index): UrlPath<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Ok(index) = index.parse::<usize>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let opened = require_fs(&backend).and_then(|fs| fs.open_index(index));
    match opened {
        Ok(file) => {
            tracing::debug!(seq = file.seq(), index, file = %file.name(), "Serving file");
            serve_content(&method, &headers, file)
        }
        Err(e) => {
            tracing::debug!(index, "Cannot serve file: {}", e);
            serve::error_response(&e)
        }
    }
}

async fn list_files(State(backend): State<SharedBackend>) -> Response {
    let listing = require_fs(&backend).and_then(|fs| {
        let mut dir = fs.open_dir()?;
        let mut names = Vec::new();
        loop {
            let batch = dir.readdir(LISTING_BATCH)?;
            if batch.is_empty() {
                break;
            }
            names.extend(batch.into_iter().map(|f| f.name().to_string()));
        }
        Ok(names)
    });
    match listing {
        Ok(names) => Html(render_listing(&names)).into_response(),
        Err(e) => serve::error_response(&e),
    }
}

/// `<pre>` list of links relative to `/files/`
fn render_listing(names: &[String]) -> String {
    let mut html = String::from("<pre>\n");
    for name in names {
        let _ = writeln!(
            html,
            "<a href=\"{}\">{}</a>",
            escape_html(&relative_href(name)),
            escape_html(name)
        );
    }
    html.push_str("</pre>\n");
    html
}

fn relative_href(name: &str) -> String {
    let Ok(mut url) = Url::parse("http://listing/") else {
        return String::new();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().extend(name.split('/'));
    }
    url.path().trim_start_matches('/').to_string()
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Resolve `host:port`, taking the first IPv4 address when there is one.
///
/// `localhost` often resolves to `::1` first; clients of this server
/// expect `127.0.0.1`.
pub async fn resolve_bind_addr(addr: &str) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| StreamError::Http(format!("cannot resolve {}: {}", addr, e)))?
        .collect();
    candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| StreamError::Http(format!("{} resolved to no address", addr)))
}

/// A bound HTTP listener serving [`router`]
pub struct HttpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    /// Bind `addr` (`host:port`) and start serving in the background
    pub async fn bind(addr: &str, backend: SharedBackend) -> Result<Self> {
        let target = resolve_bind_addr(addr).await?;
        let listener = TcpListener::bind(target)
            .await
            .map_err(|e| StreamError::Http(format!("failed to bind {}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| StreamError::Http(format!("no local address for {}: {}", addr, e)))?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let app = router(backend);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("HTTP server failed: {}", e);
            }
        });

        tracing::info!(addr = %local, "HTTP server listening");
        Ok(Self {
            addr: local,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop accepting connections and wait for in-flight responses.
    ///
    /// Returns false if the server was already stopped.
    pub async fn stop(&self) -> bool {
        let Some(mut task) = self.task.lock().take() else {
            return false;
        };
        tracing::debug!(addr = %self.addr, "Stopping HTTP server");
        self.shutdown.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("HTTP server did not stop within {:?}, aborting", STOP_TIMEOUT);
            task.abort();
        }
        true
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_bind_addr_prefers_ipv4() {
        let addr = resolve_bind_addr("localhost:5001").await.unwrap();
        assert!(addr.is_ipv4(), "got {}", addr);
        assert_eq!(addr.port(), 5001);

        let v6 = resolve_bind_addr("[::1]:0").await.unwrap();
        assert!(v6.is_ipv6());

        assert!(matches!(
            resolve_bind_addr("no port here").await,
            Err(StreamError::Http(_))
        ));
    }

    #[test]
    fn test_render_listing() {
        let html = render_listing(&["Show/e 01.mkv".to_string(), "a&b.srt".to_string()]);
        assert!(html.contains("<a href=\"Show/e%2001.mkv\">Show/e 01.mkv</a>"));
        assert!(html.contains("<a href=\"a&amp;b.srt\">a&amp;b.srt</a>"));
        assert!(html.starts_with("<pre>\n"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<x \"y\">"), "&lt;x &#34;y&#34;&gt;");
    }
}
