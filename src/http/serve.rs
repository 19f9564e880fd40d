//! Range-aware content serving
//!
//! [`serve_content`] answers `GET` and `HEAD` for anything that can report its
//! size and be read sequentially after a seek. The body is streamed chunk by
//! chunk, so a source whose reads block until data arrives produces a response
//! that simply stays pending.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;

use super::range::{self, RangeRequest};
use crate::error::{Result, StreamError};
use crate::vfs::VirtualFile;

/// Largest chunk handed to the body stream at once
const MAX_CHUNK: usize = 1024 * 1024;

/// Something [`serve_content`] can stream
pub trait ContentSource: Send + 'static {
    /// Name used to guess the content type
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    fn modified(&self) -> Option<DateTime<Utc>>;

    /// Preferred read size
    fn chunk_size(&self) -> usize {
        64 * 1024
    }

    fn seek_to(&mut self, position: u64) -> Result<u64>;

    /// Read at the cursor; 0 means no more data will come
    fn read_chunk(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;
}

impl ContentSource for VirtualFile {
    fn name(&self) -> &str {
        VirtualFile::name(self)
    }

    fn size(&self) -> u64 {
        VirtualFile::size(self)
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        self.mod_time()
    }

    /// One piece per read
    fn chunk_size(&self) -> usize {
        usize::try_from(self.piece_length()).unwrap_or(MAX_CHUNK)
    }

    fn seek_to(&mut self, position: u64) -> Result<u64> {
        self.seek(SeekFrom::Start(position))
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send {
        self.read(buf)
    }
}

/// Build the response for `source`, honoring a single `Range` in `headers`
pub fn serve_content<S: ContentSource>(method: &Method, headers: &HeaderMap, mut source: S) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET, HEAD")]).into_response();
    }

    let size = source.size();
    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let requested = range::parse(range_header, size);

    let mut response = Response::new(Body::empty());
    let out = response.headers_mut();
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type(source.name())),
    );
    if let Some(modified) = source.modified() {
        if let Ok(value) = HeaderValue::from_str(&http_date(modified)) {
            out.insert(header::LAST_MODIFIED, value);
        }
    }

    let (status, start, length) = match requested {
        RangeRequest::Full => (StatusCode::OK, 0, size),
        RangeRequest::Partial(r) => {
            if let Ok(value) = HeaderValue::from_str(&r.content_range(size)) {
                out.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::PARTIAL_CONTENT, r.start, r.length())
        }
        RangeRequest::Unsatisfiable => {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                out.insert(header::CONTENT_RANGE, value);
            }
            out.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            return response;
        }
    };
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    *response.status_mut() = status;

    if method == Method::HEAD || length == 0 {
        return response;
    }
    if let Err(e) = source.seek_to(start) {
        tracing::warn!(name = source.name(), offset = start, "Seek failed: {}", e);
        return error_response(&e);
    }
    *response.body_mut() = body_stream(source, length);
    response
}

/// Stream exactly `length` bytes from the cursor, ending early if the source does
fn body_stream<S: ContentSource>(source: S, length: u64) -> Body {
    let chunk = source.chunk_size().clamp(1, MAX_CHUNK);
    let stream = futures::stream::unfold((source, length), move |(mut source, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let want = usize::try_from(remaining).map_or(chunk, |r| r.min(chunk));
        let mut buf = vec![0u8; want];
        match source.read_chunk(&mut buf).await {
            Ok(0) => {
                tracing::debug!(name = source.name(), remaining, "Source ended before the response");
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), (source, remaining - n as u64)))
            }
            Err(e) => {
                tracing::warn!(name = source.name(), "Read failed: {}", e);
                Some((Err(e), (source, 0)))
            }
        }
    });
    Body::from_stream(stream)
}

/// Status code for a failed request
pub fn error_response(err: &StreamError) -> Response {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, err.to_string()).into_response()
}

/// RFC 7231 date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// MIME type by file extension
pub fn content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mkv" => "video/x-matroska",
        "mp4" | "m4v" => "video/mp4",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "ts" | "m2ts" => "video/mp2t",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "mpg" | "mpeg" => "video/mpeg",
        "ogv" => "video/ogg",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "srt" => "application/x-subrip",
        "vtt" => "text/vtt",
        "ass" | "ssa" => "text/x-ssa",
        "txt" | "nfo" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}
