use std::io::SeekFrom;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{
        header::{
            ACCEPT_RANGES,
            CONTENT_LENGTH,
            CONTENT_RANGE,
            CONTENT_TYPE,
            ETAG,
            IF_MODIFIED_SINCE,
            IF_NONE_MATCH,
            LAST_MODIFIED,
            LOCATION,
            RANGE,
        },
        HeaderMap,
        HeaderValue,
        Method,
        StatusCode,
        Uri,
    },
    response::{IntoResponse, Response},
    Json,
    Router,
};
use blob_store::BlobError;
use blobstore_utils::{http_date, parse_http_date};
use data_model::{FileInfo, DEFAULT_CONTENT_TYPE};
use file_repo::FileRepo;
use futures::{StreamExt, TryStreamExt};
use tower_http::trace::TraceLayer;

use crate::http_objects::{BlobstoreAPIError, FileParams};

/// Names the source of a server-side copy on PUT.
pub const COPY_FROM_HEADER: &str = "blobstore-copy-from";

/// Append offset on PUT, equivalent to `?offset=`.
pub const OFFSET_HEADER: &str = "blobstore-offset";

#[derive(Clone)]
pub struct RouteState {
    pub repo: FileRepo,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .fallback(file_handler)
        .with_state(route_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();
                    tracing::debug_span!("request", %method, %uri)
                })
                .on_failure(()),
        )
}

/// Every path names a file, so all requests land here.
async fn file_handler(
    State(state): State<RouteState>,
    method: Method,
    uri: Uri,
    Query(params): Query<FileParams>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let result = match decode_name(uri.path()) {
        Ok(name) => match method {
            Method::GET => get_file(&state, &name, &params, &headers, true).await,
            Method::HEAD => get_file(&state, &name, &params, &headers, false).await,
            Method::PUT => put_file(&state, &name, &params, &headers, body).await,
            Method::DELETE => delete_file(&state, &name).await,
            _ => Err(BlobstoreAPIError::method_not_allowed()),
        },
        Err(e) => Err(e),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

fn decode_name(raw: &str) -> Result<String, BlobstoreAPIError> {
    urlencoding::decode(raw)
        .map(|name| name.into_owned())
        .map_err(|_| BlobstoreAPIError::bad_request("path is not valid UTF-8"))
}

async fn get_file(
    state: &RouteState,
    name: &str,
    params: &FileParams,
    headers: &HeaderMap,
    with_body: bool,
) -> Result<Response, BlobstoreAPIError> {
    if let Some(dir) = &params.dir {
        let children = state.repo.list(dir).await?;
        return Ok(Json(children).into_response());
    }

    let file = state.repo.get(name, with_body).await?;
    let info = file.info;
    if not_modified(headers, &info) {
        return Ok(file_response(StatusCode::NOT_MODIFIED, &info, None, Body::empty()));
    }
    if let Some(url) = file.stream.redirect_url() {
        let mut response = StatusCode::FOUND.into_response();
        response.headers_mut().insert(
            LOCATION,
            HeaderValue::from_str(url).map_err(BlobstoreAPIError::internal_error)?,
        );
        return Ok(response);
    }
    if !with_body {
        return Ok(file_response(StatusCode::OK, &info, Some(info.size), Body::empty()));
    }

    let mut stream = file.stream;
    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| ByteRange::parse(v, info.size))
        .unwrap_or(ByteRange::Full);
    match range {
        ByteRange::Full => {
            let body = Body::from_stream(stream.into_byte_stream(Some(info.size)));
            Ok(file_response(StatusCode::OK, &info, Some(info.size), body))
        }
        ByteRange::Partial { start, end } => {
            stream.seek(SeekFrom::Start(start)).await?;
            let len = end - start + 1;
            let body = Body::from_stream(stream.into_byte_stream(Some(len)));
            let mut response = file_response(StatusCode::PARTIAL_CONTENT, &info, Some(len), body);
            response.headers_mut().insert(
                CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{}", info.size))?,
            );
            Ok(response)
        }
        ByteRange::Unsatisfiable => {
            let mut response = (StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable")
                .into_response();
            response.headers_mut().insert(
                CONTENT_RANGE,
                header_value(&format!("bytes */{}", info.size))?,
            );
            Ok(response)
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, BlobstoreAPIError> {
    HeaderValue::from_str(value).map_err(BlobstoreAPIError::internal_error)
}

fn file_response(status: StatusCode, info: &FileInfo, len: Option<u64>, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    if let Some(len) = len {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
    let content_type = if info.content_type.is_empty() {
        DEFAULT_CONTENT_TYPE
    } else {
        info.content_type.as_str()
    };
    if let Ok(v) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, v);
    }
    if info.sha512.is_some() {
        if let Ok(v) = HeaderValue::from_str(&info.quoted_etag()) {
            headers.insert(ETAG, v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&http_date(&info.updated_at)) {
        headers.insert(LAST_MODIFIED, v);
    }
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response
}

/// Conditional GET. `If-None-Match` takes precedence over
/// `If-Modified-Since`.
fn not_modified(headers: &HeaderMap, info: &FileInfo) -> bool {
    if let Some(value) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if info.sha512.is_none() {
            return false;
        }
        let etag = info.quoted_etag();
        return value.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
        });
    }
    headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .is_some_and(|since| info.updated_at.timestamp() <= since.timestamp())
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

impl ByteRange {
    /// Interprets a `Range` header against a blob of `size` bytes.
    /// Malformed and multi-range headers are ignored and the full body is
    /// served.
    fn parse(header: &str, size: u64) -> ByteRange {
        let Some(ranges) = header.trim().strip_prefix("bytes=") else {
            return ByteRange::Full;
        };
        if ranges.contains(',') {
            return ByteRange::Full;
        }
        let Some((first, last)) = ranges.trim().split_once('-') else {
            return ByteRange::Full;
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            // Suffix range: the final `last` bytes.
            let Ok(n) = last.parse::<u64>() else {
                return ByteRange::Full;
            };
            if n == 0 || size == 0 {
                return ByteRange::Unsatisfiable;
            }
            return ByteRange::Partial {
                start: size.saturating_sub(n),
                end: size - 1,
            };
        }

        let Ok(start) = first.parse::<u64>() else {
            return ByteRange::Full;
        };
        let end = if last.is_empty() {
            None
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => Some(end),
                _ => return ByteRange::Full,
            }
        };
        if start >= size {
            return ByteRange::Unsatisfiable;
        }
        ByteRange::Partial {
            start,
            end: end.map_or(size - 1, |e| e.min(size - 1)),
        }
    }
}

async fn put_file(
    state: &RouteState,
    name: &str,
    params: &FileParams,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, BlobstoreAPIError> {
    if let Some(src) = headers.get(COPY_FROM_HEADER) {
        let src = src
            .to_str()
            .map_err(|_| BlobstoreAPIError::bad_request("invalid copy source"))?;
        state.repo.copy(name, &decode_name(src)?).await?;
        return Ok(StatusCode::OK.into_response());
    }

    let offset = match params
        .offset
        .as_deref()
        .or_else(|| headers.get(OFFSET_HEADER).and_then(|v| v.to_str().ok()))
    {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| BlobstoreAPIError::bad_request(&format!("invalid offset: {raw}")))?,
        None => 0,
    };
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    let data = body
        .into_data_stream()
        .map_err(|e| BlobError::Io {
            source: std::io::Error::other(e),
        })
        .boxed();
    state.repo.put(name, data, offset, content_type).await?;
    Ok(StatusCode::OK.into_response())
}

async fn delete_file(state: &RouteState, name: &str) -> Result<Response, BlobstoreAPIError> {
    state.repo.delete(name).await?;
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    #[test]
    fn test_range_parse() {
        let cases = [
            ("bytes=0-4", ByteRange::Partial { start: 0, end: 4 }),
            ("bytes=6-", ByteRange::Partial { start: 6, end: 10 }),
            ("bytes=-5", ByteRange::Partial { start: 6, end: 10 }),
            ("bytes=-50", ByteRange::Partial { start: 0, end: 10 }),
            ("bytes=3-100", ByteRange::Partial { start: 3, end: 10 }),
            ("bytes=11-", ByteRange::Unsatisfiable),
            ("bytes=-0", ByteRange::Unsatisfiable),
            ("bytes=0-1,4-5", ByteRange::Full),
            ("bytes=5-2", ByteRange::Full),
            ("items=0-4", ByteRange::Full),
            ("bytes=x-", ByteRange::Full),
        ];
        for (header, expected) in cases {
            assert_eq!(ByteRange::parse(header, 11), expected, "{header}");
        }
        assert_eq!(ByteRange::parse("bytes=0-", 0), ByteRange::Unsatisfiable);
    }

    #[test]
    fn test_decode_name() {
        assert_eq!(decode_name("/dir%20one/a%2Bb").unwrap(), "/dir one/a+b");
        assert!(decode_name("/bad%ff").is_err());
    }

    fn hashed_info() -> FileInfo {
        let mut info = FileInfo::new("/foo", "text/plain", "postgres");
        let mut hasher = blobstore_utils::ResumableSha512::new();
        hasher.update(b"hello");
        info.record_digest(&hasher);
        info
    }

    #[test]
    fn test_not_modified() {
        let info = hashed_info();
        let mut headers = HeaderMap::new();
        assert!(!not_modified(&headers, &info));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_str(&info.quoted_etag()).unwrap());
        assert!(not_modified(&headers, &info));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"other\", *"));
        assert!(not_modified(&headers, &info));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"other\""));
        let later = http_date(&(Utc::now() + Duration::hours(1)));
        headers.insert(IF_MODIFIED_SINCE, HeaderValue::from_str(&later).unwrap());
        assert!(!not_modified(&headers, &info));

        headers.remove(IF_NONE_MATCH);
        assert!(not_modified(&headers, &info));

        let earlier = http_date(&(Utc::now() - Duration::hours(1)));
        headers.insert(IF_MODIFIED_SINCE, HeaderValue::from_str(&earlier).unwrap());
        assert!(!not_modified(&headers, &info));
    }

    #[test]
    fn test_file_response_headers() {
        let info = hashed_info();
        let response = file_response(StatusCode::OK, &info, Some(5), Body::empty());
        let headers = response.headers();
        assert_eq!(headers[CONTENT_LENGTH], "5");
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(headers[ETAG], info.quoted_etag().as_str());
        assert_eq!(headers[ACCEPT_RANGES], "bytes");
        assert!(headers.contains_key(LAST_MODIFIED));
    }
}
